//! Common test harness for rpc-routines tests
//!
//! Builds small runtimes with short park and tick intervals, and clusters of
//! peers sharing one in-memory network.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use rpc_routines::prelude::*;
use rpc_routines::scheduler::ArenaStats;

/// Configuration tuned for tests: few workers, short parks, 1ms ticks
pub fn test_config(num_workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        scheduler: SchedulerConfig {
            num_workers,
            park_timeout_ms: 5,
            park_jitter_ms: 2,
            ..Default::default()
        },
        timer: TimerConfig {
            num_buckets: 1024,
            precision: Duration::from_millis(1),
            ..Default::default()
        },
        default_rpc_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// A started runtime on a private network
pub fn started_runtime(num_workers: usize) -> Runtime {
    let runtime = Runtime::with_config(test_config(num_workers)).unwrap();
    runtime.start().unwrap();
    runtime
}

/// Stop a runtime and join its threads
pub fn shutdown(runtime: &Runtime) {
    runtime.stop();
    runtime.wait();
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

/// Wait for workers to drop their references to finished frames
pub fn settle(runtime: &Runtime) -> ArenaStats {
    wait_until(Duration::from_secs(2), || runtime.stats().arena.live == 0);
    runtime.stats().arena
}

/// Loopback address with the given port
pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Runtimes sharing one in-memory network
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub peers: Vec<Runtime>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            peers: Vec::new(),
        }
    }

    /// Add a peer at `port`. `setup` registers its functions before it starts.
    pub fn peer(&mut self, port: u16, setup: impl FnOnce(&Runtime)) -> SocketAddr {
        self.peer_with(port, test_config(2), setup)
    }

    pub fn peer_with(&mut self, port: u16, config: RuntimeConfig, setup: impl FnOnce(&Runtime)) -> SocketAddr {
        let runtime = Runtime::with_transport(config, self.network.bind(addr(port))).unwrap();
        setup(&runtime);
        runtime.start().unwrap();
        let local = runtime.local_addr();
        self.peers.push(runtime);
        local
    }

    /// Peer added by the `index`th call to `peer`
    pub fn runtime(&self, index: usize) -> &Runtime {
        &self.peers[index]
    }

    pub fn shutdown(&self) {
        for runtime in &self.peers {
            runtime.stop();
        }
        for runtime in &self.peers {
            runtime.wait();
        }
    }
}

/// Define a test that receives a started runtime and shuts it down afterwards
///
/// Usage:
/// ```ignore
/// rr_test!(fn my_test(runtime) {
///     // test code here
/// });
/// ```
#[macro_export]
macro_rules! rr_test {
    (fn $name:ident($runtime:ident) $body:block) => {
        $crate::rr_test!(fn $name($runtime, 2) $body);
    };
    (fn $name:ident($runtime:ident, $workers:expr) $body:block) => {
        #[test]
        fn $name() {
            let $runtime = $crate::common::started_runtime($workers);
            $body
            $crate::common::shutdown(&$runtime);
        }
    };
}
