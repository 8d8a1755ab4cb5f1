//! # RpcRoutines
//!
//! A coroutine runtime for request/response services: lightweight task
//! frames multiplexed onto a fixed pool of worker threads, a bucketed timer
//! wheel for sleeps and timeouts, and remote calls correlated back to the
//! frame that issued them.
//!
//! ## Features
//!
//! - **Tasks**: Frames driven by `async` bodies, awaitable from other tasks as
//!   nested calls that resume their parent in place
//! - **Timer wheel**: Sleeps and RPC timeouts resumed within one tick of their
//!   deadline
//! - **RPC**: Single and multi-destination requests finishing on any, all or a
//!   majority of answers, with per-response callbacks
//! - **Wire format**: A fixed 32-byte header followed by a bincode payload,
//!   over TCP or an in-process network
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rpc_routines::prelude::*;
//! use std::time::Duration;
//!
//! remote_fn!(ADD: (i32, i32) => i32 = 1);
//!
//! let network = MemoryNetwork::new();
//! let server = Runtime::with_transport(
//!     RuntimeConfig::default(),
//!     network.bind("127.0.0.1:7001".parse().unwrap()),
//! ).unwrap();
//! server.register(ADD, |_cx, (a, b)| async move { a + b });
//! server.start().unwrap();
//!
//! let client = Runtime::with_transport(
//!     RuntimeConfig::default(),
//!     network.bind("127.0.0.1:7002".parse().unwrap()),
//! ).unwrap();
//! client.start().unwrap();
//!
//! let peer = server.local_addr();
//! let sum = client.block_on(move |cx| async move {
//!     cx.call(ADD, &(2, 3)).on(peer).timeout(Duration::from_millis(100)).await
//! });
//! assert_eq!(sum, Ok(Ok(5)));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod net;
pub mod rpc;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod timer;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::net::{MemoryNetwork, TcpTransport, Transport};
    pub use crate::rpc::{Broadcast, Call, FinishCondition, RemoteFn};
    pub use crate::runtime::{Runtime, RuntimeConfig, RuntimeStats};
    pub use crate::scheduler::SchedulerConfig;
    pub use crate::task::{Task, TaskContext};
    pub use crate::timer::TimerConfig;

    /// Declare a typed remote function identity
    ///
    /// `remote_fn!(NAME: Args => Ret = id);` expands to a `RemoteFn<Args, Ret>`
    /// constant named after the function.
    #[macro_export]
    macro_rules! remote_fn {
        ($vis:vis $name:ident : $args:ty => $ret:ty = $id:expr) => {
            $vis const $name: $crate::rpc::RemoteFn<$args, $ret> =
                $crate::rpc::RemoteFn::new($id, stringify!($name));
        };
    }

    pub use crate::remote_fn;
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;
