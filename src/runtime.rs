//! Runtime assembly
//!
//! A [`Runtime`] owns one scheduler, one timer wheel and one transport, wires
//! the RPC service between them and exposes the control surface used by
//! applications: register remote functions, start, commit tasks, stop, wait.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::error::{Error, Result};
use crate::net::{Inbound, MemoryNetwork, Transport};
use crate::rpc::codec::DEFAULT_MAX_MESSAGE_LEN;
use crate::rpc::service::RpcService;
use crate::rpc::{MessageType, RemoteFn, RpcStats, WireHeader};
use crate::scheduler::core::Responder;
use crate::scheduler::frame::{CallContext, FrameKind, FrameOutput, ResponseRoute};
use crate::scheduler::{ArenaStats, Scheduler, SchedulerConfig, SchedulerStats};
use crate::task::{Task, TaskContext};
use crate::timer::{Clock, TimerConfig, TimerStats, TimerWheel};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool settings
    pub scheduler: SchedulerConfig,
    /// Timer wheel settings
    pub timer: TimerConfig,
    /// Generation of this process, echoed by peers in their responses.
    /// Responses carrying another value are discarded.
    pub restart_counter: u16,
    /// Timeout for RPCs that do not set their own
    pub default_rpc_timeout: Duration,
    /// Largest message sent or answered, header included
    pub max_message_len: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            timer: TimerConfig::default(),
            restart_counter: 0,
            default_rpc_timeout: Duration::from_secs(1),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// Snapshot of every runtime counter
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    /// Scheduler counters
    pub scheduler: SchedulerStats,
    /// Frame storage counters
    pub arena: ArenaStats,
    /// Timer wheel counters
    pub timer: TimerStats,
    /// RPC counters
    pub rpc: RpcStats,
}

/// State shared by the runtime handle and every task context
pub(crate) struct RuntimeShared {
    pub(crate) config: RuntimeConfig,
    pub(crate) clock: Clock,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) timer: Arc<TimerWheel>,
    pub(crate) rpc: Arc<RpcService>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl RuntimeShared {
    /// Allocate a task with a fresh call context
    pub(crate) fn create_task<F, Fut, T>(self: &Arc<Self>, f: F) -> Task<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = Arc::clone(self);
        let frame = self
            .scheduler
            .create_frame(CallContext::fresh(), FrameKind::Task, move |id| {
                let body = f(TaskContext::new(shared, id));
                async move { Box::new(body.await) as FrameOutput }.boxed()
            });
        Task::from_frame(&frame, Arc::clone(&self.scheduler))
    }

    /// Start a root task answering a remote request
    fn on_request(self: &Arc<Self>, header: &WireHeader, from: SocketAddr, payload: &[u8]) -> Result<()> {
        let handler = self.rpc.resolve(header.function_id)?;
        let factory = (*handler)(payload)?;

        let route = ResponseRoute {
            endpoint: from,
            correlation_id: header.correlation_id,
            function_id: header.function_id,
            restart_counter: header.restart_counter,
        };
        let shared = Arc::clone(self);
        let id = self
            .scheduler
            .create_frame(CallContext::answering(route), FrameKind::Task, move |id| {
                factory(TaskContext::new(shared, id))
            })
            .id();

        let committed = self.scheduler.commit(id);
        self.scheduler.release_ref(id);
        committed
    }
}

/// Routes decoded messages from the transport into the runtime
struct InboundRouter {
    shared: Weak<RuntimeShared>,
}

impl Inbound for InboundRouter {
    fn on_message(&self, header: WireHeader, from: SocketAddr, payload: Vec<u8>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Peers answer on the port their header advertises, not the one the
        // message happened to leave from.
        let peer = SocketAddr::new(from.ip(), header.responder_port);

        match header.message_type() {
            Some(MessageType::Request) => {
                if let Err(e) = shared.on_request(&header, peer, &payload) {
                    log::warn!(
                        "Rejected request {} for function {} from {}: {}",
                        header.correlation_id,
                        header.function_id,
                        peer,
                        e
                    );
                }
            }
            Some(MessageType::Response) => shared.rpc.on_response(&header, peer, &payload),
            None => log::warn!("Dropping message with unknown type {} from {}", header.flags, peer),
        }
    }
}

/// The runtime: scheduler, timer wheel, transport and RPC service
///
/// # Example
///
/// ```no_run
/// use rpc_routines::prelude::*;
///
/// let runtime = Runtime::new().unwrap();
/// runtime.start().unwrap();
/// let sum = runtime.block_on(|cx| async move {
///     cx.sleep(std::time::Duration::from_millis(10)).await;
///     1 + 1
/// });
/// assert_eq!(sum, Ok(2));
/// runtime.stop();
/// runtime.wait();
/// ```
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    started: AtomicBool,
    finished: AtomicBool,
}

impl Runtime {
    /// Create a runtime with the default configuration on a private
    /// in-memory network
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime on a private in-memory network
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let network = MemoryNetwork::new();
        let transport = network.bind(SocketAddr::from(([127, 0, 0, 1], 0)));
        Self::with_transport(config, transport)
    }

    /// Create a runtime that talks to its peers through `transport`
    pub fn with_transport(config: RuntimeConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let clock = Clock::new();
        let scheduler = Scheduler::new(config.scheduler.clone())?;
        let timer = TimerWheel::new(config.timer.clone(), clock, Arc::clone(&scheduler))?;
        let rpc = Arc::new(RpcService::new(
            Arc::clone(&scheduler),
            Arc::clone(&timer),
            Arc::clone(&transport),
            config.restart_counter,
            config.max_message_len,
        ));
        let responder: Weak<dyn Responder> = Arc::downgrade(&rpc) as Weak<dyn Responder>;
        scheduler.set_responder(responder);

        log::info!(
            "Initializing runtime on {} with {} workers",
            transport.local_addr(),
            scheduler.num_workers()
        );

        Ok(Self {
            shared: Arc::new(RuntimeShared {
                config,
                clock,
                scheduler,
                timer,
                rpc,
                transport,
            }),
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    /// Register the local implementation of `function`
    pub fn register<A, R, F, Fut>(&self, function: RemoteFn<A, R>, handler: F) -> &Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(TaskContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.shared.rpc.registry().write().register(function, handler);
        self
    }

    /// Start the timer wheel, the transport and the worker threads
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::RuntimeError {
                reason: "Runtime already started".to_string(),
            });
        }

        self.shared.timer.start()?;
        let router = Arc::new(InboundRouter {
            shared: Arc::downgrade(&self.shared),
        });
        self.shared.transport.start(router)?;
        self.shared.scheduler.start()?;
        Ok(())
    }

    /// Refuse new commits and ask every thread to finish. Committed tasks
    /// still run to completion.
    pub fn stop(&self) {
        self.shared.scheduler.stop();
        self.shared.timer.stop();
        self.shared.transport.stop();
    }

    /// Join every runtime thread. Call after [`stop`](Self::stop).
    pub fn wait(&self) {
        self.shared.timer.wait();
        self.shared.transport.wait();
        self.shared.scheduler.wait();

        if !self.finished.swap(true, Ordering::AcqRel) {
            let dropped = self.shared.scheduler.clear_frames();
            if dropped > 0 {
                log::debug!("Dropped {} unfinished frames at shutdown", dropped);
            }
        }
    }

    /// Create a task without starting it
    pub fn task<F, Fut, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.create_task(f)
    }

    /// Hand a task to the scheduler
    pub fn commit<T: Send + 'static>(&self, task: &Task<T>) -> Result<()> {
        if !Arc::ptr_eq(task.scheduler(), &self.shared.scheduler) {
            return Err(Error::RuntimeError {
                reason: "Task belongs to another runtime".to_string(),
            });
        }
        self.shared.scheduler.commit(task.id())
    }

    /// Create and commit a task
    pub fn spawn<F, Fut, T>(&self, f: F) -> Result<Task<T>>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.task(f);
        self.commit(&task)?;
        Ok(task)
    }

    /// Run a task to completion, blocking the calling thread
    pub fn block_on<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.spawn(f)?;
        let id = task.id();
        task.join().ok_or_else(|| Error::RuntimeError {
            reason: format!("Task {:?} finished without a result", id),
        })
    }

    /// Address peers reach this runtime at
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.transport.local_addr()
    }

    /// The clock used for sleeps and timeouts
    pub fn clock(&self) -> Clock {
        self.shared.clock
    }

    /// Requests waiting for responses
    pub fn pending_requests(&self) -> usize {
        self.shared.rpc.pending_requests()
    }

    /// Get runtime statistics
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            scheduler: self.shared.scheduler.stats(),
            arena: self.shared.scheduler.arena_stats(),
            timer: self.shared.timer.stats(),
            rpc: self.shared.rpc.stats(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        if self.started.load(Ordering::Acquire) {
            self.stop();
        }
        self.wait();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("local_addr", &self.local_addr())
            .field("scheduler", &self.shared.scheduler)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
