//! Tasks and the context they run in
//!
//! A [`Task`] is a counted handle to a frame. Outside the runtime it is used
//! to commit the frame and wait for its result; inside a running body it can
//! be awaited through [`TaskContext::join`], which runs it as a nested call
//! without a trip through the ready queue.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::error::{Error, Result};
use crate::rpc::codec;
use crate::rpc::service::RpcService;
use crate::rpc::{Broadcast, Call, RemoteFn};
use crate::runtime::RuntimeShared;
use crate::scheduler::{Frame, FrameId, Scheduler};
use crate::timer::Clock;

/// Handle to a task's frame
///
/// Cloning a handle adds a reference to the frame; the frame's storage is
/// released once the last handle is gone and the frame has finished (or was
/// never scheduled).
pub struct Task<T> {
    id: FrameId,
    scheduler: Arc<Scheduler>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> Task<T> {
    /// Adopt the reference a freshly created frame starts with
    pub(crate) fn from_frame(frame: &Frame, scheduler: Arc<Scheduler>) -> Self {
        Self {
            id: frame.id(),
            scheduler,
            _marker: PhantomData,
        }
    }

    /// Identity of the underlying frame
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Correlation id the task uses for RPCs
    pub fn correlation_id(&self) -> Option<u64> {
        self.frame().map(|frame| frame.context().correlation_id())
    }

    /// Whether the task has finished
    pub fn is_done(&self) -> bool {
        self.frame().map_or(true, |frame| frame.is_done())
    }

    /// Block the calling thread until the task finishes
    pub fn wait(&self) {
        if let Some(frame) = self.frame() {
            frame.wait_done();
        }
    }

    /// Block until the task finishes or `timeout` elapses. Returns whether the
    /// task finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.frame()
            .map_or(true, |frame| frame.wait_done_timeout(timeout))
    }

    /// Move the result out of the frame
    pub fn take_result(&self) -> Option<T> {
        let output = self.frame()?.take_result()?;
        output.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Copy of the result, leaving it in place
    pub fn get_result(&self) -> Option<T>
    where
        T: Clone,
    {
        self.frame()?
            .with_result(|output| output.and_then(|any| any.downcast_ref::<T>()).cloned())
    }

    /// Wait for the task and take its result
    pub fn join(self) -> Option<T> {
        self.wait();
        self.take_result()
    }

    fn frame(&self) -> Option<Arc<Frame>> {
        self.scheduler.frame(self.id)
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        if let Some(frame) = self.scheduler.frame(self.id) {
            frame.acquire_ref();
        }
        Self {
            id: self.id,
            scheduler: Arc::clone(&self.scheduler),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        self.scheduler.release_ref(self.id);
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

/// Runtime access for the body of one frame
#[derive(Clone)]
pub struct TaskContext {
    shared: Arc<RuntimeShared>,
    frame: FrameId,
}

impl TaskContext {
    pub(crate) fn new(shared: Arc<RuntimeShared>, frame: FrameId) -> Self {
        Self { shared, frame }
    }

    /// Frame this context belongs to
    pub fn frame_id(&self) -> FrameId {
        self.frame
    }

    /// Correlation id used for RPCs issued from this frame
    pub fn correlation_id(&self) -> u64 {
        self.frame()
            .map_or(0, |frame| frame.context().correlation_id())
    }

    /// The runtime clock
    pub fn clock(&self) -> Clock {
        self.shared.clock
    }

    /// Current clock reading in nanoseconds
    pub fn now(&self) -> u64 {
        self.shared.clock.now()
    }

    /// Address peers reach this runtime at
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.transport.local_addr()
    }

    /// Suspend for at least `duration`
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.shared.clock.deadline_after(duration))
    }

    /// Suspend until the clock reaches `deadline`
    pub fn sleep_until(&self, deadline: u64) -> Sleep {
        Sleep {
            cx: self.clone(),
            deadline,
            registered: false,
        }
    }

    /// Give other ready frames a turn
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Create a task that has not been started
    pub fn task<F, Fut, T>(&self, f: F) -> Task<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.shared.create_task(f)
    }

    /// Run `task` as a nested call of this frame and wait for its result
    pub fn join<T: Send + 'static>(&self, task: Task<T>) -> Join<T> {
        Join {
            cx: self.clone(),
            task: Some(task),
            linked: false,
        }
    }

    /// Create a task and join it
    pub fn invoke<F, Fut, T>(&self, f: F) -> Join<T>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.task(f);
        self.join(task)
    }

    /// Build a request to one peer
    pub fn call<A, R>(&self, function: RemoteFn<A, R>, args: &A) -> Call<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        Call::new(self.clone(), function.id(), codec::encode(args))
    }

    /// Build a request to several peers
    pub fn broadcast<A, R>(&self, function: RemoteFn<A, R>, args: &A) -> Broadcast<R>
    where
        A: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        Broadcast::new(self.clone(), function.id(), codec::encode(args))
    }

    pub(crate) fn frame(&self) -> Option<Arc<Frame>> {
        self.shared.scheduler.frame(self.frame)
    }

    pub(crate) fn rpc(&self) -> &Arc<RpcService> {
        &self.shared.rpc
    }

    pub(crate) fn default_rpc_timeout(&self) -> Duration {
        self.shared.config.default_rpc_timeout
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext").field("frame", &self.frame).finish()
    }
}

/// Future returned by [`TaskContext::sleep`]
#[derive(Debug)]
pub struct Sleep {
    cx: TaskContext,
    deadline: u64,
    registered: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.registered {
            return Poll::Ready(());
        }
        let Some(frame) = this.cx.frame() else {
            return Poll::Ready(());
        };
        // Another awaitable in the same body owns the frame until it resumes.
        if frame.is_parked() {
            return Poll::Pending;
        }

        frame.set_deadline(this.deadline);
        frame.park();
        frame.sync_release();
        this.registered = true;
        this.cx.shared.timer.register(&frame);
        Poll::Pending
    }
}

/// Future returned by [`TaskContext::yield_now`]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Future returned by [`TaskContext::join`]
pub struct Join<T> {
    cx: TaskContext,
    task: Option<Task<T>>,
    linked: bool,
}

impl<T: Send + 'static> Join<T> {
    fn finish(&mut self) -> Result<T> {
        let task = self.task.take().ok_or_else(|| Error::RuntimeError {
            reason: "Join polled after completion".to_string(),
        })?;
        task.take_result().ok_or_else(|| Error::RuntimeError {
            reason: format!("Result of {:?} was already taken", task.id()),
        })
    }

    fn link(&mut self, child: &Frame) -> Result<()> {
        let parent = self.cx.frame().ok_or_else(|| Error::RuntimeError {
            reason: "Awaiting frame no longer exists".to_string(),
        })?;
        if parent.id() == child.id() {
            return Err(Error::RuntimeError {
                reason: "A task cannot await itself".to_string(),
            });
        }
        if !child.mark_scheduled() {
            return Err(Error::RuntimeError {
                reason: format!("{:?} is already running elsewhere", child.id()),
            });
        }

        child.acquire_ref();
        child.set_context(parent.context());
        child.set_awaiter(parent.id());
        parent.park();
        parent.set_handoff(child.id());
        parent.sync_release();
        Ok(())
    }
}

impl<T: Send + 'static> Future for Join<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<T>> {
        let this = self.get_mut();
        let Some(task) = this.task.as_ref() else {
            return Poll::Ready(this.finish());
        };
        if !Arc::ptr_eq(task.scheduler(), &this.cx.shared.scheduler) {
            return Poll::Ready(Err(Error::RuntimeError {
                reason: "Task belongs to another runtime".to_string(),
            }));
        }
        let Some(child) = task.frame() else {
            return Poll::Ready(Err(Error::RuntimeError {
                reason: format!("{:?} no longer exists", task.id()),
            }));
        };

        if child.is_done() {
            return Poll::Ready(this.finish());
        }
        if this.linked || this.cx.frame().map_or(false, |parent| parent.is_parked()) {
            return Poll::Pending;
        }
        match this.link(&child) {
            Ok(()) => {
                this.linked = true;
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl<T> fmt::Debug for Join<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Join")
            .field("task", &self.task.as_ref().map(|task| task.id))
            .field("linked", &self.linked)
            .finish()
    }
}
