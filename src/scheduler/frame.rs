//! Task frames
//!
//! A frame is the runtime's record of one suspendable computation: its
//! future, its result slot, its position in whatever queue it is waiting
//! in, and the links that chain it to the frame awaiting it.
//!
//! ## Scheduling state
//!
//! The state word is a small bit set:
//!
//! - `QUEUED`: sitting in the ready queue
//! - `RUNNING`: being polled by a worker
//! - `NOTIFIED`: woken while running, requeued when the poll returns
//! - `PARKED`: waiting in a timer bucket or the pending table; only the
//!   owner of that container may resume it
//! - `DONE`: finished, never polled again
//!
//! A frame is in at most one queue at a time because every enqueue goes
//! through a successful transition into `QUEUED`.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use super::arena::FrameId;

/// Type-erased output of a frame body
pub(crate) type FrameOutput = Box<dyn Any + Send>;

/// Type-erased frame body
pub(crate) type FrameBody = BoxFuture<'static, FrameOutput>;

const IDLE: u8 = 0;
const QUEUED: u8 = 1;
const RUNNING: u8 = 2;
const NOTIFIED: u8 = 4;
const PARKED: u8 = 8;
const DONE: u8 = 16;

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Where the result of a remotely requested frame must be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseRoute {
    /// Requester's endpoint, port already replaced by its advertised port
    pub endpoint: SocketAddr,
    /// Correlation id copied from the request
    pub correlation_id: u64,
    /// Function identity copied from the request
    pub function_id: u16,
    /// Requester's restart counter, echoed in the response
    pub restart_counter: u16,
}

/// Per-call context shared by a root frame and every frame it awaits
#[derive(Debug)]
pub struct CallContext {
    correlation_id: u64,
    response: Option<ResponseRoute>,
}

impl CallContext {
    /// Context with a freshly generated correlation id
    pub(crate) fn fresh() -> Arc<Self> {
        Arc::new(Self {
            correlation_id: NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed),
            response: None,
        })
    }

    /// Context for a frame created to answer a remote request
    pub(crate) fn answering(route: ResponseRoute) -> Arc<Self> {
        Arc::new(Self {
            correlation_id: NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed),
            response: Some(route),
        })
    }

    /// Correlation id used for RPCs issued under this context
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Response route, set only for frames answering a remote request
    pub fn response_route(&self) -> Option<ResponseRoute> {
        self.response
    }
}

/// Whether a frame counts towards the scheduler's running tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// User or remote-request task
    Task,
    /// Runtime bookkeeping such as RPC timeouts
    Internal,
}

/// A suspendable unit of work
pub struct Frame {
    id: FrameId,
    kind: FrameKind,
    body: Mutex<Option<FrameBody>>,
    state: AtomicU8,
    sync: AtomicU64,
    refs: AtomicUsize,
    scheduled: AtomicBool,
    deadline: AtomicU64,
    awaiter: AtomicU64,
    handoff: AtomicU64,
    queue_link: AtomicU64,
    context: Mutex<Arc<CallContext>>,
    result: Mutex<Option<FrameOutput>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl Frame {
    pub(crate) fn new(id: FrameId, body: FrameBody, context: Arc<CallContext>, kind: FrameKind) -> Self {
        Self::build(id, Some(body), context, kind)
    }

    #[cfg(test)]
    pub(crate) fn detached(id: FrameId, context: Arc<CallContext>) -> Self {
        Self::build(id, None, context, FrameKind::Task)
    }

    fn build(id: FrameId, body: Option<FrameBody>, context: Arc<CallContext>, kind: FrameKind) -> Self {
        Self {
            id,
            kind,
            body: Mutex::new(body),
            state: AtomicU8::new(IDLE),
            sync: AtomicU64::new(0),
            refs: AtomicUsize::new(1),
            scheduled: AtomicBool::new(false),
            deadline: AtomicU64::new(0),
            awaiter: AtomicU64::new(FrameId::NONE_BITS),
            handoff: AtomicU64::new(FrameId::NONE_BITS),
            queue_link: AtomicU64::new(FrameId::NONE_BITS),
            context: Mutex::new(context),
            result: Mutex::new(None),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        }
    }

    /// Identity of this frame
    pub fn id(&self) -> FrameId {
        self.id
    }

    pub(crate) fn is_internal(&self) -> bool {
        self.kind == FrameKind::Internal
    }

    /// Current call context
    pub fn context(&self) -> Arc<CallContext> {
        Arc::clone(&self.context.lock())
    }

    pub(crate) fn set_context(&self, context: Arc<CallContext>) {
        *self.context.lock() = context;
    }

    /// Publish this frame's writes to whichever thread resumes it next
    pub(crate) fn sync_release(&self) {
        self.sync.fetch_add(1, Ordering::Release);
    }

    /// Observe the writes published by the last `sync_release`
    pub(crate) fn sync_acquire(&self) {
        self.sync.load(Ordering::Acquire);
    }

    // Reference counting

    pub(crate) fn acquire_ref(&self) {
        self.refs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference, returning how many remain
    pub(crate) fn release_ref(&self) -> usize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Claim the frame for the scheduler. Succeeds once.
    pub(crate) fn mark_scheduled(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    // Links

    /// Wake deadline in clock nanoseconds
    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Relaxed)
    }

    pub(crate) fn set_deadline(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Relaxed);
    }

    pub(crate) fn set_awaiter(&self, parent: FrameId) {
        self.awaiter.store(parent.to_bits(), Ordering::Release);
    }

    pub(crate) fn take_awaiter(&self) -> Option<FrameId> {
        FrameId::from_bits(self.awaiter.swap(FrameId::NONE_BITS, Ordering::AcqRel))
    }

    pub(crate) fn set_handoff(&self, child: FrameId) {
        self.handoff.store(child.to_bits(), Ordering::Release);
    }

    pub(crate) fn take_handoff(&self) -> Option<FrameId> {
        FrameId::from_bits(self.handoff.swap(FrameId::NONE_BITS, Ordering::AcqRel))
    }

    pub(crate) fn queue_link(&self) -> Option<FrameId> {
        FrameId::from_bits(self.queue_link.load(Ordering::Relaxed))
    }

    pub(crate) fn set_queue_link(&self, next: Option<FrameId>) {
        self.queue_link.store(FrameId::option_bits(next), Ordering::Relaxed);
    }

    // State transitions

    fn transition(&self, mut next: impl FnMut(u8) -> Option<u8>) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| next(cur))
            .is_ok()
    }

    /// Wake from a foreign waker or a yield. True when the caller must enqueue.
    pub(crate) fn try_wake(&self) -> bool {
        let mut enqueue = false;
        self.transition(|cur| {
            if cur & (DONE | PARKED | QUEUED | NOTIFIED) != 0 {
                None
            } else if cur & RUNNING != 0 {
                enqueue = false;
                Some(cur | NOTIFIED)
            } else {
                enqueue = true;
                Some(QUEUED)
            }
        }) && enqueue
    }

    /// Resume a parked frame. True when the caller must enqueue.
    pub(crate) fn try_resume(&self) -> bool {
        let mut enqueue = false;
        self.transition(|cur| {
            if cur & PARKED == 0 {
                None
            } else if cur & RUNNING != 0 {
                enqueue = false;
                Some((cur & !PARKED) | NOTIFIED)
            } else {
                enqueue = true;
                Some(QUEUED)
            }
        }) && enqueue
    }

    /// Park the frame while it is running. Foreign wakes are ignored from now
    /// until the owner resumes it.
    pub(crate) fn park(&self) {
        self.transition(|cur| Some((cur | PARKED) & !NOTIFIED));
    }

    /// Park a frame that has never run
    pub(crate) fn park_idle(&self) -> bool {
        self.transition(|cur| (cur == IDLE).then_some(PARKED))
    }

    /// Take the frame for polling
    pub(crate) fn begin_run(&self) -> bool {
        self.transition(|cur| match cur {
            IDLE | QUEUED | PARKED => Some(RUNNING),
            _ => None,
        })
    }

    /// Leave the running state after a pending poll. True when the frame was
    /// notified meanwhile and must be requeued.
    pub(crate) fn end_run(&self) -> bool {
        let mut requeue = false;
        self.transition(|cur| {
            requeue = cur & NOTIFIED != 0;
            if requeue {
                Some(QUEUED)
            } else if cur & PARKED != 0 {
                Some(PARKED)
            } else {
                Some(IDLE)
            }
        });
        requeue
    }

    /// Whether the frame has finished
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    pub(crate) fn is_parked(&self) -> bool {
        self.state.load(Ordering::Acquire) & PARKED != 0
    }

    // Body and result

    pub(crate) fn poll_body(&self, cx: &mut Context<'_>) -> Poll<FrameOutput> {
        let mut body = self.body.lock();
        let Some(future) = body.as_mut() else {
            log::error!("Frame {:?} polled without a body", self.id);
            return Poll::Pending;
        };
        match future.as_mut().poll(cx) {
            Poll::Ready(output) => {
                *body = None;
                Poll::Ready(output)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn store_result(&self, output: FrameOutput) {
        *self.result.lock() = Some(output);
    }

    pub(crate) fn take_result(&self) -> Option<FrameOutput> {
        self.result.lock().take()
    }

    pub(crate) fn with_result<R>(&self, f: impl FnOnce(Option<&FrameOutput>) -> R) -> R {
        let result = self.result.lock();
        f(result.as_ref())
    }

    /// Move to `DONE` and wake every thread blocked in `wait_done`
    pub(crate) fn mark_done(&self) {
        self.state.store(DONE, Ordering::Release);
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    pub(crate) fn wait_done(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }

    /// Returns false if the timeout elapsed first
    pub(crate) fn wait_done_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::detached(FrameId::new(0, 0), CallContext::fresh())
    }

    #[test]
    fn test_wake_idle_enqueues_once() {
        let frame = frame();
        assert!(frame.try_wake());
        assert!(!frame.try_wake());
        assert!(frame.begin_run());
    }

    #[test]
    fn test_wake_while_running_requeues_after_poll() {
        let frame = frame();
        assert!(frame.begin_run());
        assert!(!frame.try_wake());
        assert!(frame.end_run());
        // Requeued frames are already QUEUED.
        assert!(!frame.try_wake());
    }

    #[test]
    fn test_parked_frame_ignores_foreign_wakes() {
        let frame = frame();
        assert!(frame.begin_run());
        frame.park();
        assert!(!frame.end_run());
        assert!(!frame.try_wake());
        assert!(frame.is_parked());
        assert!(frame.try_resume());
        assert!(!frame.try_resume());
    }

    #[test]
    fn test_resume_during_poll_sets_notified() {
        let frame = frame();
        assert!(frame.begin_run());
        frame.park();
        assert!(!frame.try_resume());
        assert!(frame.end_run());
        assert!(!frame.is_parked());
    }

    #[test]
    fn test_done_frame_never_runs() {
        let frame = frame();
        frame.mark_done();
        assert!(frame.is_done());
        assert!(!frame.begin_run());
        assert!(!frame.try_wake());
        assert!(frame.wait_done_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_park_idle_only_from_idle() {
        let frame = frame();
        assert!(frame.park_idle());
        assert!(!frame.park_idle());
        assert!(frame.try_resume());
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        let a = CallContext::fresh();
        let b = CallContext::fresh();
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert!(a.response_route().is_none());
    }
}
