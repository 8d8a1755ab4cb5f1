//! Worker threads
//!
//! Each worker drains the shared ready queue into a local batch and resumes
//! the frames one by one. Completing a child jumps straight back into its
//! parent and a parent that just linked a child continues with that child,
//! so a chain of nested calls runs in a flat loop on one thread.

use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::sync::atomic::Ordering;
use futures::task::ArcWake;
use crate::error::{Error, Result};
use super::arena::FrameId;
use super::core::Scheduler;
use super::frame::Frame;

/// Unique identifier for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// Get the numeric ID
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

pub(super) fn spawn(id: WorkerId, name: String, scheduler: Weak<Scheduler>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(id, scheduler))
        .map_err(|e| Error::RuntimeError {
            reason: format!("Failed to spawn worker thread: {}", e),
        })
}

fn worker_loop(id: WorkerId, scheduler: Weak<Scheduler>) {
    log::debug!("Worker {} started", id.as_usize());

    loop {
        let Some(scheduler) = scheduler.upgrade() else {
            // Scheduler has been dropped
            break;
        };

        let mut batch = {
            let mut ready = scheduler.ready.lock();
            if ready.is_empty() {
                if scheduler.should_exit() {
                    break;
                }
                let timeout = scheduler.park_timeout();
                scheduler.ready_cv.wait_for(&mut ready, timeout);
            }
            std::mem::take(&mut *ready)
        };

        while let Some(frame) = batch.pop_head(scheduler.arena()) {
            scheduler.run_frame(frame);
        }
    }

    log::debug!("Worker {} exiting", id.as_usize());
}

/// Waker handed to every poll; waking it reschedules the frame
struct FrameWaker {
    scheduler: Weak<Scheduler>,
    frame: FrameId,
}

impl ArcWake for FrameWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(scheduler) = arc_self.scheduler.upgrade() {
            scheduler.wake(arc_self.frame);
        }
    }
}

impl Scheduler {
    /// Resume `frame` and keep going through the chain of frames it hands
    /// control to.
    pub(super) fn run_frame(self: &Arc<Self>, frame: Arc<Frame>) {
        let mut current = Some(frame);

        while let Some(frame) = current.take() {
            frame.sync_acquire();
            if !frame.begin_run() {
                continue;
            }
            self.resumed.fetch_add(1, Ordering::Relaxed);

            let waker = futures::task::waker(Arc::new(FrameWaker {
                scheduler: Arc::downgrade(self),
                frame: frame.id(),
            }));
            let mut cx = Context::from_waker(&waker);

            match frame.poll_body(&mut cx) {
                Poll::Ready(output) => {
                    frame.store_result(output);
                    current = self.complete(&frame).and_then(|parent| self.frame(parent));
                }
                Poll::Pending => {
                    let child = frame.take_handoff();
                    frame.sync_release();
                    if frame.end_run() {
                        self.enqueue(&frame);
                    }
                    current = child.and_then(|child| self.frame(child));
                }
            }
        }
    }

    /// Finish a frame. Returns the parent to resume next, if any.
    fn complete(&self, frame: &Frame) -> Option<FrameId> {
        if let Some(parent) = frame.take_awaiter() {
            frame.mark_done();
            self.release_ref(frame.id());
            return Some(parent);
        }

        self.task_finished(frame);
        if let Some(route) = frame.context().response_route() {
            match (self.responder(), frame.take_result()) {
                (Some(responder), Some(output)) => responder.respond(&route, output),
                _ => log::warn!("Dropping response for request {}", route.correlation_id),
            }
        }
        frame.mark_done();
        self.release_ref(frame.id());
        None
    }
}
