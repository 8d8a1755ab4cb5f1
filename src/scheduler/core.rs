//! Scheduler coordination
//!
//! Owns the frame arena, the shared ready queue and the worker threads, and
//! tracks how many root tasks are still running so shutdown can drain them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use crate::error::{Error, Result};
use super::arena::{ArenaStats, FrameArena, FrameId};
use super::frame::{CallContext, Frame, FrameBody, FrameKind, FrameOutput, ResponseRoute};
use super::queue::FrameQueue;
use super::worker::{self, WorkerId};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub num_workers: usize,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Park timeout in milliseconds
    pub park_timeout_ms: u64,
    /// Upper bound of the random jitter added to each park, in milliseconds
    pub park_jitter_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            thread_name_prefix: "routine-worker".to_string(),
            park_timeout_ms: 100,
            park_jitter_ms: 50,
        }
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Root frames committed
    pub frames_committed: usize,
    /// Frame polls performed by workers
    pub frames_resumed: usize,
    /// Root tasks committed but not yet finished
    pub running_tasks: usize,
    /// Frames currently in the ready queue
    pub queue_len: usize,
}

/// Sends the result of a frame that answers a remote request
pub(crate) trait Responder: Send + Sync {
    fn respond(&self, route: &ResponseRoute, output: FrameOutput);
}

/// The scheduler that runs frames on a fixed pool of worker threads
pub struct Scheduler {
    config: SchedulerConfig,
    num_workers: usize,
    pub(super) arena: FrameArena,
    pub(super) ready: Mutex<FrameQueue>,
    pub(super) ready_cv: Condvar,
    shutdown: AtomicBool,
    started: AtomicBool,
    running: AtomicUsize,
    responder: OnceCell<Weak<dyn Responder>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    committed: AtomicUsize,
    pub(super) resumed: AtomicUsize,
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>> {
        let num_workers = if config.num_workers == 0 {
            num_cpus::get()
        } else {
            config.num_workers
        };

        Ok(Arc::new(Self {
            config,
            num_workers,
            arena: FrameArena::new(),
            ready: Mutex::new(FrameQueue::new()),
            ready_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            responder: OnceCell::new(),
            workers: Mutex::new(Vec::new()),
            committed: AtomicUsize::new(0),
            resumed: AtomicUsize::new(0),
        }))
    }

    /// Launch the worker threads
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::RuntimeError {
                reason: "Scheduler already started".to_string(),
            });
        }

        let mut workers = self.workers.lock();
        for i in 0..self.num_workers {
            let name = format!("{}-{}", self.config.thread_name_prefix, i);
            workers.push(worker::spawn(WorkerId(i), name, Arc::downgrade(self))?);
        }

        log::info!("Scheduler started with {} workers", self.num_workers);
        Ok(())
    }

    /// Refuse new commits. Workers keep running until every committed root
    /// task has finished and the ready queue is empty.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            log::info!("Scheduler stopping with {} running tasks", self.running_tasks());
        }
        self.notify_all();
    }

    /// Join every worker thread
    pub fn wait(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
        log::debug!("Scheduler workers joined");
    }

    /// Whether `stop` has been called
    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Get the number of worker threads
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Root tasks committed but not yet finished
    pub fn running_tasks(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            frames_committed: self.committed.load(Ordering::Relaxed),
            frames_resumed: self.resumed.load(Ordering::Relaxed),
            running_tasks: self.running_tasks(),
            queue_len: self.ready.lock().len(),
        }
    }

    /// Get frame arena statistics
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub(crate) fn arena(&self) -> &FrameArena {
        &self.arena
    }

    pub(crate) fn set_responder(&self, responder: Weak<dyn Responder>) {
        if self.responder.set(responder).is_err() {
            log::warn!("Scheduler responder already installed");
        }
    }

    pub(super) fn responder(&self) -> Option<Arc<dyn Responder>> {
        self.responder.get().and_then(Weak::upgrade)
    }

    pub(crate) fn frame(&self, id: FrameId) -> Option<Arc<Frame>> {
        self.arena.get(id)
    }

    /// Allocate an idle frame. The returned frame holds one reference, owned
    /// by the caller.
    pub(crate) fn create_frame(
        &self,
        context: Arc<CallContext>,
        kind: FrameKind,
        build: impl FnOnce(FrameId) -> FrameBody,
    ) -> Arc<Frame> {
        self.arena
            .insert_with(|id| Frame::new(id, build(id), context, kind))
    }

    /// Schedule a root frame for the first time
    pub(crate) fn commit(&self, id: FrameId) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::ServiceStopped);
        }
        let frame = self.frame(id).ok_or_else(|| Error::RuntimeError {
            reason: format!("Frame {:?} no longer exists", id),
        })?;
        if !frame.mark_scheduled() {
            return Err(Error::RuntimeError {
                reason: format!("Frame {:?} has already been scheduled", id),
            });
        }

        frame.acquire_ref();
        if !frame.is_internal() {
            self.running.fetch_add(1, Ordering::AcqRel);
        }
        self.committed.fetch_add(1, Ordering::Relaxed);

        frame.sync_release();
        if frame.try_wake() {
            self.enqueue(&frame);
        }
        Ok(())
    }

    /// Wake a frame through its waker
    pub(crate) fn wake(&self, id: FrameId) {
        if let Some(frame) = self.frame(id) {
            if frame.try_wake() {
                self.enqueue(&frame);
            }
        }
    }

    /// Resume a parked frame on behalf of the timer or the pending table
    pub(crate) fn resume(&self, frame: &Frame) {
        frame.sync_acquire();
        if frame.try_resume() {
            self.enqueue(frame);
        }
    }

    pub(crate) fn enqueue(&self, frame: &Frame) {
        let mut ready = self.ready.lock();
        ready.append(&self.arena, frame);
        drop(ready);
        self.ready_cv.notify_one();
    }

    /// Drop one reference to a frame, releasing its storage when it was the
    /// last one and the frame can no longer run.
    pub(crate) fn release_ref(&self, id: FrameId) {
        let Some(frame) = self.frame(id) else {
            return;
        };
        if frame.release_ref() != 0 {
            return;
        }
        if frame.is_done() || !frame.is_scheduled() {
            drop(frame);
            self.arena.release(id);
        } else {
            log::error!("Frame {:?} lost its last reference while still pending", id);
        }
    }

    /// Called by the worker when a root frame (one nobody awaits) finishes
    pub(super) fn task_finished(&self, frame: &Frame) {
        if frame.is_internal() {
            return;
        }
        let remaining = self.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.is_stopping() {
            self.notify_all();
        }
    }

    /// Drop every frame left in the arena once the workers are gone
    pub(crate) fn clear_frames(&self) -> usize {
        *self.ready.lock() = FrameQueue::new();
        self.arena.clear()
    }

    pub(super) fn should_exit(&self) -> bool {
        self.is_stopping() && self.running_tasks() == 0
    }

    pub(super) fn park_timeout(&self) -> Duration {
        let jitter = if self.config.park_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.config.park_jitter_ms)
        };
        Duration::from_millis(self.config.park_timeout_ms + jitter)
    }

    fn notify_all(&self) {
        let _ready = self.ready.lock();
        self.ready_cv.notify_all();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("num_workers", &self.num_workers)
            .field("running", &self.running_tasks())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
