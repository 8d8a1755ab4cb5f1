//! Timer wheel for frame sleeps and RPC timeouts
//!
//! A fixed ring of buckets, each covering one `precision` tick. A dedicated
//! thread visits the buckets in order, records how far each has been scanned
//! and resumes every frame whose deadline has been reached. Deadlines further
//! away than one rotation simply stay in their bucket until a later pass.
//!
//! Registration never loses a wake-up: a frame whose deadline is already
//! covered by the rotation start or by its bucket's last scan is resumed
//! immediately instead of being queued.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use parking_lot::{Condvar, Mutex};
use crate::error::{Error, Result};
use crate::scheduler::{Frame, FrameQueue, Scheduler};

/// Monotonic clock measuring nanoseconds since the runtime was created
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Start a clock at the current instant
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the epoch
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Deadline `delay` from now
    pub fn deadline_after(&self, delay: Duration) -> u64 {
        self.now().saturating_add(delay.as_nanos() as u64)
    }

    /// Convert a deadline back into an `Instant`
    pub fn instant_of(&self, deadline: u64) -> Instant {
        self.epoch + Duration::from_nanos(deadline)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer wheel configuration
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Number of buckets, must be a power of two
    pub num_buckets: usize,
    /// Time covered by one bucket
    pub precision: Duration,
    /// Name of the wheel thread
    pub thread_name: String,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            num_buckets: 4096,
            precision: Duration::from_millis(1),
            thread_name: "timer-wheel".to_string(),
        }
    }
}

/// Timer wheel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerStats {
    /// Frames registered
    pub registered: usize,
    /// Frames resumed at registration because their deadline had passed
    pub miss_awakened: usize,
    /// Frames resumed by a bucket scan
    pub fired: usize,
}

struct Bucket {
    scanned_through: u64,
    queue: FrameQueue,
}

/// Bucketed timer wheel resuming parked frames at their deadlines
pub struct TimerWheel {
    clock: Clock,
    precision: u64,
    mask: usize,
    thread_name: String,
    buckets: Vec<Mutex<Bucket>>,
    wheel_start: AtomicU64,
    scheduler: Arc<Scheduler>,
    shutdown: AtomicBool,
    signal: Mutex<()>,
    signal_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    registered: AtomicUsize,
    miss_awakened: AtomicUsize,
    fired: AtomicUsize,
}

impl TimerWheel {
    /// Create a timer wheel resuming frames on `scheduler`
    pub fn new(config: TimerConfig, clock: Clock, scheduler: Arc<Scheduler>) -> Result<Arc<Self>> {
        if !config.num_buckets.is_power_of_two() {
            return Err(Error::RuntimeError {
                reason: format!("Timer bucket count {} is not a power of two", config.num_buckets),
            });
        }
        let precision = config.precision.as_nanos() as u64;
        if precision == 0 {
            return Err(Error::RuntimeError {
                reason: "Timer precision must be positive".to_string(),
            });
        }

        let buckets = (0..config.num_buckets)
            .map(|_| {
                Mutex::new(Bucket {
                    scanned_through: 0,
                    queue: FrameQueue::new(),
                })
            })
            .collect();

        Ok(Arc::new(Self {
            clock,
            precision,
            mask: config.num_buckets - 1,
            thread_name: config.thread_name,
            buckets,
            wheel_start: AtomicU64::new(clock.now()),
            scheduler,
            shutdown: AtomicBool::new(false),
            signal: Mutex::new(()),
            signal_cv: Condvar::new(),
            thread: Mutex::new(None),
            registered: AtomicUsize::new(0),
            miss_awakened: AtomicUsize::new(0),
            fired: AtomicUsize::new(0),
        }))
    }

    /// The clock deadlines are measured against
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Start the wheel thread
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() {
            return Err(Error::RuntimeError {
                reason: "Timer wheel already started".to_string(),
            });
        }

        let wheel = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || wheel.run())
            .map_err(|e| Error::RuntimeError {
                reason: format!("Failed to spawn timer wheel thread: {}", e),
            })?;
        *thread_slot = Some(handle);

        log::debug!("Timer wheel started with {} buckets", self.buckets.len());
        Ok(())
    }

    /// Ask the wheel thread to exit. Every frame still waiting is resumed
    /// before it does.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _signal = self.signal.lock();
        self.signal_cv.notify_all();
    }

    /// Join the wheel thread
    pub fn wait(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Timer wheel thread panicked");
            }
        }
    }

    /// Get timer wheel statistics
    pub fn stats(&self) -> TimerStats {
        TimerStats {
            registered: self.registered.load(Ordering::Relaxed),
            miss_awakened: self.miss_awakened.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
        }
    }

    /// Register a parked frame to be resumed at its deadline
    pub(crate) fn register(&self, frame: &Frame) {
        self.registered.fetch_add(1, Ordering::Relaxed);
        let deadline = frame.deadline();

        if self.shutdown.load(Ordering::Acquire) {
            self.miss_awaken(frame);
            return;
        }

        let start = self.wheel_start.load(Ordering::Acquire);
        if start >= deadline {
            self.miss_awaken(frame);
            return;
        }

        let index = self.bucket_index(start, deadline);
        {
            let mut bucket = self.buckets[index].lock();
            if bucket.scanned_through < deadline {
                bucket.queue.append(self.scheduler.arena(), frame);
                return;
            }
        }
        self.miss_awaken(frame);
    }

    /// Park a frame that has never run and register it
    pub(crate) fn schedule_at(&self, frame: &Frame, deadline: u64) {
        frame.set_deadline(deadline);
        if !frame.park_idle() {
            log::error!("Frame {:?} cannot be parked on the timer", frame.id());
            return;
        }
        frame.sync_release();
        self.register(frame);
    }

    fn bucket_index(&self, start: u64, deadline: u64) -> usize {
        let ticks = (deadline - start - 1) / self.precision + 1;
        ticks as usize & self.mask
    }

    fn miss_awaken(&self, frame: &Frame) {
        self.miss_awakened.fetch_add(1, Ordering::Relaxed);
        self.scheduler.resume(frame);
    }

    fn run(&self) {
        let mut index = 0;

        while !self.shutdown.load(Ordering::Acquire) {
            if index == 0 {
                self.wheel_start.store(self.clock.now(), Ordering::Release);
            }
            self.wake_bucket(index, false);

            let start = self.wheel_start.load(Ordering::Acquire);
            let next_due = start + self.precision * (index as u64 + 1);
            self.sleep_until(next_due);

            index = (index + 1) & self.mask;
        }

        for index in 0..self.buckets.len() {
            self.wake_bucket(index, true);
        }
        log::debug!("Timer wheel stopped");
    }

    fn sleep_until(&self, deadline: u64) {
        let until = self.clock.instant_of(deadline);
        let mut signal = self.signal.lock();
        while self.clock.now() < deadline && !self.shutdown.load(Ordering::Acquire) {
            self.signal_cv.wait_until(&mut signal, until);
        }
    }

    fn wake_bucket(&self, index: usize, force: bool) {
        let arena = self.scheduler.arena();
        let mut due = FrameQueue::new();
        {
            let mut bucket = self.buckets[index].lock();
            let now = self.clock.now();
            // A drained bucket turns every later registration into a miss-awaken.
            bucket.scanned_through = if force { u64::MAX } else { now };
            bucket.queue.extract_matching(
                arena,
                |frame| {
                    frame.sync_acquire();
                    force || frame.deadline() <= now
                },
                &mut due,
            );
        }

        while let Some(frame) = due.pop_head(arena) {
            self.fired.fetch_add(1, Ordering::Relaxed);
            self.scheduler.resume(&frame);
        }
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("buckets", &self.buckets.len())
            .field("precision_ns", &self.precision)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::frame::{CallContext, FrameKind, FrameOutput};
    use crate::scheduler::SchedulerConfig;
    use futures::FutureExt;

    fn wheel(num_buckets: usize) -> (Arc<Scheduler>, Arc<TimerWheel>) {
        let scheduler = Scheduler::new(SchedulerConfig {
            num_workers: 1,
            ..Default::default()
        })
        .unwrap();
        let config = TimerConfig {
            num_buckets,
            ..Default::default()
        };
        let wheel = TimerWheel::new(config, Clock::new(), Arc::clone(&scheduler)).unwrap();
        (scheduler, wheel)
    }

    fn frame(scheduler: &Scheduler) -> Arc<Frame> {
        let frame = scheduler.create_frame(CallContext::fresh(), FrameKind::Internal, |_| {
            async { Box::new(()) as FrameOutput }.boxed()
        });
        frame.mark_scheduled();
        frame
    }

    #[test]
    fn test_rejects_bad_config() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let config = TimerConfig {
            num_buckets: 1000,
            ..Default::default()
        };
        assert!(TimerWheel::new(config, Clock::new(), Arc::clone(&scheduler)).is_err());

        let config = TimerConfig {
            precision: Duration::ZERO,
            ..Default::default()
        };
        assert!(TimerWheel::new(config, Clock::new(), scheduler).is_err());
    }

    #[test]
    fn test_bucket_index_rounds_up() {
        let (_scheduler, wheel) = wheel(8);
        let p = wheel.precision;
        assert_eq!(wheel.bucket_index(100, 101), 1);
        assert_eq!(wheel.bucket_index(100, 100 + p), 1);
        assert_eq!(wheel.bucket_index(100, 100 + p + 1), 2);
        // Eight ticks away wraps to bucket zero.
        assert_eq!(wheel.bucket_index(100, 100 + 8 * p), 0);
    }

    #[test]
    fn test_past_deadline_is_resumed_immediately() {
        let (scheduler, wheel) = wheel(8);
        let frame = frame(&scheduler);
        wheel.schedule_at(&frame, 0);

        assert_eq!(wheel.stats().miss_awakened, 1);
        assert_eq!(scheduler.stats().queue_len, 1);
    }

    #[test]
    fn test_future_deadline_waits_in_bucket() {
        let (scheduler, wheel) = wheel(8);
        let frame = frame(&scheduler);
        let deadline = wheel.clock().deadline_after(Duration::from_secs(60));
        wheel.schedule_at(&frame, deadline);

        let stats = wheel.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.miss_awakened, 0);
        assert_eq!(scheduler.stats().queue_len, 0);
        assert!(frame.is_parked());
    }

    #[test]
    fn test_scanned_through_equal_to_deadline_is_miss_awakened() {
        let (scheduler, wheel) = wheel(8);
        let frame = frame(&scheduler);
        let start = wheel.wheel_start.load(Ordering::Acquire);
        let deadline = start + 3 * wheel.precision;
        let index = wheel.bucket_index(start, deadline);
        wheel.buckets[index].lock().scanned_through = deadline;

        wheel.schedule_at(&frame, deadline);
        assert_eq!(wheel.stats().miss_awakened, 1);
        assert_eq!(scheduler.stats().queue_len, 1);
        assert!(wheel.buckets[index].lock().queue.is_empty());
    }

    #[test]
    fn test_scan_fires_due_frames() {
        let (scheduler, wheel) = wheel(8);
        let frame = frame(&scheduler);
        let start = wheel.wheel_start.load(Ordering::Acquire);
        let deadline = start + 2 * wheel.precision;
        let index = wheel.bucket_index(start, deadline);
        wheel.schedule_at(&frame, deadline);
        assert_eq!(scheduler.stats().queue_len, 0);

        while wheel.clock().now() < deadline {
            std::thread::sleep(Duration::from_micros(200));
        }
        wheel.wake_bucket(index, false);
        assert_eq!(wheel.stats().fired, 1);
        assert_eq!(scheduler.stats().queue_len, 1);
    }

    #[test]
    fn test_forced_drain_at_stop() {
        let (scheduler, wheel) = wheel(8);
        let frames: Vec<_> = (0..3).map(|_| frame(&scheduler)).collect();
        for frame in &frames {
            let deadline = wheel.clock().deadline_after(Duration::from_secs(3600));
            wheel.schedule_at(frame, deadline);
        }

        wheel.start().unwrap();
        wheel.stop();
        wheel.wait();

        assert_eq!(wheel.stats().fired, 3);
        assert_eq!(scheduler.stats().queue_len, 3);
    }

    #[test]
    fn test_register_after_forced_drain_resumes_at_once() {
        let (scheduler, wheel) = wheel(8);
        // The wheel thread drained everything, but this registration read the
        // shutdown flag before it was set.
        for index in 0..wheel.buckets.len() {
            wheel.wake_bucket(index, true);
        }
        let frame = frame(&scheduler);
        let deadline = wheel.clock().deadline_after(Duration::from_secs(3600));
        wheel.schedule_at(&frame, deadline);

        let stats = wheel.stats();
        assert_eq!(stats.miss_awakened, 1);
        assert_eq!(stats.fired, 0);
        assert_eq!(scheduler.stats().queue_len, 1);
        assert!(wheel.buckets.iter().all(|bucket| bucket.lock().queue.is_empty()));
    }

    #[test]
    fn test_register_after_stop_resumes_at_once() {
        let (scheduler, wheel) = wheel(8);
        wheel.stop();
        let frame = frame(&scheduler);
        let deadline = wheel.clock().deadline_after(Duration::from_secs(3600));
        wheel.schedule_at(&frame, deadline);
        assert_eq!(wheel.stats().miss_awakened, 1);
        assert_eq!(scheduler.stats().queue_len, 1);
    }
}
