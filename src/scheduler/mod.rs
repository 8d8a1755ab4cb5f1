//! Frame scheduler for RpcRoutines
//!
//! This module maps suspendable task frames onto a fixed pool of OS worker
//! threads sharing one ready queue.

pub mod arena;
pub mod core;
pub mod frame;
pub mod queue;
pub mod worker;

pub use arena::{ArenaStats, FrameArena, FrameId};
pub use self::core::{Scheduler, SchedulerConfig, SchedulerStats};
pub use frame::{CallContext, Frame, ResponseRoute};
pub use queue::FrameQueue;
pub use worker::WorkerId;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_creation() {
        let config = SchedulerConfig::default();
        let scheduler = Scheduler::new(config);
        assert!(scheduler.is_ok());
        let scheduler = scheduler.unwrap();
        assert!(scheduler.num_workers() > 0);
        assert_eq!(scheduler.running_tasks(), 0);
    }

    #[test]
    fn test_start_and_stop_idle_scheduler() {
        let scheduler = Scheduler::new(SchedulerConfig {
            num_workers: 2,
            park_timeout_ms: 5,
            park_jitter_ms: 0,
            ..Default::default()
        })
        .unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.start().is_err());
        scheduler.stop();
        scheduler.wait();
        assert!(scheduler.is_stopping());
    }
}
