//! Background jobs: stalled download cleanup, the search sweep and its scheduler

pub mod scheduler;
pub mod search_sweep;
pub mod stalled_downloads;

#[cfg(test)]
pub(crate) mod testing;

use serde::Serialize;

pub use scheduler::{Scheduler, SchedulerConfig, SchedulerPhase, SchedulerState};
pub use search_sweep::{
    SearchSweepOrchestrator, SkipReason, SweepGuard, SweepResult, SweepRunState, SweepRunStatus,
    SweepRunner, SweepSettings,
};
pub use stalled_downloads::{DetectError, DetectionReport, StalledDownloadDetector, StalledItem};

/// One item that failed without stopping the rest of its batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerItemFailure {
    /// Queue id for blocklist failures, media id for search failures
    pub item_id: i64,
    pub title: String,
    pub error: String,
}
