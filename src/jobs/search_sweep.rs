//! Missing-media search sweep
//!
//! One sweep:
//! 1. Takes the sweep lock, or returns a skipped result if another sweep holds it
//! 2. Runs stalled download detection (always, even when disk is tight)
//! 3. Checks free space on the library path; below the minimum, searching is skipped
//! 4. Fetches missing items and searches them one at a time, waiting
//!    `search_delay` between consecutive searches so indexers are never hit
//!    back-to-back
//!
//! Shutdown interrupts the wait between searches; the sweep then returns what
//! it did so far.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PerItemFailure;
use super::stalled_downloads::{DetectionReport, StalledDownloadDetector};
use crate::services::disk_space::DiskSpaceProbe;
use crate::services::media_manager::{MediaManager, MissingItem};

/// Process-wide "a sweep is executing" flag
#[derive(Debug, Default)]
pub struct SweepRunState {
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

/// Serializable view of [SweepRunState]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepRunStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

impl SweepRunState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Non-blocking try-lock; `None` while another sweep holds it
    pub fn try_acquire(self: &Arc<Self>) -> Option<SweepGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.started_at.lock() = Some(Utc::now());
        Some(SweepGuard {
            state: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SweepRunStatus {
        SweepRunStatus {
            running: self.is_running(),
            started_at: *self.started_at.lock(),
        }
    }
}

/// Holding this means owning the sweep lock; dropping it releases the lock
#[derive(Debug)]
pub struct SweepGuard {
    state: Arc<SweepRunState>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        *self.state.started_at.lock() = None;
        self.state.running.store(false, Ordering::Release);
    }
}

/// Why a sweep did not (fully) search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    #[serde(rename = "already running")]
    AlreadyRunning,
    #[serde(rename = "upstream unavailable")]
    UpstreamUnavailable,
    #[serde(rename = "insufficient disk space")]
    InsufficientDiskSpace,
    #[serde(rename = "disk space unavailable")]
    DiskSpaceUnavailable,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SkipReason::AlreadyRunning => "already running",
            SkipReason::UpstreamUnavailable => "upstream unavailable",
            SkipReason::InsufficientDiskSpace => "insufficient disk space",
            SkipReason::DiskSpaceUnavailable => "disk space unavailable",
        })
    }
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    pub skipped: bool,
    pub reason: Option<SkipReason>,
    /// Shutdown interrupted the search loop
    pub cancelled: bool,
    pub stalled_downloads: Option<DetectionReport>,
    pub free_space_gb: Option<f64>,
    /// Number of missing items considered
    pub count: usize,
    pub missing_items: Vec<MissingItem>,
    pub searched_count: usize,
    pub search_failures: Vec<PerItemFailure>,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl SweepResult {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            skipped: false,
            reason: None,
            cancelled: false,
            stalled_downloads: None,
            free_space_gb: None,
            count: 0,
            missing_items: Vec::new(),
            searched_count: 0,
            search_failures: Vec::new(),
            started_at: now,
            timestamp: now,
        }
    }

    pub fn already_running() -> Self {
        Self::begin().skip(SkipReason::AlreadyRunning)
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.skipped = true;
        self.reason = Some(reason);
        self.finish()
    }

    fn finish(mut self) -> Self {
        self.timestamp = Utc::now();
        self
    }

    pub fn missing_titles(&self) -> Vec<&str> {
        self.missing_items.iter().map(|m| m.title.as_str()).collect()
    }
}

/// Anything that can run a sweep; the scheduler only needs this
#[async_trait]
pub trait SweepRunner: Send + Sync + 'static {
    /// Run one sweep; `cancel` interrupts the wait between searches
    async fn run_sweep(&self, cancel: CancellationToken) -> SweepResult;
}

/// Settings the sweep reads on every run
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub library_path: String,
    pub min_free_space_gb: f64,
    pub search_delay: Duration,
}

pub struct SearchSweepOrchestrator {
    detector: StalledDownloadDetector,
    manager: Arc<dyn MediaManager>,
    disk_probe: Arc<dyn DiskSpaceProbe>,
    run_state: Arc<SweepRunState>,
    settings: SweepSettings,
    shutdown: CancellationToken,
}

impl SearchSweepOrchestrator {
    pub fn new(
        detector: StalledDownloadDetector,
        manager: Arc<dyn MediaManager>,
        disk_probe: Arc<dyn DiskSpaceProbe>,
        run_state: Arc<SweepRunState>,
        settings: SweepSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            detector,
            manager,
            disk_probe,
            run_state,
            settings,
            shutdown,
        }
    }

    pub fn run_state(&self) -> &Arc<SweepRunState> {
        &self.run_state
    }

    pub fn manager(&self) -> &Arc<dyn MediaManager> {
        &self.manager
    }

    /// Take the sweep lock without running anything yet
    pub fn try_begin(&self) -> Option<SweepGuard> {
        self.run_state.try_acquire()
    }

    /// Run a sweep bound to process shutdown
    pub async fn run_now(&self) -> SweepResult {
        SweepRunner::run_sweep(self, self.shutdown.clone()).await
    }

    /// Run a sweep with a lock taken earlier by [try_begin](Self::try_begin).
    /// The lock is released when this returns.
    pub async fn run_with_guard(&self, guard: SweepGuard, cancel: &CancellationToken) -> SweepResult {
        let result = self.execute(cancel).await;
        drop(guard);
        log_summary(&result);
        result
    }

    async fn execute(&self, cancel: &CancellationToken) -> SweepResult {
        let mut result = SweepResult::begin();
        info!(job = "search_sweep", "Starting search sweep");

        let report = match self.detector.detect().await {
            Ok(report) => report,
            Err(e) => {
                error!(job = "search_sweep", error = %e, "Stalled download check failed, aborting sweep");
                return result.skip(SkipReason::UpstreamUnavailable);
            }
        };
        result.stalled_downloads = Some(report);

        let path = &self.settings.library_path;
        let free_gb = match self.disk_probe.free_space_gb(path).await {
            Ok(free_gb) => free_gb,
            Err(e) => {
                warn!(job = "search_sweep", path = %path, error = %e, "Disk space check failed, skipping search");
                return result.skip(SkipReason::DiskSpaceUnavailable);
            }
        };
        result.free_space_gb = Some(free_gb);

        if free_gb < self.settings.min_free_space_gb {
            warn!(
                job = "search_sweep",
                path = %path,
                free_gb,
                min_free_gb = self.settings.min_free_space_gb,
                "Path has {}GB free, need {}GB minimum; skipping search",
                free_gb,
                self.settings.min_free_space_gb
            );
            return result.skip(SkipReason::InsufficientDiskSpace);
        }

        let missing = match self.manager.missing().await {
            Ok(missing) => missing,
            Err(e) => {
                error!(job = "search_sweep", error = %e, "Failed to fetch missing items");
                return result.skip(SkipReason::UpstreamUnavailable);
            }
        };
        result.count = missing.len();
        result.missing_items = missing;

        if result.missing_items.is_empty() {
            info!(job = "search_sweep", "No missing items found");
            return result.finish();
        }

        self.search_serially(&mut result, cancel).await;
        result.finish()
    }

    async fn search_serially(&self, result: &mut SweepResult, cancel: &CancellationToken) {
        let total = result.missing_items.len();
        let delay = self.settings.search_delay;
        info!(job = "search_sweep", total, "Starting search for {} missing items", total);

        for (index, item) in result.missing_items.iter().enumerate() {
            if index > 0 {
                info!(
                    job = "search_sweep",
                    delay_secs = delay.as_secs(),
                    "Waiting {} minutes before next search",
                    delay.as_secs() / 60
                );
                let interrupted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => true,
                    _ = self.shutdown.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if interrupted {
                    result.cancelled = true;
                    break;
                }
            } else if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                result.cancelled = true;
                break;
            }

            info!(
                job = "search_sweep",
                media_id = item.media_id,
                "Searching {}/{}: {}",
                index + 1,
                total,
                item.title
            );
            match self.manager.search(item.media_id).await {
                Ok(()) => result.searched_count += 1,
                Err(e) => {
                    warn!(
                        job = "search_sweep",
                        media_id = item.media_id,
                        error = %e,
                        "Failed to trigger search for {}",
                        item.title
                    );
                    result.search_failures.push(PerItemFailure {
                        item_id: item.media_id,
                        title: item.title.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if result.cancelled {
            warn!(
                job = "search_sweep",
                searched = result.searched_count,
                total,
                "Search sweep interrupted by shutdown"
            );
        }
    }
}

#[async_trait]
impl SweepRunner for SearchSweepOrchestrator {
    async fn run_sweep(&self, cancel: CancellationToken) -> SweepResult {
        match self.try_begin() {
            Some(guard) => self.run_with_guard(guard, &cancel).await,
            None => {
                info!(job = "search_sweep", "Sweep already running, skipping");
                SweepResult::already_running()
            }
        }
    }
}

fn log_summary(result: &SweepResult) {
    let blocklisted = result
        .stalled_downloads
        .as_ref()
        .map(|r| r.blocklisted_count)
        .unwrap_or_default();
    match result.reason {
        Some(reason) => info!(
            job = "search_sweep",
            reason = %reason,
            blocklisted,
            "Search sweep skipped: {}",
            reason
        ),
        None => info!(
            job = "search_sweep",
            missing = result.count,
            searched = result.searched_count,
            failed = result.search_failures.len(),
            blocklisted,
            cancelled = result.cancelled,
            "Search sweep completed"
        ),
    }
    if !result.missing_items.is_empty() {
        debug!(job = "search_sweep", titles = ?result.missing_titles(), "Missing items considered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{FakeDiskProbe, FakeMediaManager, missing_item, queue_item};
    use pretty_assertions::assert_eq;

    const FIVE_MINUTES: Duration = Duration::from_secs(5 * 60);

    fn orchestrator(
        manager: Arc<FakeMediaManager>,
        probe: FakeDiskProbe,
        shutdown: CancellationToken,
    ) -> Arc<SearchSweepOrchestrator> {
        Arc::new(SearchSweepOrchestrator::new(
            StalledDownloadDetector::new(manager.clone(), 4.0),
            manager,
            Arc::new(probe),
            SweepRunState::new(),
            SweepSettings {
                library_path: "/movies".to_string(),
                min_free_space_gb: 20.0,
                search_delay: FIVE_MINUTES,
            },
            shutdown,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_searches_serially_with_delay_in_order() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(3), missing_item(1), missing_item(2)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert!(!result.skipped);
        assert_eq!(result.count, 3);
        assert_eq!(result.searched_count, 3);
        assert_eq!(manager.searched_ids(), vec![3, 1, 2]);
        let searches = manager.searches();
        for pair in searches.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= FIVE_MINUTES);
        }
        assert_eq!(result.missing_titles(), vec!["Movie 3", "Movie 1", "Movie 2"]);
        assert!(!sweep.run_state().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_after_last_search() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1), missing_item(2)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let start = tokio::time::Instant::now();
        sweep.run_now().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= FIVE_MINUTES);
        assert!(elapsed < FIVE_MINUTES * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_disk_skips_search_but_keeps_detection() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_queue(vec![queue_item(1, 6.5), queue_item(2, 2.0)]);
        manager.set_missing(vec![missing_item(1)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(19.9), CancellationToken::new());

        let result = sweep.run_now().await;

        assert!(result.skipped);
        assert_eq!(result.reason, Some(SkipReason::InsufficientDiskSpace));
        assert_eq!(result.free_space_gb, Some(19.9));
        let report = result.stalled_downloads.unwrap();
        assert_eq!(report.queue_items_total, 2);
        assert_eq!(report.blocklisted_count, 1);
        assert!(manager.searches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_min_free_space_is_enough() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(20.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert!(!result.skipped);
        assert_eq!(result.searched_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disk_probe_failure_skips_search() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_queue(vec![queue_item(1, 1.0)]);
        manager.set_missing(vec![missing_item(1)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::unavailable(), CancellationToken::new());

        let result = sweep.run_now().await;

        assert_eq!(result.reason, Some(SkipReason::DiskSpaceUnavailable));
        assert!(result.stalled_downloads.is_some());
        assert!(manager.searches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_unavailable_is_reported_and_releases_lock() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.fail_queue();
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert!(result.skipped);
        assert_eq!(result.reason, Some(SkipReason::UpstreamUnavailable));
        assert_eq!(result.stalled_downloads, None);
        assert!(!sweep.run_state().is_running());
        assert!(sweep.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_fetch_failure_keeps_report() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_queue(vec![queue_item(1, 9.0)]);
        manager.fail_missing();
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert_eq!(result.reason, Some(SkipReason::UpstreamUnavailable));
        assert_eq!(result.stalled_downloads.unwrap().blocklisted_count, 1);
        assert_eq!(result.free_space_gb, Some(100.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_missing_list_completes() {
        let manager = Arc::new(FakeMediaManager::default());
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert!(!result.skipped);
        assert_eq!(result.reason, None);
        assert_eq!(result.searched_count, 0);
        assert_eq!(result.count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_failure_does_not_stop_iteration() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1), missing_item(2), missing_item(3)]);
        manager.fail_search_for(2);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let result = sweep.run_now().await;

        assert_eq!(manager.searched_ids(), vec![1, 2, 3]);
        assert_eq!(result.searched_count, 2);
        assert_eq!(result.search_failures.len(), 1);
        assert_eq!(result.search_failures[0].item_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sweeps_only_one_runs() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1)]);
        let (entered, release) = manager.hold_queue();
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());

        let first = tokio::spawn({
            let sweep = sweep.clone();
            async move { sweep.run_now().await }
        });
        entered.notified().await;

        let second = sweep.run_now().await;
        assert!(second.skipped);
        assert_eq!(second.reason, Some(SkipReason::AlreadyRunning));
        assert_eq!(second.stalled_downloads, None);

        release.notify_one();
        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.searched_count, 1);
        assert_eq!(manager.queue_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_delay() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1), missing_item(2), missing_item(3)]);
        let shutdown = CancellationToken::new();
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), shutdown.clone());

        let handle = tokio::spawn({
            let sweep = sweep.clone();
            async move { sweep.run_now().await }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        let cancelled_at = tokio::time::Instant::now();
        shutdown.cancel();
        let result = handle.await.unwrap();

        assert!(!result.skipped);
        assert!(result.cancelled);
        assert_eq!(result.searched_count, 1);
        assert_eq!(manager.searched_ids(), vec![1]);
        assert!(cancelled_at.elapsed() < FIVE_MINUTES);
        assert!(!sweep.run_state().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runner_token_cancels_only_that_sweep() {
        let manager = Arc::new(FakeMediaManager::default());
        manager.set_missing(vec![missing_item(1), missing_item(2)]);
        let sweep = orchestrator(manager.clone(), FakeDiskProbe::with_free_gb(100.0), CancellationToken::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let sweep = sweep.clone();
            let cancel = cancel.clone();
            async move { SweepRunner::run_sweep(sweep.as_ref(), cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.searched_count, 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let state = SweepRunState::new();
        let guard = state.try_acquire().unwrap();
        assert!(state.is_running());
        assert!(state.status().started_at.is_some());
        assert!(state.try_acquire().is_none());
        drop(guard);
        assert_eq!(
            state.status(),
            SweepRunStatus {
                running: false,
                started_at: None
            }
        );
    }

    #[test]
    fn test_skip_reason_serializes_as_text() {
        let json = serde_json::to_value(SweepResult::already_running()).unwrap();
        assert_eq!(json["reason"], "already running");
        assert_eq!(json["skipped"], true);
    }
}
