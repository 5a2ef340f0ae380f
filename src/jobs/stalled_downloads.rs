//! Stalled download detection
//!
//! A queue entry is stalled once it has been in the queue for longer than the
//! configured threshold. Stalled entries are removed from the download client,
//! blocklisted, and the manager is asked to grab a different release. One
//! entry failing does not stop the rest of the pass.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::PerItemFailure;
use crate::services::media_manager::{MediaManager, MediaManagerError, QueueItem};

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    /// The queue could not be fetched; no partial report is produced
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] MediaManagerError),
}

/// A queue entry past the stall threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StalledItem {
    pub queue_id: i64,
    pub title: String,
    pub media_id: Option<i64>,
    pub download_id: Option<String>,
    pub hours_running: f64,
    pub blocklisted: bool,
    pub researched: bool,
}

/// A queue entry still within the threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveDownload {
    pub queue_id: i64,
    pub title: String,
    /// `None` when upstream did not say when the download was added
    pub hours_running: Option<f64>,
}

/// Outcome of one detection pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub queue_items_total: usize,
    pub stalled_items: Vec<StalledItem>,
    pub blocklisted_count: usize,
    pub researched_count: usize,
    pub active_downloads: Vec<ActiveDownload>,
    pub failures: Vec<PerItemFailure>,
}

/// `elapsed > threshold`; exactly at the threshold is still healthy, unknown is never stalled
pub fn is_stalled(elapsed_hours: Option<f64>, threshold_hours: f64) -> bool {
    elapsed_hours.is_some_and(|h| h > threshold_hours)
}

pub struct StalledDownloadDetector {
    manager: Arc<dyn MediaManager>,
    threshold_hours: f64,
}

impl StalledDownloadDetector {
    pub fn new(manager: Arc<dyn MediaManager>, threshold_hours: f64) -> Self {
        Self {
            manager,
            threshold_hours,
        }
    }

    /// Fetch the queue, blocklist and re-search every stalled entry in queue order
    pub async fn detect(&self) -> Result<DetectionReport, DetectError> {
        let queue = self.manager.queue().await?;

        let mut report = DetectionReport {
            queue_items_total: queue.len(),
            ..Default::default()
        };

        if queue.is_empty() {
            info!(job = "stalled_downloads", "No items in download queue");
            return Ok(report);
        }

        for item in queue {
            if is_stalled(item.elapsed_hours, self.threshold_hours) {
                let stalled = self.handle_stalled(item, &mut report).await;
                report.stalled_items.push(stalled);
            } else {
                debug!(
                    job = "stalled_downloads",
                    queue_id = item.id,
                    hours_running = ?item.elapsed_hours,
                    "Download still active: {}",
                    item.title
                );
                report.active_downloads.push(ActiveDownload {
                    queue_id: item.id,
                    title: item.title,
                    hours_running: item.elapsed_hours.map(round_tenth),
                });
            }
        }

        if report.stalled_items.is_empty() {
            info!(job = "stalled_downloads", "No stalled downloads found");
        } else {
            info!(
                job = "stalled_downloads",
                stalled = report.stalled_items.len(),
                blocklisted = report.blocklisted_count,
                researched = report.researched_count,
                "Blocklisted {} stalled downloads, triggered {} new searches",
                report.blocklisted_count,
                report.researched_count
            );
        }

        Ok(report)
    }

    async fn handle_stalled(&self, item: QueueItem, report: &mut DetectionReport) -> StalledItem {
        let hours_running = round_tenth(item.elapsed_hours.unwrap_or_default());
        let mut stalled = StalledItem {
            queue_id: item.id,
            title: item.title.clone(),
            media_id: item.media_id,
            download_id: item.download_id.clone(),
            hours_running,
            blocklisted: false,
            researched: false,
        };

        match self.manager.blocklist_and_research(&item).await {
            Ok(()) => {
                stalled.blocklisted = true;
                report.blocklisted_count += 1;
                if item.media_id.is_some() {
                    stalled.researched = true;
                    report.researched_count += 1;
                }
                info!(
                    job = "stalled_downloads",
                    queue_id = item.id,
                    media_id = ?item.media_id,
                    hours_running,
                    "Blocklisted stalled download: {}",
                    item.title
                );
            }
            Err(e) => {
                warn!(
                    job = "stalled_downloads",
                    queue_id = item.id,
                    error = %e,
                    "Failed to blocklist stalled download: {}",
                    item.title
                );
                report.failures.push(PerItemFailure {
                    item_id: item.id,
                    title: item.title,
                    error: e.to_string(),
                });
            }
        }

        stalled
    }
}

fn round_tenth(hours: f64) -> f64 {
    (hours * 10.0).round() / 10.0
}
