//! In-memory fakes shared by the job tests

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::services::disk_space::{DiskProbeError, DiskSpaceProbe};
use crate::services::media_manager::{MediaManager, MediaManagerError, MissingItem, QueueItem};

pub fn queue_item(id: i64, elapsed_hours: f64) -> QueueItem {
    QueueItem {
        id,
        title: format!("Download {id}"),
        download_id: Some(format!("dl-{id}")),
        elapsed_hours: Some(elapsed_hours),
        media_id: Some(id * 100),
    }
}

pub fn missing_item(media_id: i64) -> MissingItem {
    MissingItem {
        media_id,
        title: format!("Movie {media_id}"),
    }
}

#[derive(Default)]
struct State {
    queue: Vec<QueueItem>,
    missing: Vec<MissingItem>,
    queue_fails: bool,
    missing_fails: bool,
    blocklist_fails: HashSet<i64>,
    search_fails: HashSet<i64>,
    blocklist_attempts: Vec<i64>,
    blocklisted: Vec<i64>,
    searches: Vec<(i64, Instant)>,
    queue_calls: usize,
}

/// Scriptable [MediaManager] that records every call
#[derive(Default)]
pub struct FakeMediaManager {
    state: Mutex<State>,
    /// (entered, release): `queue()` signals `entered` then waits for `release`
    queue_gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeMediaManager {
    pub fn set_queue(&self, queue: Vec<QueueItem>) {
        self.state.lock().queue = queue;
    }

    pub fn set_missing(&self, missing: Vec<MissingItem>) {
        self.state.lock().missing = missing;
    }

    pub fn fail_queue(&self) {
        self.state.lock().queue_fails = true;
    }

    pub fn fail_missing(&self) {
        self.state.lock().missing_fails = true;
    }

    pub fn fail_blocklist_for(&self, queue_id: i64) {
        self.state.lock().blocklist_fails.insert(queue_id);
    }

    pub fn fail_search_for(&self, media_id: i64) {
        self.state.lock().search_fails.insert(media_id);
    }

    /// Make the next `queue()` call park until released
    pub fn hold_queue(&self) -> (Arc<Notify>, Arc<Notify>) {
        let gate = (Arc::new(Notify::new()), Arc::new(Notify::new()));
        *self.queue_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn blocklist_attempts(&self) -> Vec<i64> {
        self.state.lock().blocklist_attempts.clone()
    }

    pub fn blocklisted(&self) -> Vec<i64> {
        self.state.lock().blocklisted.clone()
    }

    pub fn searches(&self) -> Vec<(i64, Instant)> {
        self.state.lock().searches.clone()
    }

    pub fn searched_ids(&self) -> Vec<i64> {
        self.searches().into_iter().map(|(id, _)| id).collect()
    }

    pub fn queue_calls(&self) -> usize {
        self.state.lock().queue_calls
    }
}

fn unreachable() -> MediaManagerError {
    MediaManagerError::Unreachable("connection refused".to_string())
}

#[async_trait]
impl MediaManager for FakeMediaManager {
    async fn queue(&self) -> Result<Vec<QueueItem>, MediaManagerError> {
        let gate = self.queue_gate.lock().take();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }
        let mut state = self.state.lock();
        state.queue_calls += 1;
        if state.queue_fails {
            return Err(unreachable());
        }
        Ok(state.queue.clone())
    }

    async fn missing(&self) -> Result<Vec<MissingItem>, MediaManagerError> {
        let state = self.state.lock();
        if state.missing_fails {
            return Err(unreachable());
        }
        Ok(state.missing.clone())
    }

    async fn blocklist_and_research(&self, item: &QueueItem) -> Result<(), MediaManagerError> {
        let mut state = self.state.lock();
        state.blocklist_attempts.push(item.id);
        if state.blocklist_fails.contains(&item.id) {
            return Err(MediaManagerError::Rejected {
                status: 500,
                body: "boom".to_string(),
            });
        }
        state.blocklisted.push(item.id);
        Ok(())
    }

    async fn search(&self, media_id: i64) -> Result<(), MediaManagerError> {
        let mut state = self.state.lock();
        state.searches.push((media_id, Instant::now()));
        if state.search_fails.contains(&media_id) {
            return Err(MediaManagerError::Rejected {
                status: 400,
                body: "bad".to_string(),
            });
        }
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        !self.state.lock().queue_fails
    }

    fn base_url(&self) -> &str {
        "http://fake-arr"
    }
}

/// [DiskSpaceProbe] returning a fixed reading, or failing
pub struct FakeDiskProbe {
    reading: Mutex<Option<f64>>,
}

impl FakeDiskProbe {
    pub fn with_free_gb(free_gb: f64) -> Self {
        Self {
            reading: Mutex::new(Some(free_gb)),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            reading: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DiskSpaceProbe for FakeDiskProbe {
    async fn free_space_gb(&self, path: &str) -> Result<f64, DiskProbeError> {
        let reading = *self.reading.lock();
        reading.ok_or_else(|| DiskProbeError::PathUnavailable {
            path: path.to_string(),
            reason: "not mounted".to_string(),
        })
    }
}
