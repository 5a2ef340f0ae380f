//! Free-space probes for the library path
//!
//! The sweep only needs one number: free GB on the filesystem holding the
//! library. [LocalDiskProbe] reads it from the host mounts, [UpstreamDiskProbe]
//! asks the media manager, which is what you want when the library lives on a
//! volume this process cannot see.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::Disks;
use tracing::debug;

use super::arr_client::ArrClient;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, thiserror::Error)]
pub enum DiskProbeError {
    #[error("path {path} unavailable: {reason}")]
    PathUnavailable { path: String, reason: String },
}

impl DiskProbeError {
    fn unavailable(path: &str, reason: impl Into<String>) -> Self {
        DiskProbeError::PathUnavailable {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Bound a disk reading by `timeout`; elapsing maps to [DiskProbeError::PathUnavailable]
async fn within<T>(
    path: &str,
    timeout: Duration,
    reading: impl Future<Output = Result<T, DiskProbeError>>,
) -> Result<T, DiskProbeError> {
    tokio::time::timeout(timeout, reading)
        .await
        .map_err(|_| DiskProbeError::unavailable(path, format!("timed out after {timeout:?}")))?
}

#[async_trait]
pub trait DiskSpaceProbe: Send + Sync + 'static {
    /// Free space in GB (1024³ bytes), rounded to two decimals
    async fn free_space_gb(&self, path: &str) -> Result<f64, DiskProbeError>;
}

/// Reads available space from the host's mounted filesystems
#[derive(Debug, Clone)]
pub struct LocalDiskProbe {
    timeout: Duration,
}

impl LocalDiskProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DiskSpaceProbe for LocalDiskProbe {
    async fn free_space_gb(&self, path: &str) -> Result<f64, DiskProbeError> {
        let target = PathBuf::from(path);
        let task = tokio::task::spawn_blocking(move || local_available_bytes(&target));

        let bytes = within(path, self.timeout, async {
            task.await
                .map_err(|join_err| DiskProbeError::unavailable(path, join_err.to_string()))?
                .map_err(|reason| DiskProbeError::unavailable(path, reason))
        })
        .await?;

        let free_gb = bytes_to_gb(bytes);
        debug!(path = %path, free_gb, "Probed local disk space");
        Ok(free_gb)
    }
}

fn local_available_bytes(path: &Path) -> Result<u64, String> {
    let canonical = std::fs::canonicalize(path).map_err(|e| e.to_string())?;
    let disks = Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64)> = disks
        .list()
        .iter()
        .map(|d| (d.mount_point().to_path_buf(), d.available_space()))
        .collect();
    available_on_deepest_mount(&canonical, &mounts)
        .ok_or_else(|| "no mounted filesystem contains this path".to_string())
}

/// Available bytes of the mount with the longest mount point containing `path`
fn available_on_deepest_mount(path: &Path, mounts: &[(PathBuf, u64)]) -> Option<u64> {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| *available)
}

/// Uses the media manager's `diskspace` endpoint; the path must match exactly
#[derive(Debug, Clone)]
pub struct UpstreamDiskProbe {
    client: Arc<ArrClient>,
    timeout: Duration,
}

impl UpstreamDiskProbe {
    pub fn new(client: Arc<ArrClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl DiskSpaceProbe for UpstreamDiskProbe {
    async fn free_space_gb(&self, path: &str) -> Result<f64, DiskProbeError> {
        let disks = within(path, self.timeout, async {
            self.client
                .disk_space()
                .await
                .map_err(|e| DiskProbeError::unavailable(path, e.to_string()))
        })
        .await?;

        if disks.is_empty() {
            return Err(DiskProbeError::unavailable(
                path,
                "no disk space information available",
            ));
        }

        let wanted = normalize(path);
        let disk = disks
            .iter()
            .find(|d| normalize(&d.path) == wanted)
            .ok_or_else(|| DiskProbeError::unavailable(path, "path not found in disk space info"))?;

        Ok(bytes_to_gb(disk.free_space))
    }
}

fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn bytes_to_gb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_GB * 100.0).round() / 100.0
}
