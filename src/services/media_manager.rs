//! Media manager interface and the typed models the core works with
//!
//! The upstream APIs (Radarr/Sonarr v3) return loosely-typed JSON. Adapters map
//! it into [QueueItem] and [MissingItem] here so nothing downstream depends on
//! the upstream schema.

use async_trait::async_trait;
use serde::Serialize;

/// Errors returned by a media manager call
#[derive(Debug, thiserror::Error)]
pub enum MediaManagerError {
    /// Connection refused, DNS failure, timeout
    #[error("media manager unreachable: {0}")]
    Unreachable(String),

    /// The manager answered with a non-2xx status
    #[error("media manager rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The manager answered but the payload did not match what we expect
    #[error("unexpected media manager response: {0}")]
    Decode(String),
}

impl MediaManagerError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, MediaManagerError::Unreachable(_))
    }

    /// Worth retrying: network trouble, throttling, or a server-side failure
    pub fn is_transient(&self) -> bool {
        match self {
            MediaManagerError::Unreachable(_) => true,
            MediaManagerError::Rejected { status, .. } => {
                *status == 429 || *status == 408 || (500..600).contains(status)
            }
            MediaManagerError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for MediaManagerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            MediaManagerError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            MediaManagerError::Rejected {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            MediaManagerError::Unreachable(e.to_string())
        }
    }
}

/// One entry of the download queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    /// Queue record id
    pub id: i64,
    pub title: String,
    /// Download client identifier, if the client reported one
    pub download_id: Option<String>,
    /// Hours since the download was added; `None` when upstream gave no usable timestamp
    pub elapsed_hours: Option<f64>,
    /// Movie or episode id owning this download
    pub media_id: Option<i64>,
}

/// A monitored library item without a file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingItem {
    pub media_id: i64,
    pub title: String,
}

/// Narrow view of a Radarr/Sonarr instance used by the sweep.
#[async_trait]
pub trait MediaManager: Send + Sync + 'static {
    /// Full download queue, in upstream order
    async fn queue(&self) -> Result<Vec<QueueItem>, MediaManagerError>;

    /// Monitored items without a file, in upstream order
    async fn missing(&self) -> Result<Vec<MissingItem>, MediaManagerError>;

    /// Remove a queue entry from the client, blocklist its release and ask the
    /// manager to grab another one. One upstream call.
    async fn blocklist_and_research(&self, item: &QueueItem) -> Result<(), MediaManagerError>;

    /// Trigger an indexer search for one library item
    async fn search(&self, media_id: i64) -> Result<(), MediaManagerError>;

    /// Cheap reachability check
    async fn test_connection(&self) -> bool;

    /// Base URL, for health output
    fn base_url(&self) -> &str;
}
