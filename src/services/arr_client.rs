//! Radarr/Sonarr v3 API client
//!
//! Both managers share the same queue, command and diskspace endpoints; they
//! differ in how missing items are listed and which search command is issued.
//! Radarr: `movie` filtered to monitored items without a file, `MoviesSearch`.
//! Sonarr: monitored `series`, then each series' `episode` list, `EpisodeSearch`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use super::media_manager::{MediaManager, MediaManagerError, MissingItem, QueueItem};
use super::rate_limiter::{RateLimitedClient, RetryConfig, retry_async};
use crate::config::{Config, MediaManagerKind};

const QUEUE_PAGE_SIZE: u32 = 100;
const MAX_ERROR_BODY: usize = 512;

/// Typed client for one Radarr or Sonarr instance
#[derive(Debug)]
pub struct ArrClient {
    kind: MediaManagerKind,
    base_url: String,
    api_key: String,
    client: RateLimitedClient,
    retry_config: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuePage {
    #[serde(default)]
    total_records: u64,
    #[serde(default)]
    records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueRecord {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    download_id: Option<String>,
    #[serde(default)]
    added: Option<String>,
    #[serde(default)]
    movie_id: Option<i64>,
    #[serde(default)]
    episode_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovieRecord {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    monitored: bool,
    #[serde(default)]
    has_file: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesRecord {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    monitored: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpisodeRecord {
    id: i64,
    #[serde(default)]
    season_number: i32,
    #[serde(default)]
    episode_number: i32,
    #[serde(default)]
    monitored: bool,
    #[serde(default)]
    has_file: bool,
    #[serde(default)]
    unverified_scene_numbering: bool,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    id: Option<i64>,
}

/// One row of the `diskspace` endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSpaceRecord {
    pub path: String,
    #[serde(default)]
    pub free_space: u64,
    #[serde(default)]
    pub total_space: u64,
}

impl ArrClient {
    pub fn new(
        kind: MediaManagerKind,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = RateLimitedClient::for_media_manager(kind.as_str(), timeout)
            .context("Failed to create HTTP client")?;
        Ok(Self {
            kind,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            retry_config: RetryConfig::default(),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            config.media_manager,
            config.media_manager_url.clone(),
            config.media_manager_api_key.clone(),
            config.http_timeout,
        )
    }

    /// Override the retry policy for idempotent reads
    pub fn with_retry(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Disk usage as reported by the manager
    pub async fn disk_space(&self) -> Result<Vec<DiskSpaceRecord>, MediaManagerError> {
        self.get_json("diskspace", &[]).await
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}/api/v3/{}", self.base_url, endpoint);
        self.client
            .inner()
            .request(method, url)
            .header("X-Api-Key", &self.api_key)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, MediaManagerError> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(MediaManagerError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, MediaManagerError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| MediaManagerError::Decode(e.to_string()))
    }

    /// GET with retries on transient failures
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, MediaManagerError> {
        let operation = format!("{}_get_{}", self.kind.as_str(), endpoint);
        retry_async(
            || async move {
                let response = self
                    .send(self.request(Method::GET, endpoint).query(query))
                    .await?;
                Self::decode(response).await
            },
            &self.retry_config,
            &operation,
            MediaManagerError::is_transient,
        )
        .await
    }

    async fn missing_movies(&self) -> Result<Vec<MissingItem>, MediaManagerError> {
        let movies: Vec<MovieRecord> = self
            .get_json("movie", &[("monitored", "true".to_string())])
            .await?;

        Ok(movies
            .into_iter()
            .filter(|m| m.monitored && !m.has_file)
            .map(|m| MissingItem {
                media_id: m.id,
                title: m.title.unwrap_or_else(|| "Unknown".to_string()),
            })
            .collect())
    }

    async fn missing_episodes(&self) -> Result<Vec<MissingItem>, MediaManagerError> {
        let series: Vec<SeriesRecord> = self
            .get_json("series", &[("monitored", "true".to_string())])
            .await?;

        let mut missing = Vec::new();
        for show in series.into_iter().filter(|s| s.monitored) {
            let show_title = show.title.unwrap_or_else(|| "Unknown".to_string());
            let episodes: Vec<EpisodeRecord> = match self
                .get_json("episode", &[("seriesId", show.id.to_string())])
                .await
            {
                Ok(episodes) => episodes,
                Err(e) if e.is_unreachable() => return Err(e),
                Err(e) => {
                    warn!(
                        series_id = show.id,
                        error = %e,
                        "Failed to get episodes for series {}",
                        show_title
                    );
                    continue;
                }
            };

            missing.extend(
                episodes
                    .into_iter()
                    .filter(|ep| ep.monitored && !ep.has_file && !ep.unverified_scene_numbering)
                    .map(|ep| MissingItem {
                        media_id: ep.id,
                        title: format!(
                            "{} - S{:02}E{:02}",
                            show_title, ep.season_number, ep.episode_number
                        ),
                    }),
            );
        }
        Ok(missing)
    }
}

#[async_trait]
impl MediaManager for ArrClient {
    async fn queue(&self) -> Result<Vec<QueueItem>, MediaManagerError> {
        let now = Utc::now();
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let body: QueuePage = self
                .get_json(
                    "queue",
                    &[
                        ("page", page.to_string()),
                        ("pageSize", QUEUE_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            let fetched = body.records.len();
            items.extend(body.records.into_iter().map(|r| queue_item_from_record(r, now)));

            if fetched == 0 || items.len() as u64 >= body.total_records {
                break;
            }
            page += 1;
        }

        debug!(
            manager = self.kind.as_str(),
            count = items.len(),
            "Fetched download queue"
        );
        Ok(items)
    }

    async fn missing(&self) -> Result<Vec<MissingItem>, MediaManagerError> {
        let missing = match self.kind {
            MediaManagerKind::Radarr => self.missing_movies().await?,
            MediaManagerKind::Sonarr => self.missing_episodes().await?,
        };
        info!(
            manager = self.kind.as_str(),
            count = missing.len(),
            "Found {} missing items",
            missing.len()
        );
        Ok(missing)
    }

    async fn blocklist_and_research(&self, item: &QueueItem) -> Result<(), MediaManagerError> {
        let request = self
            .request(Method::DELETE, &format!("queue/{}", item.id))
            .query(&[
                ("removeFromClient", "true"),
                ("blocklist", "true"),
                ("skipRedownload", "false"),
            ]);
        self.send(request).await?;
        Ok(())
    }

    async fn search(&self, media_id: i64) -> Result<(), MediaManagerError> {
        let command = match self.kind {
            MediaManagerKind::Radarr => json!({ "name": "MoviesSearch", "movieIds": [media_id] }),
            MediaManagerKind::Sonarr => {
                json!({ "name": "EpisodeSearch", "episodeIds": [media_id] })
            }
        };
        let response = self
            .send(self.request(Method::POST, "command").json(&command))
            .await?;
        let accepted: CommandResponse = Self::decode(response).await?;
        match accepted.id {
            Some(command_id) => {
                debug!(media_id, command_id, "Search command accepted");
                Ok(())
            }
            None => Err(MediaManagerError::Decode(
                "command response carried no id".to_string(),
            )),
        }
    }

    async fn test_connection(&self) -> bool {
        match self
            .send(self.request(Method::GET, "system/status"))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(manager = self.kind.as_str(), error = %e, "Connection test failed");
                false
            }
        }
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn queue_item_from_record(record: QueueRecord, now: DateTime<Utc>) -> QueueItem {
    let elapsed_hours = record
        .added
        .as_deref()
        .and_then(parse_upstream_timestamp)
        .map(|added| (now - added).num_seconds().max(0) as f64 / 3600.0);

    QueueItem {
        id: record.id,
        title: record.title.unwrap_or_else(|| "Unknown".to_string()),
        download_id: record.download_id.filter(|d| !d.is_empty()),
        elapsed_hours,
        media_id: record.movie_id.or(record.episode_id),
    }
}

/// Upstream timestamps are RFC 3339, occasionally without an offset (then UTC)
fn parse_upstream_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{delete, get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    type Log = Arc<Mutex<Vec<String>>>;

    async fn spawn_upstream(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(kind: MediaManagerKind, base: &str) -> ArrClient {
        ArrClient::new(kind, base, "secret", Duration::from_secs(5))
            .unwrap()
            .with_retry(RetryConfig {
                max_retries: 2,
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                multiplier: 1.0,
            })
    }

    async fn paged_queue(
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Result<Json<Value>, StatusCode> {
        if headers.get("X-Api-Key").and_then(|v| v.to_str().ok()) != Some("secret") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        let page = params.get("page").map(String::as_str).unwrap_or("1");
        let body = match page {
            "1" => serde_json::json!({
                "totalRecords": 3,
                "records": [
                    {"id": 1, "title": "A", "downloadId": "abc", "added": "2024-01-01T00:00:00Z", "movieId": 10},
                    {"id": 2, "title": "B", "downloadId": "", "movieId": 11}
                ]
            }),
            _ => serde_json::json!({
                "totalRecords": 3,
                "records": [
                    {"id": 3, "title": "C", "downloadId": "ghi", "added": "2024-01-01T00:00:00", "episodeId": 12}
                ]
            }),
        };
        Ok(Json(body))
    }

    #[tokio::test]
    async fn test_queue_follows_pages_and_maps_records() {
        let base = spawn_upstream(Router::new().route("/api/v3/queue", get(paged_queue))).await;
        let items = client(MediaManagerKind::Radarr, &base).queue().await.unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].download_id.as_deref(), Some("abc"));
        assert_eq!(items[0].media_id, Some(10));
        assert!(items[0].elapsed_hours.unwrap() > 24.0);
        assert_eq!(items[1].download_id, None);
        assert_eq!(items[1].elapsed_hours, None);
        assert_eq!(items[2].media_id, Some(12));
        assert!(items[2].elapsed_hours.is_some());
    }

    #[tokio::test]
    async fn test_wrong_api_key_is_rejected_not_unreachable() {
        let base = spawn_upstream(Router::new().route("/api/v3/queue", get(paged_queue))).await;
        let err = ArrClient::new(MediaManagerKind::Radarr, &base, "nope", Duration::from_secs(5))
            .unwrap()
            .queue()
            .await
            .unwrap_err();

        assert_matches!(err, MediaManagerError::Rejected { status: 401, .. });
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(MediaManagerKind::Radarr, &format!("http://{addr}"))
            .queue()
            .await
            .unwrap_err();
        assert!(err.is_unreachable(), "{err}");
    }

    #[tokio::test]
    async fn test_radarr_missing_filters_monitored_without_file() {
        let router = Router::new().route(
            "/api/v3/movie",
            get(|| async {
                Json(serde_json::json!([
                    {"id": 1, "title": "Has File", "monitored": true, "hasFile": true},
                    {"id": 2, "title": "Wanted", "monitored": true, "hasFile": false},
                    {"id": 3, "title": "Unmonitored", "monitored": false, "hasFile": false}
                ]))
            }),
        );
        let base = spawn_upstream(router).await;
        let missing = client(MediaManagerKind::Radarr, &base).missing().await.unwrap();

        assert_eq!(
            missing,
            vec![MissingItem {
                media_id: 2,
                title: "Wanted".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_sonarr_missing_walks_series_and_skips_broken_ones() {
        let router = Router::new()
            .route(
                "/api/v3/series",
                get(|| async {
                    Json(serde_json::json!([
                        {"id": 1, "title": "Show", "monitored": true},
                        {"id": 2, "title": "Broken", "monitored": true},
                        {"id": 3, "title": "Ignored", "monitored": false}
                    ]))
                }),
            )
            .route(
                "/api/v3/episode",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    match params.get("seriesId").map(String::as_str) {
                        Some("1") => Ok(Json(serde_json::json!([
                            {"id": 100, "seasonNumber": 1, "episodeNumber": 2, "monitored": true, "hasFile": false},
                            {"id": 101, "seasonNumber": 1, "episodeNumber": 3, "monitored": true, "hasFile": true},
                            {"id": 102, "seasonNumber": 0, "episodeNumber": 1, "monitored": true, "hasFile": false, "unverifiedSceneNumbering": true}
                        ]))),
                        _ => Err(StatusCode::NOT_FOUND),
                    }
                }),
            );
        let base = spawn_upstream(router).await;
        let missing = client(MediaManagerKind::Sonarr, &base).missing().await.unwrap();

        assert_eq!(
            missing,
            vec![MissingItem {
                media_id: 100,
                title: "Show - S01E02".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_search_and_blocklist_requests() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(
                "/api/v3/command",
                post(|State(log): State<Log>, Json(body): Json<Value>| async move {
                    log.lock().push(body.to_string());
                    Json(serde_json::json!({"id": 7, "name": body["name"]}))
                }),
            )
            .route(
                "/api/v3/queue/{id}",
                delete(
                    |State(log): State<Log>,
                     Path(id): Path<i64>,
                     Query(params): Query<HashMap<String, String>>| async move {
                        log.lock().push(format!(
                            "delete {id} blocklist={} skipRedownload={} removeFromClient={}",
                            params["blocklist"], params["skipRedownload"], params["removeFromClient"]
                        ));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(log.clone());
        let base = spawn_upstream(router).await;
        let arr = client(MediaManagerKind::Sonarr, &base);

        arr.search(42).await.unwrap();
        arr.blocklist_and_research(&QueueItem {
            id: 5,
            title: "X".to_string(),
            download_id: Some("d".to_string()),
            elapsed_hours: Some(9.0),
            media_id: Some(42),
        })
        .await
        .unwrap();

        let log = log.lock().clone();
        assert_eq!(log.len(), 2);
        assert!(log[0].contains("EpisodeSearch"));
        assert!(log[0].contains("[42]"));
        assert_eq!(
            log[1],
            "delete 5 blocklist=true skipRedownload=false removeFromClient=true"
        );
    }

    #[tokio::test]
    async fn test_search_failure_is_not_retried() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new()
            .route(
                "/api/v3/command",
                post(|State(log): State<Log>| async move {
                    log.lock().push("hit".to_string());
                    StatusCode::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(log.clone());
        let base = spawn_upstream(router).await;

        let err = client(MediaManagerKind::Radarr, &base)
            .search(1)
            .await
            .unwrap_err();

        assert_matches!(err, MediaManagerError::Rejected { status: 503, .. });
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_parse_upstream_timestamp_variants() {
        assert!(parse_upstream_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_upstream_timestamp("2024-03-01T10:00:00.1234567Z").is_some());
        assert!(parse_upstream_timestamp("2024-03-01T10:00:00").is_some());
        assert!(parse_upstream_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_future_added_time_clamps_to_zero() {
        let now = Utc::now();
        let item = queue_item_from_record(
            QueueRecord {
                id: 1,
                title: None,
                download_id: None,
                added: Some((now + chrono::Duration::hours(1)).to_rfc3339()),
                movie_id: None,
                episode_id: None,
            },
            now,
        );
        assert_eq!(item.elapsed_hours, Some(0.0));
        assert_eq!(item.title, "Unknown");
    }
}
