//! Service info, health and status endpoints

use std::collections::BTreeMap;

use axum::{Json, Router, extract::State, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::AppState;
use crate::jobs::{SchedulerState, SweepRunStatus};
use crate::services::manager::ServiceHealth;

#[derive(Serialize)]
pub struct InfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct UpstreamHealth {
    pub status: &'static str,
    pub url: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Keyed by media manager name (`radarr` / `sonarr`)
    pub upstream: BTreeMap<&'static str, UpstreamHealth>,
    pub services: BTreeMap<String, ServiceHealth>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub scheduler_enabled: bool,
    pub scheduler: Option<SchedulerState>,
    pub sweep: SweepRunStatus,
    pub timestamp: DateTime<Utc>,
}

async fn index() -> Json<InfoResponse> {
    Json(InfoResponse {
        service: "Searcherr",
        version: env!("CARGO_PKG_VERSION"),
        description: "Automated missing media search service",
        status: "running",
        timestamp: Utc::now(),
    })
}

/// Always 200; `status` says whether the media manager answered
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let manager = state.orchestrator.manager();
    let connected = manager.test_connection().await;

    let mut upstream = BTreeMap::new();
    upstream.insert(
        state.config.media_manager.as_str(),
        UpstreamHealth {
            status: if connected { "connected" } else { "disconnected" },
            url: manager.base_url().to_string(),
        },
    );

    Json(HealthResponse {
        status: if connected { "healthy" } else { "unhealthy" },
        upstream,
        services: state.services.health_all().await.into_iter().collect(),
        timestamp: Utc::now(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        scheduler_enabled: state.scheduler.is_some(),
        scheduler: state.scheduler.as_ref().map(|s| s.state()),
        sweep: state.orchestrator.run_state().status(),
        timestamp: Utc::now(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/status", get(status))
}
