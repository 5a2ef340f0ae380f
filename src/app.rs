//! Application state and HTTP router construction.
//!
//! Used by `main` through [HttpServerService](crate::services::http_server::HttpServerService)
//! and directly by the router tests.

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::config::Config;
use crate::jobs::{Scheduler, SearchSweepOrchestrator};
use crate::services::ServicesManager;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<SearchSweepOrchestrator>,
    /// `None` when the scheduler is disabled
    pub scheduler: Option<Arc<Scheduler>>,
    pub services: Arc<ServicesManager>,
    /// Process-wide shutdown; background sweeps started over HTTP observe it
    pub shutdown: CancellationToken,
    /// Sweeps started over HTTP; the HTTP service waits for them on stop
    pub sweeps: TaskTracker,
}

/// Build the full Axum router with layers and the JSON 404 fallback.
pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .merge(api::health::router())
        .merge(api::search::router())
        .fallback(api::not_found)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
