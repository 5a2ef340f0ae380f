//! Manual sweep trigger and debug echo

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info};

use crate::app::AppState;
use crate::jobs::SweepResult;

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    /// Run the sweep inline and return its result
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchStartedResponse {
    pub message: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct EchoResponse {
    pub message: &'static str,
    pub received_data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// POST /search
///
/// The sweep lock is taken before responding, so a 202 means this request
/// owns the sweep and a 409 means another one is in flight.
async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Response {
    info!(wait = query.wait, "Manual search triggered");

    let Some(guard) = state.orchestrator.try_begin() else {
        info!("Manual search skipped, a sweep is already running");
        return (StatusCode::CONFLICT, Json(SweepResult::already_running())).into_response();
    };

    // Tracked so shutdown waits for it; awaited below when `wait` is set, so a
    // client disconnect drops only the response.
    let orchestrator = state.orchestrator.clone();
    let shutdown = state.shutdown.clone();
    let sweep = state
        .sweeps
        .spawn(async move { orchestrator.run_with_guard(guard, &shutdown).await });

    if query.wait {
        return match sweep.await {
            Ok(result) => (StatusCode::OK, Json(result)).into_response(),
            Err(e) => {
                error!(error = %e, "Manual search task failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
        };
    }

    (
        StatusCode::ACCEPTED,
        Json(SearchStartedResponse {
            message: "Search started in background",
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

/// POST /test
async fn echo(body: Bytes) -> Response {
    let received_data = if body.iter().all(u8::is_ascii_whitespace) {
        JsonValue::Object(Default::default())
    } else {
        match serde_json::from_slice::<JsonValue>(&body) {
            Ok(v) => v,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("Invalid JSON body: {e}") })),
                )
                    .into_response();
            }
        }
    };
    info!(data = %received_data, "Test endpoint called");
    Json(EchoResponse {
        message: "Test endpoint",
        received_data,
        timestamp: Utc::now(),
    })
    .into_response()
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/search", post(search))
        .route("/test", post(echo))
}
