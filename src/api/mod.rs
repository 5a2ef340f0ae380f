//! HTTP route definitions

pub mod health;
pub mod search;

use axum::{Json, http::StatusCode};
use serde_json::json;

/// Fallback for every unknown route
pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Endpoint not found" })),
    )
}
