//! Health and Stats

use crate::api::state::AppState;
use crate::observe::StatsSnapshot;
use axum::extract::State;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
