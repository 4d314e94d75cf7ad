//! JSON Ingest
//!
//! `POST /syslogs` accepts a single event object or an array of them.
//! Events are normalized (sequence, reception/timestamp defaults) and
//! pushed onto the batcher channel; a saturated channel applies
//! backpressure to the caller.

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::event::Event;
use crate::observe::Stats;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use std::sync::Arc;

pub async fn ingest(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let body = String::from_utf8_lossy(&body);
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::BadRequest("http body is empty".to_string()));
    }

    let events: Vec<Event> = if body.starts_with('[') {
        serde_json::from_str(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid events: {}", e)))?
    } else if body.starts_with('{') {
        let event: Event = serde_json::from_str(body)
            .map_err(|e| ApiError::BadRequest(format!("invalid event: {}", e)))?;
        vec![event]
    } else {
        return Err(ApiError::BadRequest(
            "http body is not a valid event or event array".to_string(),
        ));
    };

    for mut event in events {
        event.normalize();
        Stats::incr(&state.stats.events_rx);
        state
            .events
            .send(event)
            .await
            .map_err(|_| ApiError::Unavailable("ingest pipeline is stopped".to_string()))?;
    }
    Ok(StatusCode::ACCEPTED)
}
