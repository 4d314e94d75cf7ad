//! Saved-Query CRUD
//!
//! Definitions are validated by compiling their filters before they are
//! stored, so a bad definition fails at save time rather than at first
//! use.

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::meta::QueryDef;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

fn validate(def: &QueryDef) -> ApiResult<()> {
    if def.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    def.to_queries()?;
    Ok(())
}

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<QueryDef>>> {
    Ok(Json(state.meta.list_ids()))
}

pub async fn read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<QueryDef>> {
    Ok(Json(state.meta.read(&id)?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(def): Json<QueryDef>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    validate(&def)?;
    let id = state.meta.create(def)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(def): Json<QueryDef>,
) -> ApiResult<StatusCode> {
    validate(&def)?;
    state.meta.update(&id, def)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.meta.delete(&id)?;
    Ok(StatusCode::OK)
}
