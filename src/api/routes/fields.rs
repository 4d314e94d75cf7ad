//! Field Listing and Dictionaries
//!
//! An empty intersecting partition set yields empty lists rather than
//! an error, so dashboards render cleanly against an empty engine.

use super::{parse_range, SearchParams};
use crate::api::error::ApiResult;
use crate::api::state::AppState;
use crate::engine::EngineError;
use crate::store::DictEntry;
use axum::extract::{Path, Query, State};
use axum::Json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub async fn list_fields(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<String>>> {
    let (start, end) = parse_range(&params)?;
    let cancel = CancellationToken::new();
    match state.searcher.fields(&cancel, start, end).await {
        Ok(fields) => Ok(Json(fields)),
        Err(EngineError::EmptyRange) => Ok(Json(Vec::new())),
        Err(e) => Err(e.into()),
    }
}

pub async fn field_dict(
    State(state): State<Arc<AppState>>,
    Path(field): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<DictEntry>>> {
    let (start, end) = parse_range(&params)?;
    let cancel = CancellationToken::new();
    match state.searcher.field_dict(&cancel, start, end, &field).await {
        Ok(entries) => Ok(Json(entries)),
        Err(EngineError::EmptyRange) => Ok(Json(Vec::new())),
        Err(e) => Err(e.into()),
    }
}
