//! Raw Search Endpoints
//!
//! `GET /raw` runs a query-string search; `POST /raw` accepts a full
//! search request body. The `/count` variants return only the total.

use super::{run_search, SearchParams};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::store::{FieldValue, Query as StoreQuery, SearchRequest};
use axum::extract::{Query, State};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;

fn query_string_request(params: &SearchParams) -> ApiResult<SearchRequest> {
    let q = params
        .q
        .as_deref()
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("q is required".to_string()))?;
    let mut req = SearchRequest::new(StoreQuery::QueryString {
        query: q.to_string(),
    });
    req.fields = vec!["*".to_string()];
    Ok(req)
}

fn documents(result: &crate::store::SearchResult) -> Vec<HashMap<String, FieldValue>> {
    result.hits.iter().map(|h| h.fields.clone()).collect()
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<HashMap<String, FieldValue>>>> {
    let req = query_string_request(&params)?;
    let result = run_search(&state, &params, req).await?;
    Ok(Json(documents(&result)))
}

pub async fn search_body(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
    Json(mut req): Json<SearchRequest>,
) -> ApiResult<Json<Vec<HashMap<String, FieldValue>>>> {
    if req.fields.is_empty() {
        req.fields = vec!["*".to_string()];
    }
    let result = run_search(&state, &params, req).await?;
    Ok(Json(documents(&result)))
}

pub async fn count(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<u64>> {
    let mut req = query_string_request(&params)?;
    req.size = 0;
    let result = run_search(&state, &params, req).await?;
    Ok(Json(result.total_hits))
}

pub async fn count_body(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
    Json(mut req): Json<SearchRequest>,
) -> ApiResult<Json<u64>> {
    req.size = 0;
    let result = run_search(&state, &params, req).await?;
    Ok(Json(result.total_hits))
}
