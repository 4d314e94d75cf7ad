//! Search by Saved Query
//!
//! `/query/{name}` searches with a saved definition's filters; the name
//! `0` (or empty) means "no filter". The optional `group_by` parameter
//! switches to an aggregation: `<field>` groups by dictionary terms,
//! `reception <duration>` buckets by time, and
//! `severity <start>,<end>,<step>` buckets numerically.

use super::{parse_range, run_search, SearchParams};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::engine::aggregate::{group_by_numeric, group_by_term, group_by_time};
use crate::store::{Query as StoreQuery, SearchRequest};
use crate::timeutil;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::{response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn base_query(state: &AppState, name: &str) -> ApiResult<Option<StoreQuery>> {
    if name.is_empty() || name == "0" {
        return Ok(None);
    }
    let def = state.meta.read(name)?;
    Ok(def.to_conjunction()?)
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Response> {
    let base = base_query(&state, &name).await?;
    if let Some(group_by) = params.group_by.clone().filter(|g| !g.is_empty()) {
        return grouped(&state, &params, base, &group_by).await;
    }

    let mut req = SearchRequest {
        query: base,
        ..Default::default()
    };
    req.fields = vec!["*".to_string()];
    req.sort = vec!["-reception".to_string()];
    let result = run_search(&state, &params, req).await?;

    let documents: Vec<_> = result.hits.iter().map(|h| h.fields.clone()).collect();
    Ok(Json(json!({
        "total": result.total_hits,
        "documents": documents,
    }))
    .into_response())
}

pub async fn count(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Response> {
    let base = base_query(&state, &name).await?;
    if let Some(group_by) = params.group_by.clone().filter(|g| !g.is_empty()) {
        return grouped(&state, &params, base, &group_by).await;
    }

    let req = SearchRequest {
        query: base,
        size: 0,
        ..Default::default()
    };
    let result = run_search(&state, &params, req).await?;
    Ok(Json(result.total_hits).into_response())
}

/// Dispatch the `group_by` forms. The range start is required; the end
/// defaults to now.
async fn grouped(
    state: &AppState,
    params: &SearchParams,
    base: Option<StoreQuery>,
    group_by: &str,
) -> ApiResult<Response> {
    let (start, end) = parse_range(params)?;
    let start = start.ok_or_else(|| ApiError::BadRequest("start_at is missing".to_string()))?;
    let end = end.unwrap_or_else(Utc::now);
    let cancel = CancellationToken::new();

    let parts: Vec<&str> = group_by.split_whitespace().collect();
    match parts.as_slice() {
        [field] => {
            if *field == "severity" || *field == "reception" {
                return Err(ApiError::BadRequest(format!(
                    "group by({}) is an invalid format",
                    group_by
                )));
            }
            let counts = group_by_term(
                state.searcher.as_ref(),
                &cancel,
                Some(start),
                Some(end),
                base,
                field,
            )
            .await?;
            let rows: Vec<_> = counts
                .into_iter()
                .map(|(name, count)| json!({ "name": name, "count": count }))
                .collect();
            Ok(Json(rows).into_response())
        }
        ["reception", duration] => {
            let step = timeutil::parse_duration(duration).ok_or_else(|| {
                ApiError::BadRequest(format!("`{}' is invalid in 'group by'", duration))
            })?;
            let buckets = group_by_time(
                state.searcher.as_ref(),
                &cancel,
                start,
                end,
                base,
                "reception",
                step,
            )
            .await?;
            Ok(Json(buckets).into_response())
        }
        ["severity", range] => {
            let pieces: Vec<&str> = range.split(',').collect();
            if pieces.len() != 3 {
                return Err(ApiError::BadRequest(format!(
                    "group by({}) is an invalid format",
                    group_by
                )));
            }
            let parse = |s: &str| -> ApiResult<i64> {
                s.parse().map_err(|_| {
                    ApiError::BadRequest(format!("`{}' is invalid in 'group by'", s))
                })
            };
            let buckets = group_by_numeric(
                state.searcher.as_ref(),
                &cancel,
                Some(start),
                Some(end),
                base,
                "severity",
                parse(pieces[0])?,
                parse(pieces[1])?,
                parse(pieces[2])?,
            )
            .await?;
            Ok(Json(buckets).into_response())
        }
        _ => Err(ApiError::BadRequest(format!(
            "group by({}) is an invalid format",
            group_by
        ))),
    }
}
