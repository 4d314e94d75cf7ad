//! Route Handlers
//!
//! Shared query-parameter handling lives here; each endpoint group has
//! its own module.

pub mod fields;
pub mod filters;
pub mod health;
pub mod raw;
pub mod saved;
pub mod syslogs;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::store::{SearchRequest, SearchResult, MAX_SEARCH_HIT_SIZE};
use crate::timeutil;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Query parameters understood by the search-shaped endpoints.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub sort_by: Option<String>,
    pub group_by: Option<String>,
}

/// Parse `start_at`/`end_at` into instants; invalid values are 400s.
pub(crate) fn parse_range(
    params: &SearchParams,
) -> ApiResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let start = match &params.start_at {
        Some(s) if !s.is_empty() => Some(timeutil::parse_time(s).ok_or_else(|| {
            ApiError::BadRequest(format!("start_at({}) is invalid", s))
        })?),
        _ => None,
    };
    let end = match &params.end_at {
        Some(s) if !s.is_empty() => Some(timeutil::parse_time(s).ok_or_else(|| {
            ApiError::BadRequest(format!("end_at({}) is invalid", s))
        })?),
        _ => None,
    };
    Ok((start, end))
}

/// Apply `limit`/`offset`/`sort_by` to a request.
pub(crate) fn apply_params(req: &mut SearchRequest, params: &SearchParams) {
    if let Some(limit) = params.limit {
        req.size = if limit <= 0 {
            MAX_SEARCH_HIT_SIZE
        } else {
            limit as usize
        };
    }
    if let Some(offset) = params.offset {
        req.from = offset.max(0) as usize;
    }
    if let Some(sort_by) = &params.sort_by {
        if !sort_by.is_empty() {
            req.sort = vec![sort_by.clone()];
        }
    }
}

/// Execute a request over the parameters' time range. With neither a
/// range nor a query, everything up to now is searched.
pub(crate) async fn run_search(
    state: &AppState,
    params: &SearchParams,
    mut req: SearchRequest,
) -> ApiResult<SearchResult> {
    let (start, mut end) = parse_range(params)?;
    apply_params(&mut req, params);
    if start.is_none() && end.is_none() && req.query.is_none() {
        end = Some(Utc::now());
    }
    if let Some(q) = &req.query {
        q.validate()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    let cancel = CancellationToken::new();
    Ok(state.searcher.query(&cancel, start, end, req).await?)
}
