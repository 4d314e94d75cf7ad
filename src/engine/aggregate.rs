//! Aggregation Helpers
//!
//! Group-by operations built on the planner and the partition store's
//! dictionary and facet capabilities. A time range with no intersecting
//! partitions yields empty results rather than an error, so callers can
//! treat "no data yet" uniformly.

use crate::engine::{EngineError, Searcher};
use crate::store::{
    DateRangeBucket, DateRangeFacet, FacetRequest, NumericRangeBucket, NumericRangeFacet, Query,
    SearchRequest,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Count matches of `base AND term(field, value)` for every term in
/// the field's dictionary across the range.
pub async fn group_by_term<S>(
    searcher: &S,
    cancel: &CancellationToken,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    base: Option<Query>,
    field: &str,
) -> Result<BTreeMap<String, u64>, EngineError>
where
    S: Searcher + ?Sized,
{
    if let Some(q) = &base {
        q.validate()?;
    }
    let dict = match searcher.field_dict(cancel, start, end, field).await {
        Err(EngineError::EmptyRange) => return Ok(BTreeMap::new()),
        other => other?,
    };

    let mut counts = BTreeMap::new();
    for entry in dict {
        let term_query = Query::Term {
            field: field.to_string(),
            term: entry.term.clone(),
        };
        let mut req = SearchRequest::new(Query::conjoin(base.clone(), term_query));
        req.size = 0;
        let result = searcher.query(cancel, start, end, req).await?;
        counts.insert(entry.term, result.total_hits);
    }
    Ok(counts)
}

/// Bucket matches of `base` into contiguous `[t, t+step)` windows
/// covering `[start, end]`, returned in ascending bucket order.
pub async fn group_by_time<S>(
    searcher: &S,
    cancel: &CancellationToken,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    base: Option<Query>,
    field: &str,
    step: Duration,
) -> Result<Vec<DateRangeFacet>, EngineError>
where
    S: Searcher + ?Sized,
{
    let step = chrono::Duration::from_std(step)
        .map_err(|_| EngineError::BadArguments("step is not representable".to_string()))?;
    if step <= chrono::Duration::zero() {
        return Err(EngineError::BadArguments("step must be positive".to_string()));
    }
    if start >= end {
        return Err(EngineError::BadArguments(
            "start must precede end".to_string(),
        ));
    }
    if let Some(q) = &base {
        q.validate()?;
    }

    let mut date_ranges = Vec::new();
    let mut next_start = start;
    while next_start < end {
        let next_end = next_start + step;
        date_ranges.push(DateRangeBucket {
            name: format!("{}-{}", next_start.timestamp(), next_end.timestamp()),
            start: Some(next_start),
            end: Some(next_end),
        });
        next_start = next_end;
    }

    let mut req = SearchRequest {
        query: base,
        size: 0,
        ..Default::default()
    };
    req.facets.insert(
        field.to_string(),
        FacetRequest {
            field: field.to_string(),
            size: date_ranges.len().max(1),
            date_ranges,
            numeric_ranges: Vec::new(),
        },
    );

    let result = match searcher.query(cancel, Some(start), Some(end), req).await {
        Err(EngineError::EmptyRange) => return Ok(Vec::new()),
        other => other?,
    };
    Ok(result
        .facets
        .get(field)
        .map(|f| f.date_ranges.clone())
        .unwrap_or_default())
}

/// Bucket matches of `base` over `[start, end]` of the numeric `field`
/// in steps of `step`. The first bucket is open below, the last open
/// above.
pub async fn group_by_numeric<S>(
    searcher: &S,
    cancel: &CancellationToken,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    base: Option<Query>,
    field: &str,
    range_start: i64,
    range_end: i64,
    step: i64,
) -> Result<Vec<NumericRangeFacet>, EngineError>
where
    S: Searcher + ?Sized,
{
    if step <= 0 {
        return Err(EngineError::BadArguments("step must be positive".to_string()));
    }
    if range_start >= range_end {
        return Err(EngineError::BadArguments(
            "range start must precede range end".to_string(),
        ));
    }
    if let Some(q) = &base {
        q.validate()?;
    }

    let mut numeric_ranges = Vec::new();
    let mut next_start = range_start;
    while next_start < range_end {
        let next_end = (next_start + step).min(range_end);
        let min = if next_start == range_start {
            None
        } else {
            Some(next_start as f64)
        };
        let max = if next_end == range_end {
            None
        } else {
            Some(next_end as f64)
        };
        numeric_ranges.push(NumericRangeBucket {
            name: next_start.to_string(),
            min,
            max,
        });
        next_start = next_end;
    }

    let mut req = SearchRequest {
        query: base,
        size: 0,
        ..Default::default()
    };
    req.facets.insert(
        field.to_string(),
        FacetRequest {
            field: field.to_string(),
            size: numeric_ranges.len().max(1),
            date_ranges: Vec::new(),
            numeric_ranges,
        },
    );

    let result = match searcher.query(cancel, start, end, req).await {
        Err(EngineError::EmptyRange) => return Ok(Vec::new()),
        other => other?,
    };
    Ok(result
        .facets
        .get(field)
        .map(|f| f.numeric_ranges.clone())
        .unwrap_or_default())
}
