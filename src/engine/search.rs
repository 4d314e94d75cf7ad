//! Fan-Out Search Planner
//!
//! Executes one search request against every partition intersecting the
//! requested time range and merges the partial results so the caller
//! sees a single index: global sort order, paging applied after the
//! merge, facet counts summed and fixed up, and per-partition failures
//! collected into the result's error map rather than failing the whole
//! request (unless no partition answered at all).

use crate::engine::partition::Partition;
use crate::engine::{Engine, EngineError};
use crate::store::{compare_hits, Query, SearchRequest, SearchResult};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// AND a `reception` range filter into the request so hits outside
/// `[start, end]` are excluded even when a partition's boundaries are
/// wider than the request.
pub(crate) fn inject_time_filter(
    req: &mut SearchRequest,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) {
    if start.is_none() && end.is_none() {
        return;
    }
    let time_query = Query::DateRange {
        field: "reception".to_string(),
        start,
        end,
    };
    req.query = Some(Query::conjoin(req.query.take(), time_query));
}

/// Fan a request out over `partitions` and merge.
pub(crate) async fn multi_search(
    engine: &Engine,
    cancel: &CancellationToken,
    req: &SearchRequest,
    partitions: Vec<Arc<Partition>>,
) -> Result<SearchResult, EngineError> {
    let started = Instant::now();
    let child = req.child();

    let results = join_all(partitions.iter().map(|partition| {
        let child = child.clone();
        async move {
            let outcome: Result<SearchResult, EngineError> = async {
                let leased = engine.pool().load(cancel, partition).await?;
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                Ok(leased.search(&child)?)
            }
            .await;
            (partition.path.display().to_string(), outcome)
        }
    }))
    .await;

    let mut merged: Option<SearchResult> = None;
    let mut errors: HashMap<String, String> = HashMap::new();
    for (path, outcome) in results {
        match outcome {
            Ok(mut partial) => {
                for hit in &mut partial.hits {
                    hit.partition = Some(path.clone());
                }
                match merged.as_mut() {
                    Some(m) => m.merge(partial),
                    None => merged = Some(partial),
                }
            }
            Err(e) => {
                errors.insert(path, e.to_string());
            }
        }
    }

    // No partition answered: synthesize an empty result carrying the
    // error map.
    let mut result = merged.unwrap_or_else(SearchResult::empty);

    let order = req.sort_order();
    result.hits.sort_by(|a, b| compare_hits(&order, a, b));

    if req.from > 0 {
        if result.hits.len() > req.from {
            result.hits.drain(..req.from);
        } else {
            result.hits.clear();
        }
    }
    result.hits.truncate(req.size);

    for (name, facet_req) in &req.facets {
        if let Some(facet) = result.facets.get_mut(name) {
            facet.fixup(facet_req.size);
        }
    }

    result.status.total += errors.len() as u64;
    result.status.failed += errors.len() as u64;
    result.status.errors = errors;
    result.took_ms = started.elapsed().as_millis() as u64;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, IndexContinuation};
    use crate::event::Event;
    use crate::store::{FieldValue, SearchStatus};
    use crate::timeutil;
    use std::collections::HashMap as StdHashMap;
    use tempfile::tempdir;

    fn scored_event(at: &str, severity: i64) -> Event {
        let t = timeutil::parse_time(at).unwrap();
        let mut fields = StdHashMap::new();
        fields.insert(
            "message".to_string(),
            FieldValue::Text(format!("entry severity {}", severity)),
        );
        fields.insert("severity".to_string(), FieldValue::Integer(severity));
        fields.insert("timestamp".to_string(), FieldValue::Time(t));
        let mut e = Event::new("raw".to_string(), fields);
        e.stamp("127.0.0.1:1");
        e.reception = t;
        e.fields.insert("timestamp".to_string(), FieldValue::Time(t));
        e.fields.insert("reception".to_string(), FieldValue::Time(t));
        e
    }

    #[test]
    fn test_inject_time_filter_wraps_existing_query() {
        let start = timeutil::parse_time("2023-01-02T03:00:00Z").unwrap();
        let mut req = SearchRequest::new(Query::QueryString {
            query: "hi".into(),
        });
        inject_time_filter(&mut req, Some(start), None);
        match req.query.unwrap() {
            Query::Conjunction { queries } => {
                assert_eq!(queries.len(), 2);
                assert!(matches!(queries[1], Query::DateRange { .. }));
            }
            other => panic!("unexpected query: {:?}", other),
        }

        // No bounds: untouched.
        let mut req = SearchRequest::default();
        inject_time_filter(&mut req, None, None);
        assert!(req.query.is_none());
    }

    /// Two partitions with severities [9,7,5,3,1] and [8,6,4,2,0];
    /// size=3, from=2, descending severity must yield [6,5,4].
    #[tokio::test]
    async fn test_top_k_paging_across_partitions() {
        let dir = tempdir().unwrap();
        let mut cfg = EngineConfig::new(dir.path());
        cfg.index_duration = std::time::Duration::from_secs(3600);
        let engine = Engine::open(cfg).unwrap();

        let mut continuation = IndexContinuation::new();
        let mut events = Vec::new();
        for sev in [9i64, 7, 5, 3, 1] {
            events.push(scored_event("2023-01-02T03:30:00Z", sev));
        }
        for sev in [8i64, 6, 4, 2, 0] {
            events.push(scored_event("2023-01-02T04:30:00Z", sev));
        }
        engine.index(&mut continuation, events).await.unwrap();
        continuation.release();

        assert_eq!(engine.registry().snapshot().len(), 2);

        let cancel = CancellationToken::new();
        let mut req = SearchRequest::default();
        req.sort = vec!["-severity".to_string()];
        req.size = 3;
        req.from = 2;
        let result = engine
            .query(
                &cancel,
                Some(timeutil::parse_time("2023-01-02T03:00:00Z").unwrap()),
                Some(timeutil::parse_time("2023-01-02T05:00:00Z").unwrap()),
                req,
            )
            .await
            .unwrap();

        let sevs: Vec<i64> = result
            .hits
            .iter()
            .map(|h| match h.fields.get("severity") {
                Some(FieldValue::Integer(i)) => *i,
                _ => panic!("missing severity"),
            })
            .collect();
        assert_eq!(sevs, vec![6, 5, 4]);
        assert_eq!(result.total_hits, 10);
        assert!(result.status.errors.is_empty());

        engine.close().await;
    }

    #[tokio::test]
    async fn test_from_past_end_yields_no_hits() {
        let dir = tempdir().unwrap();
        let mut cfg = EngineConfig::new(dir.path());
        cfg.index_duration = std::time::Duration::from_secs(3600);
        let engine = Engine::open(cfg).unwrap();

        let mut continuation = IndexContinuation::new();
        engine
            .index(&mut continuation, vec![scored_event("2023-01-02T03:30:00Z", 1)])
            .await
            .unwrap();
        continuation.release();

        let cancel = CancellationToken::new();
        let mut req = SearchRequest::default();
        req.from = 10;
        let result = engine.query(&cancel, None, None, req).await.unwrap();
        assert!(result.hits.is_empty());
        assert_eq!(result.total_hits, 1);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_empty_range_is_an_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(EngineConfig::new(dir.path())).unwrap();

        let cancel = CancellationToken::new();
        let err = engine
            .query(&cancel, None, None, SearchRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyRange));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_time_filter_excludes_wider_partition_content() {
        let dir = tempdir().unwrap();
        let mut cfg = EngineConfig::new(dir.path());
        cfg.index_duration = std::time::Duration::from_secs(3600);
        let engine = Engine::open(cfg).unwrap();

        // Two events in the same partition with distinct reception
        // times; a request over a sub-range must not see both even
        // though the partition covers the whole hour.
        let mut make = |at: &str, sev: i64| {
            let mut e = scored_event(at, sev);
            let t = timeutil::parse_time(at).unwrap();
            e.reception = t;
            e.fields
                .insert("reception".to_string(), FieldValue::Time(t));
            e
        };
        let a = make("2023-01-02T03:10:00Z", 1);
        let b = make("2023-01-02T03:50:00Z", 2);

        let mut continuation = IndexContinuation::new();
        engine.index(&mut continuation, vec![a, b]).await.unwrap();
        continuation.release();
        assert_eq!(engine.registry().snapshot().len(), 1);

        let cancel = CancellationToken::new();
        let mut req = SearchRequest::default();
        req.size = 10;
        let result = engine
            .query(
                &cancel,
                Some(timeutil::parse_time("2023-01-02T03:00:00Z").unwrap()),
                Some(timeutil::parse_time("2023-01-02T03:30:00Z").unwrap()),
                req,
            )
            .await
            .unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(
            result.hits[0].fields.get("severity"),
            Some(&FieldValue::Integer(1))
        );

        let status: &SearchStatus = &result.status;
        assert_eq!(status.failed, 0);

        engine.close().await;
    }
}
