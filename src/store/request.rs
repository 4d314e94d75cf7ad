//! Search Requests and Results
//!
//! Request/response shapes shared by the HTTP surface, the query
//! planner and the partition store: paging, sort orders, facet
//! definitions, and merge/fix-up of partial results coming back from
//! multiple partitions.

use crate::store::document::FieldValue;
use crate::store::query::Query;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Upper bound on hits a single request may return.
pub const MAX_SEARCH_HIT_SIZE: usize = 10_000;

fn default_size() -> usize {
    10
}

fn default_facet_size() -> usize {
    10
}

/// A search request. `size`/`from` page the globally sorted hit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: Option<Query>,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default)]
    pub from: usize,
    /// Sort specs: field name, `-` prefix for descending, `_score`,
    /// `_id`. Empty means score-descending.
    #[serde(default)]
    pub sort: Vec<String>,
    /// Stored fields to return; empty or `["*"]` returns everything.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub facets: HashMap<String, FacetRequest>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            size: default_size(),
            from: 0,
            sort: Vec::new(),
            fields: Vec::new(),
            facets: HashMap::new(),
        }
    }
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        Self {
            query: Some(query),
            ..Default::default()
        }
    }

    /// The per-partition request derived from this one: paging is
    /// collapsed to `from = 0, size = size + from` so that the merged
    /// set still covers the caller's window.
    pub fn child(&self) -> SearchRequest {
        SearchRequest {
            query: self.query.clone(),
            size: self.size + self.from,
            from: 0,
            sort: self.sort.clone(),
            fields: self.fields.clone(),
            facets: self.facets.clone(),
        }
    }

    pub fn sort_order(&self) -> Vec<SortField> {
        parse_sort(&self.sort)
    }
}

/// A facet definition: term counting by default, bucketed when date or
/// numeric ranges are given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetRequest {
    pub field: String,
    #[serde(default = "default_facet_size")]
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_ranges: Vec<DateRangeBucket>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numeric_ranges: Vec<NumericRangeBucket>,
}

impl FacetRequest {
    pub fn term(field: impl Into<String>, size: usize) -> Self {
        Self {
            field: field.into(),
            size,
            date_ranges: Vec::new(),
            numeric_ranges: Vec::new(),
        }
    }
}

/// `[start, end)` bucket; open on a missing bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRangeBucket {
    pub name: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

/// `[min, max)` bucket; open on a missing bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericRangeBucket {
    pub name: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// One matching document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
    /// Path of the partition that produced the hit; set by the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermFacet {
    pub term: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRangeFacet {
    pub name: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericRangeFacet {
    pub name: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub count: u64,
}

/// A facet over one partition or merged over several.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetResult {
    pub field: String,
    pub total: u64,
    pub missing: u64,
    pub other: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<TermFacet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_ranges: Vec<DateRangeFacet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numeric_ranges: Vec<NumericRangeFacet>,
}

impl FacetResult {
    /// Fold another partition's counts into this one.
    pub fn merge(&mut self, other: FacetResult) {
        self.total += other.total;
        self.missing += other.missing;
        self.other += other.other;
        for t in other.terms {
            match self.terms.iter_mut().find(|x| x.term == t.term) {
                Some(x) => x.count += t.count,
                None => self.terms.push(t),
            }
        }
        for r in other.date_ranges {
            match self.date_ranges.iter_mut().find(|x| x.name == r.name) {
                Some(x) => x.count += r.count,
                None => self.date_ranges.push(r),
            }
        }
        for r in other.numeric_ranges {
            match self.numeric_ranges.iter_mut().find(|x| x.name == r.name) {
                Some(x) => x.count += r.count,
                None => self.numeric_ranges.push(r),
            }
        }
    }

    /// Post-merge clean-up: trim the term list to `size` (dropped
    /// counts move into `other`), order range buckets by their lower
    /// bound.
    pub fn fixup(&mut self, size: usize) {
        self.terms
            .sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.term.cmp(&b.term)));
        if self.terms.len() > size {
            let dropped: u64 = self.terms[size..].iter().map(|t| t.count).sum();
            self.terms.truncate(size);
            self.other += dropped;
        }
        self.date_ranges.sort_by(|a, b| match (&a.start, &b.start) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        });
        self.numeric_ranges.sort_by(|a, b| match (&a.min, &b.min) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.total_cmp(y),
        });
    }
}

/// Per-request bookkeeping: how many partitions answered, which failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStatus {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
}

/// The merged search result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub status: SearchStatus,
    pub total_hits: u64,
    pub max_score: f64,
    pub hits: Vec<SearchHit>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub facets: HashMap<String, FacetResult>,
    pub took_ms: u64,
}

impl SearchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge another partition's result: counts, maxima, facet counts;
    /// hits are concatenated (global ordering is restored afterwards).
    pub fn merge(&mut self, other: SearchResult) {
        self.status.total += other.status.total;
        self.status.successful += other.status.successful;
        self.status.failed += other.status.failed;
        self.total_hits += other.total_hits;
        if other.max_score > self.max_score {
            self.max_score = other.max_score;
        }
        self.hits.extend(other.hits);
        for (name, facet) in other.facets {
            match self.facets.get_mut(&name) {
                Some(f) => f.merge(facet),
                None => {
                    self.facets.insert(name, facet);
                }
            }
        }
    }
}

/// One component of a sort order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// Parse sort specs (`"-reception"`, `"_score"`, ...).
pub fn parse_sort(specs: &[String]) -> Vec<SortField> {
    specs
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('-') {
            Some(rest) => SortField {
                field: rest.to_string(),
                descending: true,
            },
            None => SortField {
                field: s.to_string(),
                descending: false,
            },
        })
        .collect()
}

/// Compare two hits under `order`. An empty order means score
/// descending. Missing field values sort last regardless of direction;
/// full ties fall back to ascending id so paging is stable across
/// partitions.
pub fn compare_hits(order: &[SortField], a: &SearchHit, b: &SearchHit) -> Ordering {
    for sf in order {
        let ord = match sf.field.as_str() {
            "_score" | "score" => a.score.total_cmp(&b.score),
            "_id" => a.id.cmp(&b.id),
            field => match (a.fields.get(field), b.fields.get(field)) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => return Ordering::Greater,
                (Some(_), None) => return Ordering::Less,
                (Some(x), Some(y)) => x.compare(y),
            },
        };
        let ord = if sf.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if order.is_empty() {
        let ord = b.score.total_cmp(&a.score);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f64, severity: i64) -> SearchHit {
        let mut fields = HashMap::new();
        fields.insert("severity".to_string(), FieldValue::Integer(severity));
        SearchHit {
            id: id.to_string(),
            score,
            fields,
            partition: None,
        }
    }

    #[test]
    fn test_child_request_collapses_paging() {
        let req = SearchRequest {
            size: 3,
            from: 2,
            ..Default::default()
        };
        let child = req.child();
        assert_eq!(child.size, 5);
        assert_eq!(child.from, 0);
    }

    #[test]
    fn test_parse_sort() {
        let order = parse_sort(&["-reception".to_string(), "_id".to_string()]);
        assert_eq!(order[0].field, "reception");
        assert!(order[0].descending);
        assert!(!order[1].descending);
    }

    #[test]
    fn test_compare_hits_default_score_desc() {
        let a = hit("a", 1.0, 0);
        let b = hit("b", 2.0, 0);
        let mut hits = vec![a, b];
        hits.sort_by(|x, y| compare_hits(&[], x, y));
        assert_eq!(hits[0].id, "b");
    }

    #[test]
    fn test_compare_hits_by_field() {
        let order = parse_sort(&["-severity".to_string()]);
        let mut hits = vec![hit("a", 0.0, 3), hit("b", 0.0, 7), hit("c", 0.0, 5)];
        hits.sort_by(|x, y| compare_hits(&order, x, y));
        let got: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(got, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_compare_hits_missing_last() {
        let order = parse_sort(&["severity".to_string()]);
        let mut missing = hit("m", 0.0, 0);
        missing.fields.clear();
        let mut hits = vec![missing, hit("a", 0.0, 1)];
        hits.sort_by(|x, y| compare_hits(&order, x, y));
        assert_eq!(hits[1].id, "m");
    }

    #[test]
    fn test_facet_merge_and_fixup() {
        let mut a = FacetResult {
            field: "host".into(),
            total: 3,
            terms: vec![
                TermFacet { term: "web1".into(), count: 2 },
                TermFacet { term: "web2".into(), count: 1 },
            ],
            ..Default::default()
        };
        let b = FacetResult {
            field: "host".into(),
            total: 2,
            terms: vec![
                TermFacet { term: "web1".into(), count: 1 },
                TermFacet { term: "web3".into(), count: 1 },
            ],
            ..Default::default()
        };
        a.merge(b);
        a.fixup(2);

        assert_eq!(a.total, 5);
        assert_eq!(a.terms.len(), 2);
        assert_eq!(a.terms[0].term, "web1");
        assert_eq!(a.terms[0].count, 3);
        assert_eq!(a.other, 1);
    }

    #[test]
    fn test_result_merge() {
        let mut a = SearchResult {
            total_hits: 2,
            max_score: 1.5,
            hits: vec![hit("a", 1.5, 1)],
            status: SearchStatus { total: 1, successful: 1, ..Default::default() },
            ..Default::default()
        };
        let b = SearchResult {
            total_hits: 1,
            max_score: 3.0,
            hits: vec![hit("b", 3.0, 1)],
            status: SearchStatus { total: 1, successful: 1, ..Default::default() },
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.total_hits, 3);
        assert_eq!(a.max_score, 3.0);
        assert_eq!(a.hits.len(), 2);
        assert_eq!(a.status.successful, 2);
    }
}
