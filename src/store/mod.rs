//! Partition Store
//!
//! The per-partition writer/searcher. A partition occupies one directory
//! whose name encodes the inclusive start time; an `end-time` file inside
//! holds the exclusive end. Documents are spread over a fixed number of
//! shards by document-id hash; every other file in the directory is
//! opaque to the engine.
//!
//! Capabilities: batch indexing, top-K search with sort orders and
//! facets, field listing, and per-field dictionary enumeration.

pub mod document;
pub mod query;
pub mod request;
mod shard;

pub use document::{tokenize, Document, FieldValue};
pub use query::{parse_query_string, CompiledQuery, Query, QueryError};
pub use request::{
    compare_hits, parse_sort, DateRangeBucket, DateRangeFacet, FacetRequest, FacetResult,
    NumericRangeBucket, NumericRangeFacet, SearchHit, SearchRequest, SearchResult, SearchStatus,
    SortField, TermFacet, MAX_SEARCH_HIT_SIZE,
};

use crate::timeutil;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use shard::Shard;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Name of the metadata file holding the exclusive end time.
pub const END_TIME_FILE: &str = "end-time";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("corrupt partition: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// One dictionary entry for a field.
#[derive(Debug, Clone, Serialize)]
pub struct DictEntry {
    pub term: String,
    pub count: u64,
}

/// An open partition: a directory of shard logs plus the end-time file.
pub struct PartitionStore {
    /// Descriptor id this store was opened for; the pool uses it to
    /// detect slot rebinds.
    pub id: u64,
    path: PathBuf,
    shards: Vec<Mutex<Shard>>,
}

impl PartitionStore {
    /// Create a fresh partition directory with `num_shards` empty shard
    /// logs and the end-time file.
    pub fn create(
        id: u64,
        path: &Path,
        end: DateTime<Utc>,
        num_shards: usize,
    ) -> Result<Self, StoreError> {
        let num_shards = num_shards.max(1);
        std::fs::create_dir_all(path)?;
        std::fs::write(
            path.join(END_TIME_FILE),
            format!("{}\n", timeutil::format_partition_time(end)),
        )?;

        let mut shards = Vec::with_capacity(num_shards);
        for i in 0..num_shards {
            let shard = Shard::open(&path.join(format!("shard-{:03}.log", i)))?;
            shards.push(Mutex::new(shard));
        }
        Ok(Self {
            id,
            path: path.to_path_buf(),
            shards,
        })
    }

    /// Open an existing partition directory, discovering its shards.
    pub fn open(id: u64, path: &Path) -> Result<Self, StoreError> {
        let mut shard_paths = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("shard-") && name.ends_with(".log") {
                shard_paths.push(entry.path());
            }
        }
        if shard_paths.is_empty() {
            return Err(StoreError::Corrupt(format!(
                "no shard logs in {}",
                path.display()
            )));
        }
        shard_paths.sort();

        let mut shards = Vec::with_capacity(shard_paths.len());
        for p in &shard_paths {
            shards.push(Mutex::new(Shard::open(p)?));
        }
        Ok(Self {
            id,
            path: path.to_path_buf(),
            shards,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn doc_count(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().doc_count()).sum()
    }

    /// Index a batch. Documents are routed to shards by id hash;
    /// insertion order is preserved within each shard.
    pub fn batch_index(&self, docs: Vec<Document>) -> Result<(), StoreError> {
        let mut per_shard: Vec<Vec<Document>> = (0..self.shards.len()).map(|_| Vec::new()).collect();
        for doc in docs {
            let mut hasher = DefaultHasher::new();
            doc.id.hash(&mut hasher);
            let idx = (hasher.finish() % self.shards.len() as u64) as usize;
            per_shard[idx].push(doc);
        }
        for (idx, batch) in per_shard.into_iter().enumerate() {
            if !batch.is_empty() {
                self.shards[idx].lock().index(batch)?;
            }
        }
        Ok(())
    }

    /// Execute a search against this partition alone.
    pub fn search(&self, req: &SearchRequest) -> Result<SearchResult, StoreError> {
        let started = Instant::now();
        let compiled = match &req.query {
            Some(q) => q.compile()?,
            None => CompiledQuery::MatchAll,
        };

        let mut facets: HashMap<String, FacetResult> = req
            .facets
            .iter()
            .map(|(name, freq)| (name.clone(), init_facet(freq)))
            .collect();

        let mut hits = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for doc in shard.docs() {
                if let Some(score) = compiled.score(doc) {
                    for (name, freq) in &req.facets {
                        if let Some(acc) = facets.get_mut(name) {
                            facet_count(acc, freq, doc);
                        }
                    }
                    hits.push(make_hit(doc, score, &req.fields));
                }
            }
        }

        let total_hits = hits.len() as u64;
        let max_score = hits.iter().map(|h| h.score).fold(0.0, f64::max);

        let order = req.sort_order();
        hits.sort_by(|a, b| compare_hits(&order, a, b));
        if req.from > 0 {
            if hits.len() > req.from {
                hits.drain(..req.from);
            } else {
                hits.clear();
            }
        }
        hits.truncate(req.size);

        Ok(SearchResult {
            status: SearchStatus {
                total: 1,
                successful: 1,
                failed: 0,
                errors: HashMap::new(),
            },
            total_hits,
            max_score,
            hits,
            facets,
            took_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Names of all fields present in this partition, sorted.
    pub fn fields(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for f in shard.fields() {
                if !out.contains(f) {
                    out.push(f.clone());
                }
            }
        }
        out.sort();
        out
    }

    /// Dictionary entries for `field`, merged across shards, sorted by
    /// term.
    pub fn field_dict(&self, field: &str) -> Vec<DictEntry> {
        let mut merged: BTreeMap<String, u64> = BTreeMap::new();
        for shard in &self.shards {
            let shard = shard.lock();
            if let Some(dict) = shard.dict(field) {
                for (term, count) in dict {
                    *merged.entry(term.clone()).or_insert(0) += count;
                }
            }
        }
        merged
            .into_iter()
            .map(|(term, count)| DictEntry { term, count })
            .collect()
    }

    /// Flush and sync every shard log.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut first_err = None;
        for shard in &self.shards {
            if let Err(e) = shard.lock().close() {
                tracing::warn!("closing shard in {}: {}", self.path.display(), e);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn init_facet(freq: &FacetRequest) -> FacetResult {
    FacetResult {
        field: freq.field.clone(),
        date_ranges: freq
            .date_ranges
            .iter()
            .map(|b| DateRangeFacet {
                name: b.name.clone(),
                start: b.start,
                end: b.end,
                count: 0,
            })
            .collect(),
        numeric_ranges: freq
            .numeric_ranges
            .iter()
            .map(|b| NumericRangeFacet {
                name: b.name.clone(),
                min: b.min,
                max: b.max,
                count: 0,
            })
            .collect(),
        ..Default::default()
    }
}

fn facet_count(acc: &mut FacetResult, freq: &FacetRequest, doc: &Document) {
    let value = match doc.fields.get(&freq.field) {
        Some(v) => v,
        None => {
            acc.missing += 1;
            return;
        }
    };

    if !freq.date_ranges.is_empty() {
        match value.as_time() {
            Some(t) => {
                let mut matched = false;
                for (bucket, out) in freq.date_ranges.iter().zip(acc.date_ranges.iter_mut()) {
                    if bucket.start.map_or(true, |s| t >= s) && bucket.end.map_or(true, |e| t < e) {
                        out.count += 1;
                        matched = true;
                    }
                }
                if matched {
                    acc.total += 1;
                } else {
                    acc.other += 1;
                }
            }
            None => acc.other += 1,
        }
    } else if !freq.numeric_ranges.is_empty() {
        match value.as_f64() {
            Some(v) => {
                let mut matched = false;
                for (bucket, out) in freq.numeric_ranges.iter().zip(acc.numeric_ranges.iter_mut()) {
                    if bucket.min.map_or(true, |m| v >= m) && bucket.max.map_or(true, |m| v < m) {
                        out.count += 1;
                        matched = true;
                    }
                }
                if matched {
                    acc.total += 1;
                } else {
                    acc.other += 1;
                }
            }
            None => acc.other += 1,
        }
    } else {
        let tokens = document::value_tokens(value);
        if tokens.is_empty() {
            acc.other += 1;
            return;
        }
        acc.total += 1;
        for token in tokens {
            match acc.terms.iter_mut().find(|t| t.term == token) {
                Some(t) => t.count += 1,
                None => acc.terms.push(TermFacet { term: token, count: 1 }),
            }
        }
    }
}

fn make_hit(doc: &Document, score: f64, wanted: &[String]) -> SearchHit {
    let all = wanted.is_empty() || wanted.iter().any(|f| f == "*");
    let fields = if all {
        doc.fields.clone()
    } else {
        doc.fields
            .iter()
            .filter(|(k, _)| wanted.iter().any(|w| w == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    SearchHit {
        id: doc.id.clone(),
        score,
        fields,
        partition: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn utc(s: &str) -> DateTime<Utc> {
        timeutil::parse_time(s).unwrap()
    }

    fn doc(id: &str, message: &str, severity: i64, at: &str) -> Document {
        let mut fields = HashMap::new();
        fields.insert("message".to_string(), FieldValue::Text(message.to_string()));
        fields.insert("severity".to_string(), FieldValue::Integer(severity));
        fields.insert("reception".to_string(), FieldValue::Time(utc(at)));
        Document::new(id, fields)
    }

    fn test_store(num_shards: usize) -> (PartitionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2023-01-02T03-00-00");
        let store =
            PartitionStore::create(1, &path, utc("2023-01-02T04:00:00Z"), num_shards).unwrap();
        (store, dir)
    }

    #[test]
    fn test_create_writes_end_time_file() {
        let (store, _dir) = test_store(2);
        let content = std::fs::read_to_string(store.path().join(END_TIME_FILE)).unwrap();
        assert_eq!(content.trim(), "2023-01-02T04-00-00");
    }

    #[test]
    fn test_index_and_search() {
        let (store, _dir) = test_store(4);
        store
            .batch_index(vec![
                doc("a", "connection refused", 3, "2023-01-02T03:10:00Z"),
                doc("b", "connection accepted", 6, "2023-01-02T03:20:00Z"),
                doc("c", "disk full", 2, "2023-01-02T03:30:00Z"),
            ])
            .unwrap();

        let req = SearchRequest::new(Query::Match {
            field: "message".into(),
            value: "connection".into(),
        });
        let result = store.search(&req).unwrap();
        assert_eq!(result.total_hits, 2);
        assert_eq!(result.hits.len(), 2);

        let req = SearchRequest::new(Query::QueryString {
            query: "disk".into(),
        });
        let result = store.search(&req).unwrap();
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.hits[0].id, "c");
    }

    #[test]
    fn test_search_sort_and_paging() {
        let (store, _dir) = test_store(2);
        let docs = (0..5)
            .map(|i| {
                doc(
                    &format!("d{}", i),
                    "event",
                    (i * 2) as i64,
                    "2023-01-02T03:10:00Z",
                )
            })
            .collect();
        store.batch_index(docs).unwrap();

        let mut req = SearchRequest::new(Query::MatchAll);
        req.sort = vec!["-severity".to_string()];
        req.size = 2;
        req.from = 1;
        let result = store.search(&req).unwrap();
        assert_eq!(result.total_hits, 5);
        let sevs: Vec<i64> = result
            .hits
            .iter()
            .map(|h| match h.fields.get("severity") {
                Some(FieldValue::Integer(i)) => *i,
                _ => panic!("missing severity"),
            })
            .collect();
        assert_eq!(sevs, vec![6, 4]);
    }

    #[test]
    fn test_size_zero_returns_counts_only() {
        let (store, _dir) = test_store(2);
        store
            .batch_index(vec![doc("a", "x", 1, "2023-01-02T03:10:00Z")])
            .unwrap();
        let mut req = SearchRequest::new(Query::MatchAll);
        req.size = 0;
        let result = store.search(&req).unwrap();
        assert_eq!(result.total_hits, 1);
        assert!(result.hits.is_empty());
    }

    #[test]
    fn test_fields_and_dict() {
        let (store, _dir) = test_store(2);
        store
            .batch_index(vec![
                doc("a", "alpha beta", 1, "2023-01-02T03:10:00Z"),
                doc("b", "beta gamma", 2, "2023-01-02T03:11:00Z"),
            ])
            .unwrap();

        let fields = store.fields();
        assert!(fields.contains(&"message".to_string()));
        assert!(fields.contains(&"severity".to_string()));

        let dict = store.field_dict("message");
        let beta = dict.iter().find(|e| e.term == "beta").unwrap();
        assert_eq!(beta.count, 2);
    }

    #[test]
    fn test_date_facet_counts() {
        let (store, _dir) = test_store(2);
        store
            .batch_index(vec![
                doc("a", "x", 1, "2023-01-02T03:10:00Z"),
                doc("b", "x", 1, "2023-01-02T03:40:00Z"),
                doc("c", "x", 1, "2023-01-02T04:10:00Z"),
            ])
            .unwrap();

        let mut req = SearchRequest::new(Query::MatchAll);
        req.size = 0;
        req.facets.insert(
            "by_half_hour".to_string(),
            FacetRequest {
                field: "reception".into(),
                size: 10,
                date_ranges: vec![
                    DateRangeBucket {
                        name: "first".into(),
                        start: Some(utc("2023-01-02T03:00:00Z")),
                        end: Some(utc("2023-01-02T03:30:00Z")),
                    },
                    DateRangeBucket {
                        name: "second".into(),
                        start: Some(utc("2023-01-02T03:30:00Z")),
                        end: Some(utc("2023-01-02T04:00:00Z")),
                    },
                ],
                numeric_ranges: Vec::new(),
            },
        );

        let result = store.search(&req).unwrap();
        let facet = &result.facets["by_half_hour"];
        assert_eq!(facet.date_ranges[0].count, 1);
        assert_eq!(facet.date_ranges[1].count, 1);
        assert_eq!(facet.other, 1); // doc c is outside every bucket
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("2023-01-02T03-00-00");
        {
            let store =
                PartitionStore::create(1, &path, utc("2023-01-02T04:00:00Z"), 3).unwrap();
            store
                .batch_index(vec![doc("a", "persisted line", 1, "2023-01-02T03:10:00Z")])
                .unwrap();
            store.close().unwrap();
        }

        let store = PartitionStore::open(7, &path).unwrap();
        assert_eq!(store.id, 7);
        assert_eq!(store.doc_count(), 1);
        let result = store
            .search(&SearchRequest::new(Query::Match {
                field: "message".into(),
                value: "persisted".into(),
            }))
            .unwrap();
        assert_eq!(result.total_hits, 1);
    }

    #[test]
    fn test_open_missing_shards_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::create_dir_all(&path).unwrap();
        assert!(matches!(
            PartitionStore::open(1, &path),
            Err(StoreError::Corrupt(_))
        ));
    }
}
