//! Saved-Query Metadata
//!
//! Named query definitions: a list of filters, an optional sort, and
//! per-query continuous queries. Definitions are compiled into the
//! store's query DSL on use and persisted as one JSON document with
//! rotating backups. Names are unique across queries.

use crate::store::{parse_query_string, Query, QueryError};
use crate::timeutil;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const OP_MATCH: &str = "Match";
pub const OP_PHRASE: &str = "Phrase";
pub const OP_PREFIX: &str = "Prefix";
pub const OP_REGEXP: &str = "Regexp";
pub const OP_TERM: &str = "Term";
pub const OP_WILDCARD: &str = "Wildcard";
pub const OP_DATE_RANGE: &str = "DateRange";
pub const OP_NUMERIC_RANGE: &str = "NumericRange";
pub const OP_QUERY_STRING: &str = "QueryString";

/// Every filter operation a definition may use.
pub const OP_LIST: [&str; 9] = [
    OP_MATCH,
    OP_PHRASE,
    OP_PREFIX,
    OP_REGEXP,
    OP_TERM,
    OP_WILDCARD,
    OP_DATE_RANGE,
    OP_NUMERIC_RANGE,
    OP_QUERY_STRING,
];

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("record is not found")]
    NotFound,

    #[error("query name already exists")]
    NameExists,

    #[error("{0}")]
    BadArguments(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("metadata is corrupt: {0}")]
    Corrupt(String),
}

/// One filter expression of a saved query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    pub op: String,
    pub values: Vec<String>,
}

impl Filter {
    fn value(&self, idx: usize) -> &str {
        self.values.get(idx).map(String::as_str).unwrap_or("")
    }

    /// Compile into the store's query DSL.
    pub fn to_query(&self) -> Result<Query, MetaError> {
        match self.op.as_str() {
            OP_MATCH => {
                if self.value(0).is_empty() {
                    return Err(MetaError::BadArguments("match value is empty".into()));
                }
                Ok(Query::Match {
                    field: self.field.clone(),
                    value: self.value(0).to_string(),
                })
            }
            OP_PHRASE => Ok(Query::Phrase {
                field: self.field.clone(),
                terms: self.values.clone(),
            }),
            OP_PREFIX => {
                if self.value(0).is_empty() {
                    return Err(MetaError::BadArguments("prefix is empty".into()));
                }
                Ok(Query::Prefix {
                    field: self.field.clone(),
                    prefix: self.value(0).to_string(),
                })
            }
            OP_REGEXP => {
                if self.value(0).is_empty() {
                    return Err(MetaError::BadArguments("regexp is empty".into()));
                }
                Ok(Query::Regexp {
                    field: self.field.clone(),
                    regexp: self.value(0).to_string(),
                })
            }
            OP_WILDCARD => {
                if self.value(0).is_empty() {
                    return Err(MetaError::BadArguments("wildcard is empty".into()));
                }
                Ok(Query::Wildcard {
                    field: self.field.clone(),
                    wildcard: self.value(0).to_string(),
                })
            }
            OP_TERM => {
                if self.values.is_empty() {
                    return Err(MetaError::BadArguments(format!(
                        "'{}' has no values",
                        self.field
                    )));
                }
                let mut queries = Vec::with_capacity(self.values.len());
                for v in &self.values {
                    if v.is_empty() {
                        return Err(MetaError::BadArguments(format!(
                            "'{}' has an empty value",
                            self.field
                        )));
                    }
                    queries.push(Query::Term {
                        field: self.field.clone(),
                        term: v.clone(),
                    });
                }
                Ok(Query::Disjunction { queries })
            }
            OP_DATE_RANGE => {
                let start = match self.value(0) {
                    "" => None,
                    s => Some(timeutil::parse_time(s).ok_or_else(|| {
                        MetaError::BadArguments(format!("'{}' is an invalid datetime", s))
                    })?),
                };
                let end = match self.value(1) {
                    "" => None,
                    s => Some(timeutil::parse_time(s).ok_or_else(|| {
                        MetaError::BadArguments(format!("'{}' is an invalid datetime", s))
                    })?),
                };
                if start.is_none() && end.is_none() {
                    return Err(MetaError::BadArguments("date range is empty".into()));
                }
                Ok(Query::DateRange {
                    field: self.field.clone(),
                    start,
                    end,
                })
            }
            OP_NUMERIC_RANGE => {
                let parse = |s: &str| -> Option<f64> {
                    let v: f64 = s.parse().ok()?;
                    v.is_finite().then_some(v)
                };
                let min = parse(self.value(0));
                let max = parse(self.value(1));
                if min.is_none() && max.is_none() {
                    return Err(MetaError::BadArguments(format!(
                        "numeric range {:?} is invalid",
                        self.values
                    )));
                }
                Ok(Query::NumericRange {
                    field: self.field.clone(),
                    min,
                    max,
                })
            }
            // QueryString, and the fallthrough for unknown ops.
            _ => {
                if self.value(0).is_empty() {
                    return Err(MetaError::BadArguments("query is empty".into()));
                }
                Ok(parse_query_string(self.value(0))?)
            }
        }
    }
}

/// A target of a continuous query: a type resolved through the target
/// registry plus its arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// A saved continuous query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousQuery {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, rename = "groupBy")]
    pub group_by: String,
    #[serde(default)]
    pub targets: Vec<Target>,
}

/// A saved query definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sort: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub continuous_queries: HashMap<String, ContinuousQuery>,
}

impl QueryDef {
    /// Compile usable filters, skipping incomplete ones.
    pub fn to_queries(&self) -> Result<Vec<Query>, MetaError> {
        let mut queries = Vec::with_capacity(self.filters.len());
        for f in &self.filters {
            if f.field.is_empty() || f.op.is_empty() || f.values.is_empty() {
                continue;
            }
            if f.values[0].is_empty() {
                continue;
            }
            queries.push(f.to_query()?);
        }
        Ok(queries)
    }

    /// The conjunction of this definition's filters, if any compile.
    pub fn to_conjunction(&self) -> Result<Option<Query>, MetaError> {
        let queries = self.to_queries()?;
        Ok(match queries.len() {
            0 => None,
            1 => Some(queries.into_iter().next().expect("one query")),
            _ => Some(Query::Conjunction { queries }),
        })
    }
}

const META_FILE: &str = "meta.json";
const BACKUP_COUNT: usize = 5;

/// Persistent store for query definitions.
pub struct MetaStore {
    data_path: PathBuf,
    backup_count: usize,
    queries: RwLock<HashMap<String, QueryDef>>,
    generation: AtomicU64,
}

impl MetaStore {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            backup_count: BACKUP_COUNT,
            queries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Load `meta.json` if present.
    pub fn load(&self) -> Result<(), MetaError> {
        let filename = self.data_path.join(META_FILE);
        let content = match std::fs::read_to_string(&filename) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let queries: HashMap<String, QueryDef> =
            serde_json::from_str(&content).map_err(|e| MetaError::Corrupt(e.to_string()))?;
        *self.queries.write() = queries;
        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Monotonic counter bumped on every mutation; used by the
    /// continuous-query scheduler to invalidate cached callbacks.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    fn save(&self, queries: &HashMap<String, QueryDef>) -> Result<(), MetaError> {
        std::fs::create_dir_all(&self.data_path)?;
        let filename = self.data_path.join(META_FILE);
        let tmp = self.data_path.join(format!("{}.tmp", META_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(queries).map_err(|e| {
            MetaError::Corrupt(e.to_string())
        })?)?;

        // Rotate backups, newest is .1.
        let backup = |i: usize| self.data_path.join(format!("{}.{}", META_FILE, i));
        let _ = std::fs::remove_file(backup(self.backup_count));
        for i in (1..self.backup_count).rev() {
            let _ = std::fs::rename(backup(i), backup(i + 1));
        }
        let _ = std::fs::rename(&filename, backup(1));
        std::fs::rename(&tmp, &filename)?;

        self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// All definitions with ids filled in.
    pub fn list(&self) -> Vec<QueryDef> {
        let queries = self.queries.read();
        let mut out: Vec<QueryDef> = queries
            .iter()
            .map(|(id, q)| {
                let mut q = q.clone();
                q.id = id.clone();
                q
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Name/description listing: filters and continuous queries are
    /// stripped.
    pub fn list_ids(&self) -> Vec<QueryDef> {
        self.list()
            .into_iter()
            .map(|mut q| {
                q.filters = Vec::new();
                q.continuous_queries = HashMap::new();
                q
            })
            .collect()
    }

    pub fn read(&self, id: &str) -> Result<QueryDef, MetaError> {
        let queries = self.queries.read();
        let mut q = queries.get(id).cloned().ok_or(MetaError::NotFound)?;
        q.id = id.to_string();
        Ok(q)
    }

    pub fn create(&self, q: QueryDef) -> Result<String, MetaError> {
        let mut queries = self.queries.write();
        if queries.values().any(|existing| existing.name == q.name) {
            return Err(MetaError::NameExists);
        }
        let id = uuid::Uuid::new_v4().to_string();
        queries.insert(id.clone(), q);
        self.save(&queries)?;
        Ok(id)
    }

    pub fn update(&self, id: &str, q: QueryDef) -> Result<(), MetaError> {
        let mut queries = self.queries.write();
        if !queries.contains_key(id) {
            return Err(MetaError::NotFound);
        }
        if queries
            .iter()
            .any(|(key, existing)| existing.name == q.name && key != id)
        {
            return Err(MetaError::NameExists);
        }
        queries.insert(id.to_string(), q);
        self.save(&queries)
    }

    pub fn delete(&self, id: &str) -> Result<(), MetaError> {
        let mut queries = self.queries.write();
        if queries.remove(id).is_none() {
            return Ok(());
        }
        self.save(&queries)
    }

    /// Definitions that carry at least one continuous query.
    pub fn queries_with_cq(&self) -> Vec<QueryDef> {
        self.list()
            .into_iter()
            .filter(|q| !q.continuous_queries.is_empty())
            .collect()
    }

    pub fn list_cq(&self, query_id: &str) -> Result<Vec<(String, ContinuousQuery)>, MetaError> {
        let q = self.read(query_id)?;
        let mut out: Vec<(String, ContinuousQuery)> =
            q.continuous_queries.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn read_cq(&self, query_id: &str, cq_id: &str) -> Result<ContinuousQuery, MetaError> {
        let q = self.read(query_id)?;
        q.continuous_queries
            .get(cq_id)
            .cloned()
            .ok_or(MetaError::NotFound)
    }

    pub fn create_cq(&self, query_id: &str, cq: ContinuousQuery) -> Result<String, MetaError> {
        let mut queries = self.queries.write();
        let q = queries.get_mut(query_id).ok_or(MetaError::NotFound)?;
        let id = uuid::Uuid::new_v4().to_string();
        q.continuous_queries.insert(id.clone(), cq);
        self.save(&queries)?;
        Ok(id)
    }

    pub fn update_cq(
        &self,
        query_id: &str,
        cq_id: &str,
        cq: ContinuousQuery,
    ) -> Result<(), MetaError> {
        let mut queries = self.queries.write();
        let q = queries.get_mut(query_id).ok_or(MetaError::NotFound)?;
        if !q.continuous_queries.contains_key(cq_id) {
            return Err(MetaError::NotFound);
        }
        q.continuous_queries.insert(cq_id.to_string(), cq);
        self.save(&queries)
    }

    pub fn delete_cq(&self, query_id: &str, cq_id: &str) -> Result<(), MetaError> {
        let mut queries = self.queries.write();
        let q = queries.get_mut(query_id).ok_or(MetaError::NotFound)?;
        if q.continuous_queries.remove(cq_id).is_none() {
            return Ok(());
        }
        self.save(&queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_query(name: &str) -> QueryDef {
        QueryDef {
            id: String::new(),
            name: name.to_string(),
            description: "sample".to_string(),
            filters: vec![Filter {
                field: "severity".to_string(),
                op: OP_NUMERIC_RANGE.to_string(),
                values: vec!["0".to_string(), "4".to_string()],
            }],
            sort: String::new(),
            continuous_queries: HashMap::new(),
        }
    }

    #[test]
    fn test_filter_compilation() {
        let f = Filter {
            field: "host".to_string(),
            op: OP_TERM.to_string(),
            values: vec!["web1".to_string(), "web2".to_string()],
        };
        match f.to_query().unwrap() {
            Query::Disjunction { queries } => assert_eq!(queries.len(), 2),
            other => panic!("unexpected: {:?}", other),
        }

        let f = Filter {
            field: "reception".to_string(),
            op: OP_DATE_RANGE.to_string(),
            values: vec!["2023-01-02T03:00:00Z".to_string(), String::new()],
        };
        match f.to_query().unwrap() {
            Query::DateRange { start, end, .. } => {
                assert!(start.is_some());
                assert!(end.is_none());
            }
            other => panic!("unexpected: {:?}", other),
        }

        let f = Filter {
            field: "reception".to_string(),
            op: OP_DATE_RANGE.to_string(),
            values: vec!["bogus".to_string()],
        };
        assert!(f.to_query().is_err());
    }

    #[test]
    fn test_numeric_range_open_bounds() {
        let f = Filter {
            field: "severity".to_string(),
            op: OP_NUMERIC_RANGE.to_string(),
            values: vec!["".to_string(), "4".to_string()],
        };
        match f.to_query().unwrap() {
            Query::NumericRange { min, max, .. } => {
                assert!(min.is_none());
                assert_eq!(max, Some(4.0));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_to_queries_skips_incomplete_filters() {
        let q = QueryDef {
            filters: vec![
                Filter {
                    field: String::new(),
                    op: OP_MATCH.to_string(),
                    values: vec!["x".to_string()],
                },
                Filter {
                    field: "message".to_string(),
                    op: OP_MATCH.to_string(),
                    values: vec!["kept".to_string()],
                },
            ],
            ..sample_query("skip")
        };
        let queries = q.to_queries().unwrap();
        assert_eq!(queries.len(), 1);
    }

    #[test]
    fn test_crud_and_name_uniqueness() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());

        let id = store.create(sample_query("errors")).unwrap();
        assert!(matches!(
            store.create(sample_query("errors")),
            Err(MetaError::NameExists)
        ));

        let read = store.read(&id).unwrap();
        assert_eq!(read.name, "errors");
        assert_eq!(read.id, id);

        let mut updated = sample_query("errors-renamed");
        updated.description = "renamed".to_string();
        store.update(&id, updated).unwrap();
        assert_eq!(store.read(&id).unwrap().name, "errors-renamed");

        assert!(matches!(
            store.update("missing", sample_query("x")),
            Err(MetaError::NotFound)
        ));

        store.delete(&id).unwrap();
        assert!(matches!(store.read(&id), Err(MetaError::NotFound)));
    }

    #[test]
    fn test_persistence_and_backups() {
        let dir = tempdir().unwrap();
        let id;
        {
            let store = MetaStore::new(dir.path());
            id = store.create(sample_query("persisted")).unwrap();
            store.create(sample_query("second")).unwrap();
        }

        let store = MetaStore::new(dir.path());
        store.load().unwrap();
        assert_eq!(store.read(&id).unwrap().name, "persisted");

        // Second save rotated the first file into a backup.
        assert!(dir.path().join("meta.json.1").exists());
    }

    #[test]
    fn test_cq_crud() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        let qid = store.create(sample_query("with-cq")).unwrap();

        let cq = ContinuousQuery {
            fields: vec!["message".to_string()],
            group_by: String::new(),
            targets: vec![Target {
                kind: "log".to_string(),
                arguments: Vec::new(),
            }],
        };
        let cq_id = store.create_cq(&qid, cq).unwrap();

        assert_eq!(store.list_cq(&qid).unwrap().len(), 1);
        assert_eq!(store.queries_with_cq().len(), 1);

        let mut updated = store.read_cq(&qid, &cq_id).unwrap();
        updated.group_by = "host".to_string();
        store.update_cq(&qid, &cq_id, updated).unwrap();
        assert_eq!(store.read_cq(&qid, &cq_id).unwrap().group_by, "host");

        store.delete_cq(&qid, &cq_id).unwrap();
        assert!(store.list_cq(&qid).unwrap().is_empty());
    }

    #[test]
    fn test_generation_bumps_on_mutation() {
        let dir = tempdir().unwrap();
        let store = MetaStore::new(dir.path());
        let before = store.generation();
        store.create(sample_query("gen")).unwrap();
        assert!(store.generation() > before);
    }
}
