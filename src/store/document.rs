//! Documents and Field Values
//!
//! A document is the indexable unit of a partition store: a time-sortable
//! string id plus a typed field map. Field values deserialize untagged so
//! that plain JSON events map naturally onto them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A typed field value.
///
/// Untagged variant order matters for deserialization: integers before
/// floats, RFC 3339 strings become `Time`, everything else `Text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Time(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    /// Numeric view, if the value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Temporal view. Text values are given a chance to parse as
    /// RFC 3339 so that range filters work on string timestamps.
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Time(t) => Some(*t),
            FieldValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        }
    }

    /// Textual view used by tokenization and term matching.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            FieldValue::Integer(_) | FieldValue::Float(_) => 0,
            FieldValue::Time(_) => 1,
            FieldValue::Text(_) => 2,
            FieldValue::Bool(_) => 3,
        }
    }

    /// Total ordering across values, used by sort orders. Values of
    /// different kinds order by kind rank so sorts stay deterministic.
    pub fn compare(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (a, b) if a.type_rank() != b.type_rank() => a.type_rank().cmp(&b.type_rank()),
            (FieldValue::Time(a), FieldValue::Time(b)) => a.cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (a, b) => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(t: DateTime<Utc>) -> Self {
        FieldValue::Time(t)
    }
}

/// An indexable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: HashMap<String, FieldValue>) -> Self {
        Self { id: id.into(), fields }
    }
}

/// Tokens a field value contributes to term matching and dictionaries.
pub(crate) fn value_tokens(v: &FieldValue) -> Vec<String> {
    match v {
        FieldValue::Text(s) => tokenize(s),
        FieldValue::Integer(i) => vec![i.to_string()],
        FieldValue::Float(f) => vec![f.to_string()],
        FieldValue::Bool(b) => vec![b.to_string()],
        FieldValue::Time(_) => Vec::new(),
    }
}

/// Lowercased alphanumeric token runs of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            for lc in c.to_lowercase() {
                current.push(lc);
            }
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untagged_deserialization() {
        let v: FieldValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, FieldValue::Integer(3));

        let v: FieldValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, FieldValue::Float(3.5));

        let v: FieldValue = serde_json::from_str("\"2023-01-02T03:04:05Z\"").unwrap();
        assert!(matches!(v, FieldValue::Time(_)));

        let v: FieldValue = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(v, FieldValue::Text("hello".to_string()));

        let v: FieldValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, FieldValue::Bool(true));
    }

    #[test]
    fn test_compare_numeric_cross_type() {
        let a = FieldValue::Integer(3);
        let b = FieldValue::Float(3.5);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, World!"), vec!["hello", "world"]);
        assert_eq!(tokenize("app_name=sshd pid:42"), vec!["app_name", "sshd", "pid", "42"]);
        assert!(tokenize("  --  ").is_empty());
    }
}
