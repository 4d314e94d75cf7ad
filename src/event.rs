//! Events
//!
//! A log event as received from a collector or the HTTP ingest surface:
//! the raw line, the parsed field map, a reception timestamp, a
//! process-monotonic sequence number, and the sender address.
//!
//! The reference time is the parsed `timestamp` field when present and
//! parseable, otherwise the reception time. The document id concatenates
//! the reference time (nanoseconds, 16 hex digits) with the sequence
//! number (16 hex digits), which sorts lexicographically in time order
//! within a partition.

use crate::store::{Document, FieldValue};
use crate::timeutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

/// Next process-wide sequence number, seeded from the clock so ids keep
/// ascending across restarts.
pub fn next_sequence() -> i64 {
    static SEQ: OnceLock<AtomicI64> = OnceLock::new();
    SEQ.get_or_init(|| AtomicI64::new(Utc::now().timestamp_nanos_opt().unwrap_or(0)))
        .fetch_add(1, Ordering::Relaxed)
        + 1
}

/// A log event. Unknown JSON keys land in the parsed field map, so a
/// plain `{"message": "hi"}` body is a valid event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Raw delimited log line.
    #[serde(default)]
    pub raw: String,
    /// Time the line was received.
    #[serde(default = "Utc::now")]
    pub reception: DateTime<Utc>,
    /// Order of reception.
    #[serde(default)]
    pub sequence: i64,
    /// Sender address.
    #[serde(default)]
    pub source_addr: String,
    /// Parsed fields, reserved keys included.
    #[serde(flatten)]
    pub fields: HashMap<String, FieldValue>,
}

impl Event {
    /// Build an event from a parsed line.
    pub fn new(raw: String, fields: HashMap<String, FieldValue>) -> Self {
        Self {
            raw,
            fields,
            reception: Utc::now(),
            sequence: 0,
            source_addr: String::new(),
        }
    }

    /// Stamp reception metadata onto the event: sequence, sender
    /// address, and the reserved `reception`, `address` and (when the
    /// parser produced none) `timestamp` fields.
    pub fn stamp(&mut self, addr: &str) {
        self.reception = Utc::now();
        self.sequence = next_sequence();
        self.source_addr = addr.to_string();
        self.fields
            .entry("timestamp".to_string())
            .or_insert(FieldValue::Time(self.reception));
        self.fields
            .insert("address".to_string(), FieldValue::Text(addr.to_string()));
        self.fields
            .insert("reception".to_string(), FieldValue::Time(self.reception));
    }

    /// Fill defaults for events that arrived as JSON rather than from a
    /// collector: sequence, `reception` and `timestamp` fields.
    pub fn normalize(&mut self) {
        if self.sequence == 0 {
            self.sequence = next_sequence();
        }
        self.fields
            .entry("reception".to_string())
            .or_insert(FieldValue::Time(self.reception));
        self.fields
            .entry("timestamp".to_string())
            .or_insert(FieldValue::Time(self.reception));
        if !self.source_addr.is_empty() {
            self.fields
                .entry("address".to_string())
                .or_insert_with(|| FieldValue::Text(self.source_addr.clone()));
        }
    }

    /// The time this event is indexed under.
    pub fn reference_time(&self) -> DateTime<Utc> {
        match self.fields.get("timestamp") {
            Some(FieldValue::Time(t)) => *t,
            Some(FieldValue::Text(s)) => timeutil::parse_time(s).unwrap_or(self.reception),
            _ => self.reception,
        }
    }

    /// Unique, time-sortable document id. Requires a stamped sequence.
    pub fn id(&self) -> String {
        let nanos = self.reference_time().timestamp_nanos_opt().unwrap_or(0);
        format!("{:016x}{:016x}", nanos as u64, self.sequence as u64)
    }

    /// Convert into the indexable document.
    pub fn document(&self) -> Document {
        Document::new(self.id(), self.fields.clone())
    }
}
