//! RFC 5424 Parser
//!
//! Walks the header one element at a time: PRI VERSION SP TIMESTAMP SP
//! HOSTNAME SP APP-NAME SP PROCID SP MSGID SP STRUCTURED-DATA SP MSG.
//! Every element after the timestamp is best-effort; a missing or
//! malformed element leaves the remainder as the message.

use super::{parse_priority, ParseError, NO_VERSION};
use crate::store::FieldValue;
use crate::timeutil;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;

pub(crate) fn parse(input: &str) -> Result<HashMap<String, FieldValue>, ParseError> {
    let (rest, pri) = parse_priority(input)?;
    let (rest, version) = parse_version(rest);
    let (rest, timestamp) = parse_timestamp(rest);

    let mut rest = rest;
    let mut host = None;
    let mut app = None;
    let mut pid = None;
    let mut message_id = None;
    let mut structured_data = None;

    // Only walk the remaining header elements when the timestamp was
    // recognizable; otherwise the whole remainder is the message.
    if timestamp.is_some() {
        let (r, h) = parse_hostname(rest);
        rest = r;
        host = h;

        let (r, a) = parse_up_to(rest, 48);
        rest = r;
        app = a;

        let (r, p) = parse_proc_id(rest);
        rest = r;
        pid = p;

        let (r, m) = parse_up_to(rest, 32);
        rest = r;
        message_id = m;

        let (r, sd) = parse_structured_data(rest);
        rest = r;
        structured_data = sd;
    }

    let message = rest.trim();
    let timestamp = timestamp.unwrap_or_else(Utc::now);

    let mut fields = HashMap::new();
    fields.insert("priority".to_string(), FieldValue::Integer(pri.priority));
    fields.insert("facility".to_string(), FieldValue::Integer(pri.facility));
    fields.insert("severity".to_string(), FieldValue::Integer(pri.severity));
    fields.insert(
        "version".to_string(),
        FieldValue::Integer(version.unwrap_or(NO_VERSION)),
    );
    fields.insert("timestamp".to_string(), FieldValue::Time(timestamp));
    if let Some(h) = host {
        fields.insert("host".to_string(), FieldValue::Text(h));
    }
    if let Some(a) = app {
        fields.insert("app".to_string(), FieldValue::Text(a));
    }
    if let Some(p) = pid {
        fields.insert("pid".to_string(), p);
    }
    if let Some(m) = message_id {
        fields.insert("message_id".to_string(), FieldValue::Text(m));
    }
    fields.insert(
        "structured_data".to_string(),
        FieldValue::Text(structured_data.unwrap_or_else(|| "-".to_string())),
    );
    fields.insert("message".to_string(), FieldValue::Text(message.to_string()));
    Ok(fields)
}

/// A single digit followed by whitespace. On failure the input is left
/// untouched so the timestamp parser gets a chance at it.
fn parse_version(input: &str) -> (&str, Option<i64>) {
    let trimmed = input.trim_start();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => {
            let rest = &trimmed[1..];
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                (rest, Some(c.to_digit(10).unwrap() as i64))
            } else {
                (input, None)
            }
        }
        _ => (input, None),
    }
}

fn parse_timestamp(input: &str) -> (&str, Option<DateTime<Utc>>) {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('-') {
        return (rest, None);
    }
    let end = trimmed
        .find(char::is_whitespace)
        .unwrap_or(trimmed.len());
    let (token, rest) = trimmed.split_at(end);

    if let Ok(t) = DateTime::parse_from_rfc3339(token) {
        return (rest, Some(t.with_timezone(&Utc)));
    }
    // No zone designator: interpret as UTC.
    if let Ok(n) = NaiveDateTime::parse_from_str(token, "%Y-%m-%dT%H:%M:%S%.f") {
        return (rest, Some(Utc.from_utc_datetime(&n)));
    }
    (input, None)
}

/// NILVALUE or one token; `-` means absent.
fn parse_hostname(input: &str) -> (&str, Option<String>) {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('-') {
        return (rest, None);
    }
    match super::take_tokens(trimmed, 1) {
        Some((tokens, rest)) => (rest, Some(tokens[0].to_string())),
        None => (input, None),
    }
}

/// One token of at most `max_len` characters.
fn parse_up_to(input: &str, max_len: usize) -> (&str, Option<String>) {
    match super::take_tokens(input, 1) {
        Some((tokens, rest)) if tokens[0].chars().count() <= max_len => {
            let token = tokens[0];
            if token == "-" {
                (rest, None)
            } else {
                (rest, Some(token.to_string()))
            }
        }
        _ => (input, None),
    }
}

/// PROCID: numeric values become integers, `-` becomes -1, anything
/// else stays text.
fn parse_proc_id(input: &str) -> (&str, Option<FieldValue>) {
    match super::take_tokens(input, 1) {
        Some((tokens, rest)) if tokens[0].chars().count() <= 128 => {
            let token = tokens[0];
            if token == "-" {
                (rest, Some(FieldValue::Integer(-1)))
            } else if let Ok(n) = token.parse::<i64>() {
                (rest, Some(FieldValue::Integer(n)))
            } else {
                (rest, Some(FieldValue::Text(token.to_string())))
            }
        }
        _ => (input, None),
    }
}

/// STRUCTURED-DATA: `-`, or one or more `[...]` groups taken verbatim.
fn parse_structured_data(input: &str) -> (&str, Option<String>) {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('-') {
        return (rest, Some("-".to_string()));
    }
    if !trimmed.starts_with('[') {
        return (input, None);
    }
    let mut end = None;
    for (i, c) in trimmed.char_indices() {
        if c == ']' {
            let after = &trimmed[i + 1..];
            if after.is_empty() || after.starts_with(' ') {
                end = Some(i + 1);
                break;
            }
        }
    }
    match end {
        Some(e) => (&trimmed[e..], Some(trimmed[..e].to_string())),
        None => (input, None),
    }
}
