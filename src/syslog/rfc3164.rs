//! RFC 3164 Parser
//!
//! Classic BSD syslog: `<PRI>TIMESTAMP HOSTNAME TAG: CONTENT`. The
//! timestamp has no year, so the current year is assumed. A hostname
//! that looks like the current year is treated as absent, which guards
//! against senders that append the year to the timestamp.

use super::{parse_priority, take_tokens, ParseError, NO_VERSION};
use crate::store::FieldValue;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;

const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

pub(crate) fn parse(input: &str) -> Result<HashMap<String, FieldValue>, ParseError> {
    let (rest, pri) = parse_priority(input)?;
    let (rest, timestamp) = parse_timestamp(rest);

    let mut rest = rest;
    let mut host = None;
    let mut tag = None;
    if timestamp.is_some() {
        rest = rest.trim_end();
        let before_host = rest;
        let (r, h) = parse_hostname(rest);
        match h {
            Some(h) if h == Utc::now().year().to_string() => {
                // Year mistaken for a hostname.
                rest = before_host;
            }
            Some(h) => {
                host = Some(h);
                let (r2, t) = parse_tag(r.trim_end());
                rest = r2;
                tag = t;
            }
            None => rest = r,
        }
    }

    let content = rest.trim();
    let mut fields = HashMap::new();
    fields.insert("priority".to_string(), FieldValue::Integer(pri.priority));
    fields.insert("facility".to_string(), FieldValue::Integer(pri.facility));
    fields.insert("severity".to_string(), FieldValue::Integer(pri.severity));
    fields.insert("version".to_string(), FieldValue::Integer(NO_VERSION));
    fields.insert("message".to_string(), FieldValue::Text(content.to_string()));
    if let Some(h) = host {
        fields.insert("host".to_string(), FieldValue::Text(h));
    }
    if let Some(t) = tag {
        fields.insert("tag".to_string(), FieldValue::Text(t));
    }
    fields.insert(
        "timestamp".to_string(),
        FieldValue::Time(timestamp.unwrap_or_else(Utc::now)),
    );
    Ok(fields)
}

/// `Mmm dd hh:mm:ss [yyyy]`, with the year optional.
fn parse_timestamp(input: &str) -> (&str, Option<DateTime<Utc>>) {
    let Some((tokens, after3)) = take_tokens(input, 3) else {
        return (input, None);
    };
    if !MONTHS.contains(&tokens[0]) {
        return (input, None);
    }

    // A fourth token that is a four-digit number is the year.
    if let Some((more, after4)) = take_tokens(input, 4) {
        let candidate = more[3];
        if candidate.len() == 4 && candidate.chars().all(|c| c.is_ascii_digit()) {
            if let Some(t) = assemble(candidate, more[0], more[1], more[2]) {
                return (after4, Some(t));
            }
        }
    }

    let year = Utc::now().year().to_string();
    match assemble(&year, tokens[0], tokens[1], tokens[2]) {
        Some(t) => (after3, Some(t)),
        None => (input, None),
    }
}

fn assemble(year: &str, month: &str, day: &str, time: &str) -> Option<DateTime<Utc>> {
    let composed = format!("{} {} {} {}", year, month, day, time);
    let n = NaiveDateTime::parse_from_str(&composed, "%Y %b %d %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&n))
}

fn parse_hostname(input: &str) -> (&str, Option<String>) {
    let trimmed = input.trim_start();
    if let Some(rest) = trimmed.strip_prefix('-') {
        return (rest.trim_start(), None);
    }
    match take_tokens(trimmed, 1) {
        Some((tokens, rest)) => (rest.trim_start(), Some(tokens[0].to_string())),
        None => (input, None),
    }
}

/// TAG ends at `[` (pid follows), `:` or space. When no terminator is
/// found the input carries no tag.
fn parse_tag(input: &str) -> (&str, Option<String>) {
    let s = input.trim_start();
    let mut tag: Option<&str> = None;
    let mut consumed = None;

    for (i, c) in s.char_indices() {
        if c == '[' && tag.is_none() {
            tag = Some(&s[..i]);
        }
        if c == ':' || c == ' ' {
            if tag.is_none() {
                tag = Some(&s[..i]);
            }
            consumed = Some(i + c.len_utf8());
            break;
        }
    }

    match tag {
        Some(t) => {
            let rest = &s[consumed.unwrap_or(s.len())..];
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            (rest, Some(t.to_string()))
        }
        None => (input, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_classic_line() {
        let fields =
            parse("<34>Oct 11 22:14:15 mymachine su: 'su root' failed for lonvick on /dev/pts/8")
                .unwrap();

        assert_eq!(fields.get("priority"), Some(&FieldValue::Integer(34)));
        assert_eq!(fields.get("facility"), Some(&FieldValue::Integer(4)));
        assert_eq!(fields.get("severity"), Some(&FieldValue::Integer(2)));
        assert_eq!(fields.get("version"), Some(&FieldValue::Integer(NO_VERSION)));
        assert_eq!(
            fields.get("host"),
            Some(&FieldValue::Text("mymachine".to_string()))
        );
        assert_eq!(fields.get("tag"), Some(&FieldValue::Text("su".to_string())));
        assert_eq!(
            fields.get("message"),
            Some(&FieldValue::Text(
                "'su root' failed for lonvick on /dev/pts/8".to_string()
            ))
        );

        match fields.get("timestamp") {
            Some(FieldValue::Time(t)) => {
                assert_eq!(t.hour(), 22);
                assert_eq!(t.year(), Utc::now().year());
            }
            other => panic!("unexpected timestamp: {:?}", other),
        }
    }

    #[test]
    fn test_explicit_year() {
        let fields = parse("<13>Feb  5 17:32:18 2021 host app: body").unwrap();
        match fields.get("timestamp") {
            Some(FieldValue::Time(t)) => assert_eq!(t.year(), 2021),
            other => panic!("unexpected timestamp: {:?}", other),
        }
    }

    #[test]
    fn test_tag_with_pid() {
        let fields = parse("<34>Oct 11 22:14:15 web1 sshd[4721]: accepted publickey").unwrap();
        assert_eq!(fields.get("tag"), Some(&FieldValue::Text("sshd".to_string())));
    }

    #[test]
    fn test_no_timestamp_leaves_message() {
        let fields = parse("<34>free-form text without date").unwrap();
        assert_eq!(
            fields.get("message"),
            Some(&FieldValue::Text("free-form text without date".to_string()))
        );
        assert!(!fields.contains_key("host"));
    }
}
