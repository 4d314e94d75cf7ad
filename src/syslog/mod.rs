//! Syslog Parsing
//!
//! Parses syslog frames into the reserved field schema. Three formats
//! are supported: RFC 3164 classic, RFC 5424 with version, and a relaxed
//! RFC 5424 variant (`syslog`). A frame that fails to parse is not lost:
//! the raw bytes become `message` with zeroed priority fields and a
//! sentinel version.

mod delimiter;
mod rfc3164;
mod rfc5424;
mod relaxed;

pub use delimiter::LineDelimiter;

use crate::store::FieldValue;
use chrono::Utc;
use nom::{
    bytes::complete::take_while_m_n,
    character::complete::char,
    sequence::delimited,
    IResult,
};
use std::collections::HashMap;
use thiserror::Error;

/// Sentinel version for messages without one.
pub const NO_VERSION: i64 = -1;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0} is not a valid syslog format")]
    UnknownFormat(String),

    #[error("no priority header")]
    Priority,

    #[error("unparseable frame")]
    Unparseable,
}

/// The wire formats a collector can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyslogFormat {
    Rfc3164,
    Rfc5424,
    /// Relaxed RFC 5424, tolerant of sloppy senders.
    Relaxed,
}

impl std::str::FromStr for SyslogFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rfc3164" => Ok(SyslogFormat::Rfc3164),
            "rfc5424" => Ok(SyslogFormat::Rfc5424),
            "syslog" => Ok(SyslogFormat::Relaxed),
            other => Err(ParseError::UnknownFormat(other.to_string())),
        }
    }
}

/// Priority header split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub priority: i64,
    pub facility: i64,
    pub severity: i64,
}

impl Priority {
    /// Facility is the priority divided by 8, severity the remainder.
    pub fn from_value(p: i64) -> Self {
        Self {
            priority: p,
            facility: p / 8,
            severity: p % 8,
        }
    }
}

fn priority_body(input: &str) -> IResult<&str, &str> {
    delimited(
        char('<'),
        take_while_m_n(1, 3, |c: char| c.is_ascii_digit()),
        char('>'),
    )(input)
}

/// Parse the `<NNN>` priority header.
pub(crate) fn parse_priority(input: &str) -> Result<(&str, Priority), ParseError> {
    let (rest, digits) = priority_body(input).map_err(|_| ParseError::Priority)?;
    let value: i64 = digits.parse().map_err(|_| ParseError::Priority)?;
    Ok((rest, Priority::from_value(value)))
}

/// Split `input` into its leading whitespace-delimited tokens and the
/// remainder after them. Returns `None` when fewer than `n` tokens
/// exist.
pub(crate) fn take_tokens(input: &str, n: usize) -> Option<(Vec<&str>, &str)> {
    let mut tokens = Vec::with_capacity(n);
    let mut rest = input;
    for _ in 0..n {
        rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }
    Some((tokens, rest))
}

/// Fields for a frame nothing could parse.
pub(crate) fn fallback_fields(raw: &str) -> HashMap<String, FieldValue> {
    let mut fields = HashMap::new();
    fields.insert("priority".to_string(), FieldValue::Integer(0));
    fields.insert("facility".to_string(), FieldValue::Integer(0));
    fields.insert("severity".to_string(), FieldValue::Integer(0));
    fields.insert("version".to_string(), FieldValue::Integer(NO_VERSION));
    fields.insert("timestamp".to_string(), FieldValue::Time(Utc::now()));
    fields.insert("message".to_string(), FieldValue::Text(raw.to_string()));
    fields
}

/// A configured parser for one wire format.
#[derive(Debug)]
pub struct LogParser {
    format: SyslogFormat,
    relaxed: relaxed::RelaxedParser,
}

impl LogParser {
    pub fn new(format: &str) -> Result<Self, ParseError> {
        Ok(Self {
            format: format.parse()?,
            relaxed: relaxed::RelaxedParser::new(),
        })
    }

    pub fn format(&self) -> SyslogFormat {
        self.format
    }

    /// Parse one frame. The boolean is true when the fallback document
    /// was produced instead of a real parse.
    pub fn parse(&self, raw: &str) -> (HashMap<String, FieldValue>, bool) {
        match self.attempt(raw) {
            Ok(fields) => (fields, false),
            Err(_) => {
                // Some forwarders wrap the whole frame in quotes.
                if let Some(inner) = raw.strip_prefix('"') {
                    let inner = inner.strip_suffix('"').unwrap_or(inner);
                    if let Ok(fields) = self.attempt(inner) {
                        return (fields, false);
                    }
                }
                (fallback_fields(raw), true)
            }
        }
    }

    fn attempt(&self, input: &str) -> Result<HashMap<String, FieldValue>, ParseError> {
        match self.format {
            SyslogFormat::Rfc3164 => rfc3164::parse(input),
            SyslogFormat::Rfc5424 => rfc5424::parse(input),
            SyslogFormat::Relaxed => self.relaxed.parse(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_priority() {
        let (rest, pri) = parse_priority("<134>rest").unwrap();
        assert_eq!(rest, "rest");
        assert_eq!(pri.priority, 134);
        assert_eq!(pri.facility, 16);
        assert_eq!(pri.severity, 6);

        assert!(parse_priority("no priority").is_err());
        assert!(parse_priority("<>empty").is_err());
        assert!(parse_priority("<12345>too long").is_err());
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("rfc5424".parse::<SyslogFormat>().unwrap(), SyslogFormat::Rfc5424);
        assert_eq!("RFC3164".parse::<SyslogFormat>().unwrap(), SyslogFormat::Rfc3164);
        assert_eq!("syslog".parse::<SyslogFormat>().unwrap(), SyslogFormat::Relaxed);
        assert!("gelf".parse::<SyslogFormat>().is_err());
    }

    #[test]
    fn test_fallback_on_garbage() {
        let parser = LogParser::new("rfc5424").unwrap();
        let (fields, fallback) = parser.parse("complete garbage");
        assert!(fallback);
        assert_eq!(fields.get("priority"), Some(&FieldValue::Integer(0)));
        assert_eq!(fields.get("version"), Some(&FieldValue::Integer(NO_VERSION)));
        assert_eq!(
            fields.get("message"),
            Some(&FieldValue::Text("complete garbage".to_string()))
        );
    }

    #[test]
    fn test_quoted_frame_retry() {
        let parser = LogParser::new("rfc5424").unwrap();
        let (fields, fallback) =
            parser.parse("\"<34>1 2023-01-02T03:04:05Z host app 42 ID47 - quoted body\"");
        assert!(!fallback);
        assert_eq!(
            fields.get("message"),
            Some(&FieldValue::Text("quoted body".to_string()))
        );
    }

    #[test]
    fn test_take_tokens() {
        let (tokens, rest) = take_tokens("  a b  c tail here", 3).unwrap();
        assert_eq!(tokens, vec!["a", "b", "c"]);
        assert_eq!(rest.trim_start(), "tail here");
        assert!(take_tokens("one", 2).is_none());
    }
}
