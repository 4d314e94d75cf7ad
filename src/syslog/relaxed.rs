//! Relaxed RFC 5424 Parser
//!
//! A single-regex variant for senders that produce RFC 5424-shaped
//! messages with nonconforming details. The timestamp is kept verbatim
//! when it cannot be parsed.

use super::{ParseError, Priority};
use crate::store::FieldValue;
use crate::timeutil;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug)]
pub(crate) struct RelaxedParser {
    matcher: Regex,
}

impl RelaxedParser {
    pub(crate) fn new() -> Self {
        let pattern = concat!(
            r"(?s)^<([0-9]{1,3})>([0-9])\s",
            r"(\S+)\s",        // timestamp
            r"(\S+)\s",        // host
            r"(\S+)\s",        // app
            r"(-|[0-9]{1,5})\s", // pid
            r"([\w-]+)\s",     // message id
            r"(.+)$",          // message
        );
        Self {
            matcher: Regex::new(pattern).expect("relaxed syslog pattern"),
        }
    }

    pub(crate) fn parse(&self, input: &str) -> Result<HashMap<String, FieldValue>, ParseError> {
        let caps = self.matcher.captures(input).ok_or(ParseError::Unparseable)?;

        let pri = Priority::from_value(caps[1].parse().map_err(|_| ParseError::Priority)?);
        let version: i64 = caps[2].parse().map_err(|_| ParseError::Unparseable)?;
        let pid: i64 = if &caps[6] == "-" {
            -1
        } else {
            caps[6].parse().map_err(|_| ParseError::Unparseable)?
        };

        let mut fields = HashMap::new();
        fields.insert("priority".to_string(), FieldValue::Integer(pri.priority));
        fields.insert("facility".to_string(), FieldValue::Integer(pri.facility));
        fields.insert("severity".to_string(), FieldValue::Integer(pri.severity));
        fields.insert("version".to_string(), FieldValue::Integer(version));
        match timeutil::parse_time(&caps[3]) {
            Some(t) => fields.insert("timestamp".to_string(), FieldValue::Time(t)),
            None => fields.insert(
                "timestamp".to_string(),
                FieldValue::Text(caps[3].to_string()),
            ),
        };
        fields.insert("host".to_string(), FieldValue::Text(caps[4].to_string()));
        fields.insert("app".to_string(), FieldValue::Text(caps[5].to_string()));
        fields.insert("pid".to_string(), FieldValue::Integer(pid));
        fields.insert(
            "message_id".to_string(),
            FieldValue::Text(caps[7].to_string()),
        );
        fields.insert(
            "message".to_string(),
            FieldValue::Text(caps[8].trim().to_string()),
        );
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relaxed_parse() {
        let parser = RelaxedParser::new();
        let fields = parser
            .parse("<134>4 2023-01-02T03:04:05Z host.example app 1234 ID99 some message body")
            .unwrap();

        assert_eq!(fields.get("priority"), Some(&FieldValue::Integer(134)));
        assert_eq!(fields.get("version"), Some(&FieldValue::Integer(4)));
        assert_eq!(
            fields.get("host"),
            Some(&FieldValue::Text("host.example".to_string()))
        );
        assert_eq!(fields.get("pid"), Some(&FieldValue::Integer(1234)));
        assert_eq!(
            fields.get("message"),
            Some(&FieldValue::Text("some message body".to_string()))
        );
        assert!(matches!(fields.get("timestamp"), Some(FieldValue::Time(_))));
    }

    #[test]
    fn test_unparseable_timestamp_kept_as_text() {
        let parser = RelaxedParser::new();
        let fields = parser
            .parse("<134>4 late-morning host app - ID1 body")
            .unwrap();
        assert_eq!(
            fields.get("timestamp"),
            Some(&FieldValue::Text("late-morning".to_string()))
        );
        assert_eq!(fields.get("pid"), Some(&FieldValue::Integer(-1)));
    }

    #[test]
    fn test_non_matching_line() {
        let parser = RelaxedParser::new();
        assert!(parser.parse("nothing like syslog").is_err());
    }
}
