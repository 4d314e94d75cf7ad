//! Time Parsing and Alignment
//!
//! Accepts the fixed set of timestamp layouts used across the HTTP
//! surface and filter definitions, plus relative times of the form
//! `now()[+|- <duration>]`. Also holds the partition directory-name
//! layout and interval alignment used by the engine and the
//! continuous-query scheduler.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;

/// Layout of a partition directory name (UTC start time).
pub const PARTITION_TIME_LAYOUT: &str = "%Y-%m-%dT%H-%M-%S";

/// Naive layouts tried after RFC 3339 fails.
const NAIVE_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Offset layouts with a space before the zone.
const SPACED_OFFSET_LAYOUTS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f %:z", "%Y-%m-%dT%H:%M:%S %:z"];

/// Parse a timestamp in any accepted layout, normalized to UTC.
///
/// Returns `None` when no layout matches. Naive layouts are interpreted
/// as UTC so that partition mapping is deterministic across hosts.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }

    for layout in NAIVE_LAYOUTS {
        if let Ok(n) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(Utc.from_utc_datetime(&n));
        }
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let n = d.and_hms_opt(0, 0, 0)?;
        return Some(Utc.from_utc_datetime(&n));
    }

    for layout in SPACED_OFFSET_LAYOUTS {
        if let Ok(t) = DateTime::parse_from_str(s, layout) {
            return Some(t.with_timezone(&Utc));
        }
    }

    if let Some(rest) = s.strip_prefix("now()") {
        let rest = rest.trim();
        if rest.is_empty() {
            return Some(Utc::now());
        }
        let (neg, rest) = match rest.strip_prefix('-') {
            Some(r) => (true, r.trim()),
            None => (false, rest.strip_prefix('+').unwrap_or(rest).trim()),
        };
        let dur = parse_duration(rest)?;
        let delta = chrono::Duration::from_std(dur).ok()?;
        return Some(if neg { Utc::now() - delta } else { Utc::now() + delta });
    }

    None
}

/// Parse a duration like `300ms`, `1.5h` or `2h45m`.
///
/// Units: `ns`, `us`/`µs`, `ms`, `s`, `m`, `h`. Multiple value+unit
/// pairs accumulate. A bare number without a unit is rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let (unit_bytes, unit_secs) = if rest.starts_with("ns") {
            (2, 1e-9)
        } else if rest.starts_with("us") {
            (2, 1e-6)
        } else if rest.starts_with("µs") {
            ("µs".len(), 1e-6)
        } else if rest.starts_with("ms") {
            (2, 1e-3)
        } else if rest.starts_with('s') {
            (1, 1.0)
        } else if rest.starts_with('m') {
            (1, 60.0)
        } else if rest.starts_with('h') {
            (1, 3600.0)
        } else {
            return None;
        };
        total += value * unit_secs;
        rest = &rest[unit_bytes..];
    }

    if !total.is_finite() || total < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(total))
}

/// Floor `t` to the nearest `interval` boundary (UTC, unix-epoch based).
pub fn align_time(t: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let secs = (interval.as_secs() as i64).max(1);
    let floored = t.timestamp().div_euclid(secs) * secs;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(t)
}

/// Format a partition start time as its directory name.
pub fn format_partition_time(t: DateTime<Utc>) -> String {
    t.format(PARTITION_TIME_LAYOUT).to_string()
}

/// Parse a partition directory name (or `end-time` file line) back
/// into a UTC instant.
pub fn parse_partition_time(s: &str) -> Option<DateTime<Utc>> {
    let n = NaiveDateTime::parse_from_str(s.trim(), PARTITION_TIME_LAYOUT).ok()?;
    Some(Utc.from_utc_datetime(&n))
}
