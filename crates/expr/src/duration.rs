//! Duration strings and delay values.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

/// Result of interpreting an evaluated delay expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayValue {
    /// Relative delay.
    After(Duration),
    /// Absolute point in time; a time in the past means "now".
    At(DateTime<Utc>),
}

impl DelayValue {
    /// Delay relative to `now`, clamped at zero.
    pub fn resolve(&self, now: DateTime<Utc>) -> Duration {
        match self {
            DelayValue::After(d) => *d,
            DelayValue::At(t) => (*t - now).to_std().unwrap_or(Duration::ZERO),
        }
    }
}

/// Interpret a value as a delay: integers are milliseconds, RFC 3339 strings are
/// absolute times, anything else must be a duration string such as `1m30s`.
pub fn delay_from_value(v: &Json) -> Option<DelayValue> {
    match v {
        Json::Number(n) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            (ms >= 0).then(|| DelayValue::After(Duration::from_millis(ms as u64)))
        }
        Json::String(s) => {
            let s = s.trim();
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return Some(DelayValue::At(t.with_timezone(&Utc)));
            }
            parse_duration(s).map(DelayValue::After)
        }
        _ => None,
    }
}

/// Parse `300ms`, `1.5s`, `2m`, `1h30m`. Units: ns, us, ms, s, m, h.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total_ns: f64 = 0.0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if start == i {
            return None;
        }
        let n: f64 = s[start..i].parse().ok()?;
        let ustart = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let scale = match &s[ustart..i] {
            "ns" => 1.0,
            "us" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_ns += n * scale;
    }
    Some(Duration::from_nanos(total_ns.round() as u64))
}

/// Compact rendering for logs (`1m30s`, `250ms`).
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms < 1000 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let rem_ms = ms % 1000;
    let mut out = String::new();
    if h > 0 { out.push_str(&format!("{h}h")); }
    if m > 0 { out.push_str(&format!("{m}m")); }
    if s > 0 || rem_ms > 0 {
        if rem_ms > 0 { out.push_str(&format!("{s}.{rem_ms:03}s")); } else { out.push_str(&format!("{s}s")); }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn delay_values() {
        let now = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(delay_from_value(&json!(250)).unwrap().resolve(now), Duration::from_millis(250));
        assert_eq!(delay_from_value(&json!("2s")).unwrap().resolve(now), Duration::from_secs(2));
        let at = delay_from_value(&json!("2024-01-01T00:00:10Z")).unwrap();
        assert_eq!(at.resolve(now), Duration::from_secs(10));
        let past = delay_from_value(&json!("2023-12-31T23:59:00Z")).unwrap();
        assert_eq!(past.resolve(now), Duration::ZERO);
        assert!(delay_from_value(&json!(-5)).is_none());
        assert!(delay_from_value(&Json::Null).is_none());
        assert!(delay_from_value(&json!("soon")).is_none());
    }

    #[test]
    fn formats_compactly() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.500s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
