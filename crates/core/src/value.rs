//! Coercion helpers shared by constraint dispatch, aggregation and formulas.
//! Payload values are loosely typed JSON; these functions are the only place
//! that inspects their raw shape.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Null, missing and empty-string values all count as absent.
pub fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Accepts RFC 3339 strings, `YYYY-MM-DD` dates and integer epoch millis.
pub fn as_instant(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_instant(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Render a value as display text. Null renders empty.
pub fn as_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Stable key for distinct-value counting.
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{s}"),
        Value::Number(_) => format!("n:{}", as_number(value).unwrap_or_default()),
        other => format!("j:{other}"),
    }
}

/// Convert a float back into JSON, preferring an integer representation.
/// Non-finite results degrade to null.
pub fn number_value(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Descend a dotted path (`address.city`) through nested objects.
pub fn lookup_path<'a>(root: &'a HashMap<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent() {
        assert!(is_absent(None));
        assert!(is_absent(Some(&Value::Null)));
        assert!(is_absent(Some(&json!(""))));
        assert!(!is_absent(Some(&json!(0))));
        assert!(!is_absent(Some(&json!(false))));
        assert!(!is_absent(Some(&json!(" "))));
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(as_number(&json!(4.5)), Some(4.5));
        assert_eq!(as_number(&json!(" 12 ")), Some(12.0));
        assert_eq!(as_number(&json!("twelve")), None);
        assert_eq!(as_number(&json!(true)), None);
    }

    #[test]
    fn test_instant_coercion() {
        let a = as_instant(&json!("2024-01-02T03:04:05Z")).unwrap();
        let b = as_instant(&json!("2024-01-02")).unwrap();
        assert!(b < a);
        let c = as_instant(&json!(1_704_164_645_000_i64)).unwrap();
        assert_eq!(c, a);
        assert!(as_instant(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_number_value_prefers_integers() {
        assert_eq!(number_value(35.0), json!(35));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(number_value(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_canonical_key_unifies_numeric_forms() {
        assert_eq!(canonical_key(&json!(3)), canonical_key(&json!(3.0)));
        assert_ne!(canonical_key(&json!("3")), canonical_key(&json!(3)));
    }
}
