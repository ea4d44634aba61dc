//! CSV and JSON export of a resolved report table. Both exports read the
//! same resolved values; `Formatted` renders them per column format, `Raw`
//! writes the JSON values untouched.

use audience_core::value::{as_number, as_text};
use audience_core::AudienceResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::report_builder::{ColumnFormat, ReportTable};

const PROFILE_COLUMN: &str = "profileId";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    #[default]
    Formatted,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
}

pub fn export(table: &ReportTable, format: ExportFormat, mode: ExportMode) -> AudienceResult<String> {
    match format {
        ExportFormat::Csv => Ok(export_csv(table, mode)),
        ExportFormat::Json => export_json(table, mode),
    }
}

pub fn export_csv(table: &ReportTable, mode: ExportMode) -> String {
    let mut header = vec![csv_escape(PROFILE_COLUMN)];
    header.extend(table.columns.iter().map(|c| match mode {
        ExportMode::Formatted => csv_escape(&c.label),
        ExportMode::Raw => csv_escape(&c.key),
    }));
    let mut csv = header.join(",");
    csv.push('\n');

    for row in &table.rows {
        let mut cells = vec![csv_escape(&row.profile_id)];
        for (column, value) in table.columns.iter().zip(&row.values) {
            let cell = match mode {
                ExportMode::Formatted => csv_escape(&format_value(value, column.format)),
                ExportMode::Raw => match value {
                    Value::String(s) => format!("\"{}\"", s.replace('"', "\"\"")),
                    Value::Null => String::new(),
                    other => csv_escape(&other.to_string()),
                },
            };
            cells.push(cell);
        }
        csv.push_str(&cells.join(","));
        csv.push('\n');
    }
    csv
}

pub fn export_json(table: &ReportTable, mode: ExportMode) -> AudienceResult<String> {
    let records: Vec<Value> = table
        .rows
        .iter()
        .map(|row| {
            let mut record = Map::new();
            record.insert(PROFILE_COLUMN.into(), Value::String(row.profile_id.clone()));
            for (column, value) in table.columns.iter().zip(&row.values) {
                let rendered = match mode {
                    ExportMode::Formatted => Value::String(format_value(value, column.format)),
                    ExportMode::Raw => value.clone(),
                };
                record.insert(column.key.clone(), rendered);
            }
            Value::Object(record)
        })
        .collect();
    Ok(serde_json::to_string_pretty(&records)?)
}

/// Render one value for display. Null renders empty; values that do not
/// fit the format fall back to plain text.
pub fn format_value(value: &Value, format: ColumnFormat) -> String {
    if value.is_null() {
        return String::new();
    }
    let number = as_number(value);
    match (format, number) {
        (ColumnFormat::Number, Some(n)) => format_number(n),
        (ColumnFormat::Currency, Some(n)) => {
            let sign = if n < 0.0 { "-" } else { "" };
            format!("{sign}${}", group_thousands(&format!("{:.2}", n.abs())))
        }
        (ColumnFormat::Percentage, Some(n)) => format!("{}%", format_number(n * 100.0)),
        (ColumnFormat::Duration, Some(n)) => format_duration(n),
        _ => as_text(value),
    }
}

/// At most two decimals, trailing zeros trimmed, thousands grouped.
fn format_number(n: f64) -> String {
    let fixed = format!("{:.2}", n.abs());
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    let sign = if n < 0.0 && trimmed != "0" { "-" } else { "" };
    format!("{sign}{}", group_thousands(trimmed))
}

fn group_thousands(digits: &str) -> String {
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (digits, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac_part {
        Some(f) => format!("{grouped}.{f}"),
        None => grouped,
    }
}

/// Seconds rendered as `1d 2h 3m 4s`, largest unit first, zero parts omitted.
fn format_duration(seconds: f64) -> String {
    let sign = if seconds < 0.0 { "-" } else { "" };
    let mut remaining = seconds.abs().round() as u64;
    if remaining == 0 {
        return "0s".into();
    }
    let mut parts = Vec::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)] {
        let count = remaining / size;
        if count > 0 {
            parts.push(format!("{count}{unit}"));
            remaining %= size;
        }
    }
    format!("{sign}{}", parts.join(" "))
}

fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report_builder::{ColumnHeader, PageInfo, ReportRow};
    use chrono::Utc;
    use serde_json::json;

    fn table() -> ReportTable {
        let header = |key: &str, label: &str, format: ColumnFormat| ColumnHeader {
            key: key.into(),
            label: label.into(),
            format,
            numeric: format != ColumnFormat::Text,
        };
        ReportTable {
            columns: vec![
                header("name", "Name", ColumnFormat::Text),
                header("ltv", "Lifetime value", ColumnFormat::Currency),
                header("rate", "Open rate", ColumnFormat::Percentage),
                header("tenure", "Tenure", ColumnFormat::Duration),
            ],
            rows: vec![
                ReportRow {
                    profile_id: "u1".into(),
                    values: vec![json!("Smith, Ann"), json!(1234.5), json!(0.25), json!(93_784)],
                    degraded: false,
                },
                ReportRow {
                    profile_id: "u2".into(),
                    values: vec![json!("Bo"), Value::Null, json!(0.5), Value::Null],
                    degraded: false,
                },
            ],
            pagination: PageInfo {
                page: 1,
                page_size: 50,
                total_rows: 2,
                total_pages: 1,
            },
            degraded: false,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_values() {
        assert_eq!(format_value(&json!(1234567.891), ColumnFormat::Number), "1,234,567.89");
        assert_eq!(format_value(&json!(12), ColumnFormat::Number), "12");
        assert_eq!(format_value(&json!(-1234.5), ColumnFormat::Currency), "-$1,234.50");
        assert_eq!(format_value(&json!(0.125), ColumnFormat::Percentage), "12.5%");
        assert_eq!(format_value(&json!(3_725), ColumnFormat::Duration), "1h 2m 5s");
        assert_eq!(format_value(&json!("n/a"), ColumnFormat::Currency), "n/a");
        assert_eq!(format_value(&Value::Null, ColumnFormat::Number), "");
    }

    #[test]
    fn test_formatted_csv() {
        let csv = export_csv(&table(), ExportMode::Formatted);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "profileId,Name,Lifetime value,Open rate,Tenure");
        assert_eq!(lines[1], "u1,\"Smith, Ann\",\"$1,234.50\",25%,1d 2h 3m 4s");
        assert_eq!(lines[2], "u2,Bo,,50%,");
    }

    #[test]
    fn test_raw_csv() {
        let csv = export_csv(&table(), ExportMode::Raw);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "profileId,name,ltv,rate,tenure");
        assert_eq!(lines[1], "u1,\"Smith, Ann\",1234.5,0.25,93784");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_json_exports_share_values() {
        let t = table();
        let raw: Vec<Map<String, Value>> =
            serde_json::from_str(&export_json(&t, ExportMode::Raw).unwrap()).unwrap();
        assert_eq!(raw[0]["ltv"], json!(1234.5));
        assert_eq!(raw[1]["ltv"], Value::Null);
        assert_eq!(raw[0]["profileId"], json!("u1"));

        let formatted: Vec<Map<String, Value>> =
            serde_json::from_str(&export_json(&t, ExportMode::Formatted).unwrap()).unwrap();
        assert_eq!(formatted[0]["ltv"], json!("$1,234.50"));
        assert_eq!(formatted[1]["ltv"], json!(""));
    }
}
