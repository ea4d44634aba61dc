//! Boundary shapes for definitions. Everything here is loosely typed and is
//! only ever read by the compile functions in `predicates`, `schema` and
//! `timeframe`; evaluation works on the compiled forms.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A single (field, dataType, operator, values) test as it arrives over the
/// wire. Used for both segment constraints and aggregate event filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintSpec {
    #[serde(default)]
    pub field: String,
    pub data_type: String,
    pub operator: String,
    #[serde(default, alias = "value", deserialize_with = "one_or_many")]
    pub values: Vec<serde_json::Value>,
}

impl ConstraintSpec {
    pub fn new(
        field: impl Into<String>,
        data_type: impl Into<String>,
        operator: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            field: field.into(),
            data_type: data_type.into(),
            operator: operator.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeframeSpec {
    Relative { value: i64, unit: String },
    Absolute {
        from: DateTime<Utc>,
        #[serde(default)]
        to: Option<DateTime<Utc>>,
    },
    AllTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateConfigSpec {
    pub operation: String,
    pub timeframe: TimeframeSpec,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub event_property: Option<String>,
    #[serde(default)]
    pub aggregate_by: Option<String>,
    #[serde(default)]
    pub filters: Vec<ConstraintSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaConfigSpec {
    pub formula: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaFieldSpec {
    pub field: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub data_type: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub suggested_values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSchemaSpec {
    pub event_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub properties: Vec<SchemaFieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedSchemaSpec {
    pub field: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub schema_type: String,
    pub data_type: String,
    #[serde(default)]
    pub aggregate_config: Option<AggregateConfigSpec>,
    #[serde(default)]
    pub formula_config: Option<FormulaConfigSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentAggregationSpec {
    pub metric: String,
    #[serde(default)]
    pub property: Option<String>,
    pub operator: String,
    pub value: f64,
    #[serde(default)]
    pub value_to: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentFilterSpec {
    pub filter_type: String,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub property: Option<String>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
    #[serde(default)]
    pub aggregation: Option<SegmentAggregationSpec>,
    #[serde(default)]
    pub timeframe: Option<TimeframeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDefinitionSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filters: Vec<SegmentFilterSpec>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Null => Ok(Vec::new()),
        single => Ok(vec![single]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constraint_accepts_single_value() {
        let spec: ConstraintSpec = serde_json::from_value(json!({
            "field": "plan",
            "dataType": "string",
            "operator": "is",
            "value": "pro"
        }))
        .unwrap();
        assert_eq!(spec.values, vec![json!("pro")]);
    }

    #[test]
    fn test_constraint_accepts_value_list() {
        let spec: ConstraintSpec = serde_json::from_value(json!({
            "field": "amount",
            "dataType": "number",
            "operator": "between",
            "values": [1, 5]
        }))
        .unwrap();
        assert_eq!(spec.values.len(), 2);
    }

    #[test]
    fn test_timeframe_wire_shapes() {
        let relative: TimeframeSpec =
            serde_json::from_value(json!({"type": "relative", "value": 7, "unit": "days"}))
                .unwrap();
        assert!(matches!(relative, TimeframeSpec::Relative { value: 7, .. }));

        let absolute: TimeframeSpec = serde_json::from_value(
            json!({"type": "absolute", "from": "2024-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert!(matches!(absolute, TimeframeSpec::Absolute { to: None, .. }));

        let all: TimeframeSpec = serde_json::from_value(json!({"type": "all_time"})).unwrap();
        assert!(matches!(all, TimeframeSpec::AllTime));
    }
}
