//! Compiled schema definitions: event schemas, profile properties,
//! computed fields and segments.

use audience_core::{AudienceError, AudienceResult, DataType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

use crate::formula::{self, Expr};
use crate::predicates::Constraint;
use crate::timeframe::Timeframe;
use crate::wire::{
    AggregateConfigSpec, ComputedSchemaSpec, EventSchemaSpec, SchemaFieldSpec,
    SegmentAggregationSpec, SegmentDefinitionSpec, SegmentFilterSpec,
};

// ─── Field declarations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub field: String,
    pub display_name: String,
    pub data_type: DataType,
    pub icon: Option<String>,
    pub category: Option<String>,
    pub suggested_values: Vec<serde_json::Value>,
}

impl SchemaField {
    pub fn compile(spec: &SchemaFieldSpec) -> AudienceResult<Self> {
        let field = require_key("field", &spec.field)?;
        Ok(Self {
            display_name: spec.display_name.clone().unwrap_or_else(|| field.clone()),
            field,
            data_type: spec.data_type.parse()?,
            icon: spec.icon.clone(),
            category: spec.category.clone(),
            suggested_values: spec.suggested_values.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    pub event_name: String,
    pub display_name: String,
    pub properties: Vec<SchemaField>,
}

impl EventSchema {
    pub fn compile(spec: &EventSchemaSpec) -> AudienceResult<Self> {
        let event_name = require_key("eventName", &spec.event_name)?;
        let mut seen = HashSet::new();
        let mut properties = Vec::with_capacity(spec.properties.len());
        for prop in &spec.properties {
            let field = SchemaField::compile(prop)?;
            if !seen.insert(field.field.clone()) {
                return Err(AudienceError::Conflict(format!(
                    "property '{}' declared twice on event '{event_name}'",
                    field.field
                )));
            }
            properties.push(field);
        }
        Ok(Self {
            display_name: spec
                .display_name
                .clone()
                .unwrap_or_else(|| event_name.clone()),
            event_name,
            properties,
        })
    }

    pub fn property(&self, field: &str) -> Option<&SchemaField> {
        self.properties.iter().find(|p| p.field == field)
    }
}

// ─── Computed fields ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOperation {
    Count,
    Sum,
    CountUnique,
    Mean,
    Min,
    Max,
    FirstTouch,
    LastTouch,
    Top,
}

impl AggregateOperation {
    pub fn requires_property(&self) -> bool {
        !matches!(self, AggregateOperation::Count)
    }

    /// Operations whose result is always numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            AggregateOperation::Count
                | AggregateOperation::Sum
                | AggregateOperation::CountUnique
                | AggregateOperation::Mean
                | AggregateOperation::Min
                | AggregateOperation::Max
        )
    }
}

impl FromStr for AggregateOperation {
    type Err = AudienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s.trim() {
            "count" => AggregateOperation::Count,
            "sum" => AggregateOperation::Sum,
            "count_unique" => AggregateOperation::CountUnique,
            "mean" | "avg" | "average" => AggregateOperation::Mean,
            "min" => AggregateOperation::Min,
            "max" => AggregateOperation::Max,
            "first_touch" => AggregateOperation::FirstTouch,
            "last_touch" => AggregateOperation::LastTouch,
            "top" => AggregateOperation::Top,
            other => {
                return Err(AudienceError::config(format!(
                    "unknown aggregation operation '{other}'"
                )))
            }
        };
        Ok(op)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateBy {
    Unique,
    #[default]
    Total,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    pub operation: AggregateOperation,
    pub timeframe: Timeframe,
    pub event_name: Option<String>,
    pub event_property: Option<String>,
    pub aggregate_by: AggregateBy,
    pub filters: Vec<Constraint>,
}

impl AggregateConfig {
    pub fn compile(spec: &AggregateConfigSpec) -> AudienceResult<Self> {
        let operation: AggregateOperation = spec.operation.parse()?;
        let event_property = spec
            .event_property
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if operation.requires_property() && event_property.is_none() {
            return Err(AudienceError::config(format!(
                "aggregation '{}' requires an eventProperty",
                spec.operation
            )));
        }
        let aggregate_by = match spec.aggregate_by.as_deref().map(str::trim) {
            None | Some("") | Some("total") => AggregateBy::Total,
            Some("unique") => AggregateBy::Unique,
            Some(other) => {
                return Err(AudienceError::config(format!(
                    "unknown aggregateBy '{other}'"
                )))
            }
        };
        let filters = spec
            .filters
            .iter()
            .map(Constraint::compile)
            .collect::<AudienceResult<Vec<_>>>()?;

        Ok(Self {
            operation,
            timeframe: Timeframe::compile(&spec.timeframe)?,
            event_name: spec
                .event_name
                .as_ref()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            event_property,
            aggregate_by,
            filters,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormulaConfig {
    pub source: String,
    pub expr: Expr,
}

impl FormulaConfig {
    pub fn compile(source: &str) -> AudienceResult<Self> {
        let expr = formula::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Identifiers referenced anywhere in the formula, in first-seen order.
    pub fn references(&self) -> Vec<String> {
        self.expr.identifiers()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    Aggregate,
    Formula,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComputedConfig {
    Aggregate(AggregateConfig),
    Formula(FormulaConfig),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputedSchema {
    pub field: String,
    pub display_name: String,
    pub data_type: DataType,
    pub config: ComputedConfig,
}

impl ComputedSchema {
    pub fn compile(spec: &ComputedSchemaSpec) -> AudienceResult<Self> {
        let field = require_key("field", &spec.field)?;
        let data_type: DataType = spec.data_type.parse()?;
        let config = match spec.schema_type.trim() {
            "aggregate" => {
                if spec.formula_config.is_some() {
                    return Err(AudienceError::validation(format!(
                        "aggregate field '{field}' must not carry a formulaConfig"
                    )));
                }
                let agg = spec.aggregate_config.as_ref().ok_or_else(|| {
                    AudienceError::config(format!(
                        "aggregate field '{field}' is missing aggregateConfig"
                    ))
                })?;
                ComputedConfig::Aggregate(AggregateConfig::compile(agg)?)
            }
            "formula" => {
                if spec.aggregate_config.is_some() {
                    return Err(AudienceError::validation(format!(
                        "formula field '{field}' must not carry an aggregateConfig"
                    )));
                }
                let f = spec.formula_config.as_ref().ok_or_else(|| {
                    AudienceError::validation(format!(
                        "formula field '{field}' is missing formulaConfig"
                    ))
                })?;
                let config = FormulaConfig::compile(&f.formula)?;
                if config.references().iter().any(|r| r == &field) {
                    return Err(AudienceError::validation(format!(
                        "formula field '{field}' references itself"
                    )));
                }
                ComputedConfig::Formula(config)
            }
            other => {
                return Err(AudienceError::validation(format!(
                    "unknown schemaType '{other}'"
                )))
            }
        };

        Ok(Self {
            display_name: spec.display_name.clone().unwrap_or_else(|| field.clone()),
            field,
            data_type,
            config,
        })
    }

    pub fn schema_type(&self) -> SchemaType {
        match self.config {
            ComputedConfig::Aggregate(_) => SchemaType::Aggregate,
            ComputedConfig::Formula(_) => SchemaType::Formula,
        }
    }

    pub fn formula_references(&self) -> Vec<String> {
        match &self.config {
            ComputedConfig::Formula(f) => f.references(),
            ComputedConfig::Aggregate(_) => Vec::new(),
        }
    }
}

// ─── Segments ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationComparison {
    AtLeast,
    AtMost,
    Exactly,
    Between,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentAggregation {
    pub operation: AggregateOperation,
    pub property: Option<String>,
    pub comparison: AggregationComparison,
    pub value: f64,
    pub value_to: Option<f64>,
}

impl SegmentAggregation {
    pub fn compile(spec: &SegmentAggregationSpec) -> AudienceResult<Self> {
        let operation = match spec.metric.trim() {
            "count_events" | "count" => AggregateOperation::Count,
            "count_unique" => AggregateOperation::CountUnique,
            "sum" => AggregateOperation::Sum,
            "mean" | "avg" | "average" => AggregateOperation::Mean,
            "min" => AggregateOperation::Min,
            "max" => AggregateOperation::Max,
            other => {
                return Err(AudienceError::config(format!(
                    "unknown segment aggregation metric '{other}'"
                )))
            }
        };
        let property = spec
            .property
            .as_ref()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if operation.requires_property() && property.is_none() {
            return Err(AudienceError::config(format!(
                "segment metric '{}' requires a property",
                spec.metric
            )));
        }
        let comparison = match spec.operator.trim() {
            "at_least" => AggregationComparison::AtLeast,
            "at_most" => AggregationComparison::AtMost,
            "exactly" => AggregationComparison::Exactly,
            "between" => AggregationComparison::Between,
            other => {
                return Err(AudienceError::validation(format!(
                    "unknown aggregation operator '{other}'"
                )))
            }
        };
        match (comparison, spec.value_to) {
            (AggregationComparison::Between, None) => {
                return Err(AudienceError::validation(
                    "aggregation operator 'between' requires valueTo",
                ))
            }
            (AggregationComparison::Between, Some(to)) if to < spec.value => {
                return Err(AudienceError::validation(
                    "aggregation bounds are inverted (valueTo < value)",
                ))
            }
            _ => {}
        }

        Ok(Self {
            operation,
            property,
            comparison,
            value: spec.value,
            value_to: spec.value_to,
        })
    }

    /// Compare a metric result. A missing result never satisfies.
    pub fn satisfied_by(&self, metric: Option<f64>) -> bool {
        let Some(m) = metric else {
            return false;
        };
        match self.comparison {
            AggregationComparison::AtLeast => m >= self.value,
            AggregationComparison::AtMost => m <= self.value,
            AggregationComparison::Exactly => m == self.value,
            AggregationComparison::Between => {
                m >= self.value && self.value_to.is_some_and(|to| m <= to)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentFilter {
    Event {
        event_name: String,
        constraints: Vec<Constraint>,
        aggregation: Option<SegmentAggregation>,
        timeframe: Timeframe,
    },
    Property {
        property: String,
        constraints: Vec<Constraint>,
    },
}

impl SegmentFilter {
    pub fn compile(spec: &SegmentFilterSpec) -> AudienceResult<Self> {
        let constraints = spec
            .constraints
            .iter()
            .map(Constraint::compile)
            .collect::<AudienceResult<Vec<_>>>()?;

        match spec.filter_type.trim() {
            "event" => {
                let event_name = spec
                    .event
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        AudienceError::validation("event filter requires an event name")
                    })?
                    .to_string();
                let aggregation = spec
                    .aggregation
                    .as_ref()
                    .map(SegmentAggregation::compile)
                    .transpose()?;
                let timeframe = spec
                    .timeframe
                    .as_ref()
                    .map(Timeframe::compile)
                    .transpose()?
                    .unwrap_or(Timeframe::AllTime);
                Ok(SegmentFilter::Event {
                    event_name,
                    constraints,
                    aggregation,
                    timeframe,
                })
            }
            "property" => {
                if spec.aggregation.is_some() {
                    return Err(AudienceError::validation(
                        "aggregation is only allowed on event filters",
                    ));
                }
                let property = spec
                    .property
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        AudienceError::validation("property filter requires a property name")
                    })?
                    .to_string();
                if let Some(c) = constraints
                    .iter()
                    .find(|c| !c.field.is_empty() && c.field != property)
                {
                    return Err(AudienceError::validation(format!(
                        "constraint field '{}' does not match property filter '{property}'",
                        c.field
                    )));
                }
                Ok(SegmentFilter::Property {
                    property,
                    constraints,
                })
            }
            other => Err(AudienceError::validation(format!(
                "unknown filterType '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub filters: Vec<SegmentFilter>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SegmentDefinition {
    pub fn compile(id: Uuid, spec: &SegmentDefinitionSpec, now: DateTime<Utc>) -> AudienceResult<Self> {
        let name = require_key("name", &spec.name)?;
        let filters = spec
            .filters
            .iter()
            .map(SegmentFilter::compile)
            .collect::<AudienceResult<Vec<_>>>()?;
        Ok(Self {
            id,
            name,
            description: spec.description.clone(),
            filters,
            created_at: now,
            updated_at: now,
        })
    }

    /// Properties named by property filters (raw or computed).
    pub fn referenced_properties(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().filter_map(|f| match f {
            SegmentFilter::Property { property, .. } => Some(property.as_str()),
            SegmentFilter::Event { .. } => None,
        })
    }
}

fn require_key(name: &str, value: &str) -> AudienceResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AudienceError::validation(format!("{name} must not be empty")));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ConstraintSpec, FormulaConfigSpec, TimeframeSpec};
    use serde_json::json;

    fn aggregate_spec(operation: &str, property: Option<&str>) -> AggregateConfigSpec {
        AggregateConfigSpec {
            operation: operation.into(),
            timeframe: TimeframeSpec::Relative {
                value: 30,
                unit: "days".into(),
            },
            event_name: Some("purchase".into()),
            event_property: property.map(String::from),
            aggregate_by: None,
            filters: vec![],
        }
    }

    #[test]
    fn test_unknown_operation_is_configuration_error() {
        let err = AggregateConfig::compile(&aggregate_spec("median", Some("amount"))).unwrap_err();
        assert!(matches!(err, AudienceError::Config(_)));
    }

    #[test]
    fn test_property_required_operations() {
        for op in ["sum", "mean", "min", "max", "first_touch", "last_touch", "top", "count_unique"] {
            let err = AggregateConfig::compile(&aggregate_spec(op, None)).unwrap_err();
            assert!(matches!(err, AudienceError::Config(_)), "{op}");
        }
        assert!(AggregateConfig::compile(&aggregate_spec("count", None)).is_ok());
    }

    #[test]
    fn test_formula_self_reference_rejected() {
        let spec = ComputedSchemaSpec {
            field: "score".into(),
            display_name: None,
            schema_type: "formula".into(),
            data_type: "number".into(),
            aggregate_config: None,
            formula_config: Some(FormulaConfigSpec {
                formula: "MATH(score + 1)".into(),
            }),
        };
        let err = ComputedSchema::compile(&spec).unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
    }

    #[test]
    fn test_computed_requires_matching_config() {
        let spec = ComputedSchemaSpec {
            field: "ltv".into(),
            display_name: Some("Lifetime value".into()),
            schema_type: "aggregate".into(),
            data_type: "number".into(),
            aggregate_config: None,
            formula_config: None,
        };
        assert!(ComputedSchema::compile(&spec).is_err());
    }

    #[test]
    fn test_property_filter_field_must_match() {
        let spec = SegmentFilterSpec {
            filter_type: "property".into(),
            event: None,
            property: Some("plan".into()),
            constraints: vec![ConstraintSpec::new("country", "string", "is", vec![json!("PT")])],
            aggregation: None,
            timeframe: None,
        };
        assert!(SegmentFilter::compile(&spec).is_err());
    }

    #[test]
    fn test_segment_aggregation_comparisons() {
        let agg = SegmentAggregation::compile(&SegmentAggregationSpec {
            metric: "count_events".into(),
            property: None,
            operator: "between".into(),
            value: 2.0,
            value_to: Some(4.0),
        })
        .unwrap();
        assert!(agg.satisfied_by(Some(2.0)));
        assert!(agg.satisfied_by(Some(4.0)));
        assert!(!agg.satisfied_by(Some(5.0)));
        assert!(!agg.satisfied_by(None));

        let err = SegmentAggregation::compile(&SegmentAggregationSpec {
            metric: "count_events".into(),
            property: None,
            operator: "between".into(),
            value: 2.0,
            value_to: None,
        })
        .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
    }

    #[test]
    fn test_duplicate_event_property_rejected() {
        let prop = SchemaFieldSpec {
            field: "amount".into(),
            display_name: None,
            data_type: "number".into(),
            icon: None,
            category: None,
            suggested_values: vec![],
        };
        let spec = EventSchemaSpec {
            event_name: "purchase".into(),
            display_name: None,
            properties: vec![prop.clone(), prop],
        };
        assert!(matches!(
            EventSchema::compile(&spec),
            Err(AudienceError::Conflict(_))
        ));
    }
}
