//! Computed properties: per-profile resolution of aggregate and formula
//! fields against a schema snapshot.

use audience_core::{AudienceError, AudienceResult, DataType, Event, Profile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use crate::aggregate::EventAggregator;
use crate::formula::{evaluate, Scope};
use crate::registry::SchemaSnapshot;
use crate::schema::{ComputedConfig, ComputedSchema};

/// A computed field's value for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputedValue {
    pub field: String,
    pub data_type: DataType,
    pub value: Value,
    pub degraded: bool,
}

/// Resolves attributes for a single profile within a single request.
///
/// Every computed field is evaluated at most once; later lookups (from
/// dependent formulas, segment filters or report columns) read the memo. A
/// resolver must not outlive the request it was created for.
pub struct ComputedResolver<'a> {
    snapshot: &'a SchemaSnapshot,
    profile: &'a Profile,
    events: &'a [Event],
    aggregator: &'a EventAggregator,
    now: DateTime<Utc>,
    memo: HashMap<String, Value>,
    in_progress: HashSet<String>,
    evaluations: usize,
    degraded: bool,
}

impl<'a> ComputedResolver<'a> {
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        profile: &'a Profile,
        events: &'a [Event],
        aggregator: &'a EventAggregator,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            profile,
            events,
            aggregator,
            now,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
            evaluations: 0,
            degraded: false,
        }
    }

    pub fn profile(&self) -> &'a Profile {
        self.profile
    }

    pub fn events(&self) -> &'a [Event] {
        self.events
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True once any aggregate scan for this profile hit its limit.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn mark_degraded(&mut self) {
        self.degraded = true;
    }

    /// Number of computed fields actually evaluated (memo misses).
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Resolve an attribute name: computed fields first, then the raw
    /// profile. Unknown names resolve to `null`.
    pub fn resolve(&mut self, name: &str) -> Value {
        let snapshot = self.snapshot;
        match snapshot.computed(name) {
            Some(schema) => self.computed_value(schema),
            None => self.profile.attribute(name).unwrap_or(Value::Null),
        }
    }

    /// Evaluate one computed field by name.
    pub fn compute(&mut self, field: &str) -> AudienceResult<ComputedValue> {
        let snapshot = self.snapshot;
        let schema = snapshot
            .computed(field)
            .ok_or_else(|| AudienceError::NotFound(format!("computed field '{field}'")))?;
        let value = self.computed_value(schema);
        Ok(ComputedValue {
            field: schema.field.clone(),
            data_type: schema.data_type,
            value,
            degraded: self.degraded,
        })
    }

    /// Evaluate every computed field in dependency order.
    pub fn resolve_all(&mut self) -> BTreeMap<String, Value> {
        let snapshot = self.snapshot;
        snapshot
            .evaluation_order()
            .iter()
            .map(|field| (field.clone(), self.resolve(field)))
            .collect()
    }

    fn computed_value(&mut self, schema: &ComputedSchema) -> Value {
        if let Some(hit) = self.memo.get(&schema.field) {
            return hit.clone();
        }
        if !self.in_progress.insert(schema.field.clone()) {
            // Registry snapshots are acyclic; this only guards hand-built ones.
            warn!(field = %schema.field, "Re-entrant computed field lookup");
            return Value::Null;
        }

        let value = match &schema.config {
            ComputedConfig::Aggregate(config) => {
                let outcome = self.aggregator.compute(self.events, config, self.now);
                self.degraded |= outcome.degraded;
                outcome.value
            }
            ComputedConfig::Formula(config) => evaluate(&config.expr, self).into_json(),
        };

        self.in_progress.remove(&schema.field);
        self.evaluations += 1;
        self.memo.insert(schema.field.clone(), value.clone());
        value
    }
}

impl Scope for ComputedResolver<'_> {
    fn resolve(&mut self, name: &str) -> Value {
        ComputedResolver::resolve(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ScanLimits;
    use crate::registry::SchemaRegistry;
    use crate::wire::{AggregateConfigSpec, ComputedSchemaSpec, FormulaConfigSpec, TimeframeSpec};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn formula(field: &str, data_type: &str, source: &str) -> ComputedSchemaSpec {
        ComputedSchemaSpec {
            field: field.into(),
            display_name: None,
            schema_type: "formula".into(),
            data_type: data_type.into(),
            aggregate_config: None,
            formula_config: Some(FormulaConfigSpec {
                formula: source.into(),
            }),
        }
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new();
        registry
            .create_computed_schema(
                "p",
                &ComputedSchemaSpec {
                    field: "ltv".into(),
                    display_name: None,
                    schema_type: "aggregate".into(),
                    data_type: "number".into(),
                    aggregate_config: Some(AggregateConfigSpec {
                        operation: "sum".into(),
                        timeframe: TimeframeSpec::AllTime,
                        event_name: Some("purchase".into()),
                        event_property: Some("amount".into()),
                        aggregate_by: None,
                        filters: vec![],
                    }),
                    formula_config: None,
                },
            )
            .unwrap();
        registry
            .create_computed_schema(
                "p",
                &formula("tier", "string", r#"IF(MATH(ltv) >= 100, "gold", "basic")"#),
            )
            .unwrap();
        registry
            .create_computed_schema(
                "p",
                &formula("badge", "string", r#"CAT(first_name, " (", tier, ", ", ltv, ")")"#),
            )
            .unwrap();
        registry
            .create_computed_schema("p", &formula("double_ltv", "number", "MATH(ltv * 2)"))
            .unwrap();
        registry
    }

    fn events() -> Vec<Event> {
        vec![
            Event::new("u1", "purchase", now() - Duration::days(3)).with_property("amount", json!(60)),
            Event::new("u1", "purchase", now() - Duration::days(1)).with_property("amount", json!(70)),
        ]
    }

    #[test]
    fn test_formula_chain_resolves() {
        let registry = registry();
        let snapshot = registry.snapshot("p");
        let profile = Profile::new("u1").with_trait("first_name", json!("Ada"));
        let events = events();
        let aggregator = EventAggregator::default();
        let mut resolver = ComputedResolver::new(&snapshot, &profile, &events, &aggregator, now());

        assert_eq!(resolver.resolve("badge"), json!("Ada (gold, 130)"));
        assert_eq!(resolver.resolve("double_ltv"), json!(260));
        assert_eq!(resolver.resolve("first_name"), json!("Ada"));
        assert_eq!(resolver.resolve("nope"), Value::Null);
    }

    #[test]
    fn test_each_field_evaluated_once_per_request() {
        let registry = registry();
        let snapshot = registry.snapshot("p");
        let profile = Profile::new("u1");
        let events = events();
        let aggregator = EventAggregator::default();
        let mut resolver = ComputedResolver::new(&snapshot, &profile, &events, &aggregator, now());

        let all = resolver.resolve_all();
        assert_eq!(all.len(), 4);
        assert_eq!(resolver.evaluations(), 4);
        resolver.resolve("badge");
        resolver.resolve("ltv");
        assert_eq!(resolver.evaluations(), 4);

        // A fresh resolver starts with an empty memo.
        let mut fresh = ComputedResolver::new(&snapshot, &profile, &events, &aggregator, now());
        fresh.resolve("ltv");
        assert_eq!(fresh.evaluations(), 1);
    }

    #[test]
    fn test_compute_unknown_field() {
        let registry = registry();
        let snapshot = registry.snapshot("p");
        let profile = Profile::new("u1");
        let aggregator = EventAggregator::default();
        let mut resolver = ComputedResolver::new(&snapshot, &profile, &[], &aggregator, now());
        assert!(matches!(
            resolver.compute("missing").unwrap_err(),
            AudienceError::NotFound(_)
        ));
        let ltv = resolver.compute("ltv").unwrap();
        assert_eq!(ltv.value, json!(0));
        assert_eq!(ltv.data_type, DataType::Number);
    }

    #[test]
    fn test_degradation_propagates() {
        let registry = registry();
        let snapshot = registry.snapshot("p");
        let profile = Profile::new("u1");
        let events = events();
        let aggregator = EventAggregator::new(ScanLimits {
            max_events: 1,
            time_budget: None,
        });
        let mut resolver = ComputedResolver::new(&snapshot, &profile, &events, &aggregator, now());
        let value = resolver.compute("tier").unwrap();
        assert_eq!(value.value, json!("basic"));
        assert!(value.degraded);
    }
}
