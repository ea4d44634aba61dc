//! Segment builder: fluent API for constructing segment definitions.
//!
//! `within`, `where_event` and `with_aggregation` refine the most recently
//! added event filter.

use crate::wire::{
    ConstraintSpec, SegmentAggregationSpec, SegmentDefinitionSpec, SegmentFilterSpec,
    TimeframeSpec,
};

pub struct SegmentBuilder {
    name: String,
    description: Option<String>,
    filters: Vec<SegmentFilterSpec>,
}

impl SegmentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            filters: Vec::new(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Performed the event at least once.
    pub fn did_event(mut self, event_name: impl Into<String>) -> Self {
        self.filters.push(event_filter(event_name.into(), None));
        self
    }

    pub fn did_event_at_least(mut self, event_name: impl Into<String>, count: f64) -> Self {
        self.filters.push(event_filter(
            event_name.into(),
            Some(count_aggregation("at_least", count)),
        ));
        self
    }

    pub fn did_not_do_event(mut self, event_name: impl Into<String>) -> Self {
        self.filters.push(event_filter(
            event_name.into(),
            Some(count_aggregation("at_most", 0.0)),
        ));
        self
    }

    pub fn within(mut self, timeframe: TimeframeSpec) -> Self {
        if let Some(filter) = self.last_event_filter() {
            filter.timeframe = Some(timeframe);
        }
        self
    }

    pub fn where_event(mut self, constraint: ConstraintSpec) -> Self {
        if let Some(filter) = self.last_event_filter() {
            filter.constraints.push(constraint);
        }
        self
    }

    pub fn with_aggregation(
        mut self,
        metric: impl Into<String>,
        property: Option<&str>,
        operator: impl Into<String>,
        value: f64,
        value_to: Option<f64>,
    ) -> Self {
        let aggregation = SegmentAggregationSpec {
            metric: metric.into(),
            property: property.map(String::from),
            operator: operator.into(),
            value,
            value_to,
        };
        if let Some(filter) = self.last_event_filter() {
            filter.aggregation = Some(aggregation);
        }
        self
    }

    pub fn property(
        mut self,
        property: impl Into<String>,
        data_type: impl Into<String>,
        operator: impl Into<String>,
        values: Vec<serde_json::Value>,
    ) -> Self {
        let property = property.into();
        self.filters.push(SegmentFilterSpec {
            filter_type: "property".into(),
            event: None,
            constraints: vec![ConstraintSpec::new(
                property.clone(),
                data_type,
                operator,
                values,
            )],
            property: Some(property),
            aggregation: None,
            timeframe: None,
        });
        self
    }

    pub fn build(self) -> SegmentDefinitionSpec {
        SegmentDefinitionSpec {
            name: self.name,
            description: self.description,
            filters: self.filters,
        }
    }

    fn last_event_filter(&mut self) -> Option<&mut SegmentFilterSpec> {
        self.filters
            .iter_mut()
            .rev()
            .find(|f| f.filter_type == "event")
    }
}

fn event_filter(event_name: String, aggregation: Option<SegmentAggregationSpec>) -> SegmentFilterSpec {
    SegmentFilterSpec {
        filter_type: "event".into(),
        event: Some(event_name),
        property: None,
        constraints: Vec::new(),
        aggregation,
        timeframe: None,
    }
}

fn count_aggregation(operator: &str, count: f64) -> SegmentAggregationSpec {
    SegmentAggregationSpec {
        metric: "count_events".into(),
        property: None,
        operator: operator.into(),
        value: count,
        value_to: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_shapes_filters() {
        let spec = SegmentBuilder::new("Engaged iOS")
            .description("Frequent iOS users on a paid plan")
            .did_event_at_least("session_start", 5.0)
            .within(TimeframeSpec::Relative {
                value: 14,
                unit: "days".into(),
            })
            .where_event(ConstraintSpec::new("platform", "string", "is", vec![json!("ios")]))
            .property("plan", "string", "is_not", vec![json!("free")])
            .build();

        assert_eq!(spec.name, "Engaged iOS");
        assert_eq!(spec.filters.len(), 2);
        let event = &spec.filters[0];
        assert_eq!(event.event.as_deref(), Some("session_start"));
        assert_eq!(event.constraints.len(), 1);
        assert!(event.timeframe.is_some());
        assert_eq!(event.aggregation.as_ref().map(|a| a.value), Some(5.0));
        assert_eq!(spec.filters[1].property.as_deref(), Some("plan"));
    }

    #[test]
    fn test_refinements_skip_property_filters() {
        let spec = SegmentBuilder::new("s")
            .did_event("purchase")
            .property("plan", "string", "is", vec![json!("pro")])
            .with_aggregation("sum", Some("amount"), "at_least", 100.0, None)
            .build();
        assert!(spec.filters[0].aggregation.is_some());
        assert!(spec.filters[1].aggregation.is_none());
    }

    #[test]
    fn test_built_spec_serializes_camel_case() {
        let spec = SegmentBuilder::new("s").did_not_do_event("login").build();
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["filters"][0]["filterType"], json!("event"));
        assert_eq!(value["filters"][0]["aggregation"]["metric"], json!("count_events"));
    }
}
