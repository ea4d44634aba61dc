//! JSON fixtures: a project's definitions plus the profiles and events to
//! evaluate them against.

use audience_core::{AudienceResult, Event, Profile};
use audience_segmentation::wire::{
    ComputedSchemaSpec, EventSchemaSpec, SchemaFieldSpec, SegmentDefinitionSpec,
};
use audience_segmentation::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::storage::InMemoryStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub project_id: String,
    #[serde(default)]
    pub event_schemas: Vec<EventSchemaSpec>,
    #[serde(default)]
    pub profile_properties: Vec<SchemaFieldSpec>,
    #[serde(default)]
    pub computed_schemas: Vec<ComputedSchemaSpec>,
    #[serde(default)]
    pub segments: Vec<SegmentDefinitionSpec>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// What a fixture load registered.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureSummary {
    pub project_id: String,
    pub event_schemas: usize,
    pub profile_properties: usize,
    pub computed_schemas: usize,
    /// Segment name to assigned id.
    pub segments: BTreeMap<String, Uuid>,
    pub profiles: usize,
    pub events: usize,
}

impl Fixture {
    pub fn from_path(path: impl AsRef<Path>) -> AudienceResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> AudienceResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Register every definition and load the data. Definitions go through
    /// the registry, so the first invalid one aborts the load.
    pub fn apply(
        &self,
        registry: &SchemaRegistry,
        store: &InMemoryStore,
    ) -> AudienceResult<FixtureSummary> {
        let project = self.project_id.as_str();
        let mut summary = FixtureSummary {
            project_id: self.project_id.clone(),
            ..Default::default()
        };

        for spec in &self.event_schemas {
            registry.create_event_schema(project, spec)?;
            summary.event_schemas += 1;
        }
        for spec in &self.profile_properties {
            registry.create_profile_property(project, spec)?;
            summary.profile_properties += 1;
        }
        for spec in &self.computed_schemas {
            registry.create_computed_schema(project, spec)?;
            summary.computed_schemas += 1;
        }
        for spec in &self.segments {
            let segment = registry.create_segment(project, spec)?;
            summary.segments.insert(segment.name, segment.id);
        }

        for profile in &self.profiles {
            store.upsert_profile(project, profile.clone());
        }
        for event in &self.events {
            store.append_event(project, event.clone());
        }
        summary.profiles = self.profiles.len();
        summary.events = self.events.len();

        info!(
            project = %project,
            computed = summary.computed_schemas,
            segments = summary.segments.len(),
            profiles = summary.profiles,
            events = summary.events,
            "Fixture loaded"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audience_core::AudienceError;
    use audience_segmentation::SchemaRegistry;

    const FIXTURE: &str = r#"{
        "projectId": "shop",
        "computedSchemas": [
            {
                "field": "order_count",
                "schemaType": "aggregate",
                "dataType": "number",
                "aggregateConfig": {
                    "operation": "count",
                    "timeframe": {"type": "all_time"},
                    "eventName": "order"
                }
            }
        ],
        "segments": [
            {"name": "buyers", "filters": [{"filterType": "event", "event": "order"}]}
        ],
        "profiles": [{"id": "u1", "traits": {"plan": "pro"}}],
        "events": [
            {"profileId": "u1", "eventName": "order", "timestamp": "2024-03-01T10:00:00Z"}
        ]
    }"#;

    #[test]
    fn test_apply_fixture() {
        let fixture = Fixture::from_json(FIXTURE).unwrap();
        let registry = SchemaRegistry::new();
        let store = InMemoryStore::new();
        let summary = fixture.apply(&registry, &store).unwrap();
        assert_eq!(summary.computed_schemas, 1);
        assert!(summary.segments.contains_key("buyers"));
        assert_eq!(store.event_count("shop"), 1);
        assert!(registry.snapshot("shop").segment_by_name("buyers").is_some());
    }

    #[test]
    fn test_invalid_definition_aborts() {
        let mut fixture = Fixture::from_json(FIXTURE).unwrap();
        fixture.computed_schemas[0].schema_type = "magic".into();
        let err = fixture
            .apply(&SchemaRegistry::new(), &InMemoryStore::new())
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(_)));
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            Fixture::from_json("{not json").unwrap_err(),
            AudienceError::Serialization(_)
        ));
    }
}
