//! Schema registry: per-project definitions of event schemas, profile
//! properties, computed fields and segments.
//!
//! Each project's state is an immutable [`SchemaSnapshot`] behind an `Arc`.
//! Mutations clone the current snapshot, validate the change against the
//! clone and swap it in under the project's map entry lock, so evaluations
//! holding an older snapshot never see a half-applied edit.

use audience_core::{AudienceError, AudienceResult, DataType};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::formula::DependencyGraph;
use crate::schema::{ComputedSchema, EventSchema, SchemaField, SegmentDefinition};
use crate::wire::{ComputedSchemaSpec, EventSchemaSpec, SchemaFieldSpec, SegmentDefinitionSpec};

// ─── Snapshot ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    project_id: String,
    version: u64,
    event_schemas: BTreeMap<String, EventSchema>,
    profile_properties: BTreeMap<String, SchemaField>,
    computed: BTreeMap<String, ComputedSchema>,
    segments: BTreeMap<Uuid, SegmentDefinition>,
    /// Computed fields, dependencies first.
    evaluation_order: Vec<String>,
}

impl SchemaSnapshot {
    pub fn empty(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Incremented on every successful mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn event_schema(&self, event_name: &str) -> Option<&EventSchema> {
        self.event_schemas.get(event_name)
    }

    pub fn event_schemas(&self) -> impl Iterator<Item = &EventSchema> {
        self.event_schemas.values()
    }

    pub fn profile_property(&self, field: &str) -> Option<&SchemaField> {
        self.profile_properties.get(field)
    }

    pub fn profile_properties(&self) -> impl Iterator<Item = &SchemaField> {
        self.profile_properties.values()
    }

    pub fn computed(&self, field: &str) -> Option<&ComputedSchema> {
        self.computed.get(field)
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &ComputedSchema> {
        self.computed.values()
    }

    pub fn segment(&self, id: &Uuid) -> Option<&SegmentDefinition> {
        self.segments.get(id)
    }

    pub fn segment_by_name(&self, name: &str) -> Option<&SegmentDefinition> {
        self.segments.values().find(|s| s.name == name)
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentDefinition> {
        self.segments.values()
    }

    pub fn evaluation_order(&self) -> &[String] {
        &self.evaluation_order
    }

    /// Declared type of a profile-level attribute, computed or raw.
    pub fn data_type_of(&self, field: &str) -> Option<DataType> {
        self.computed
            .get(field)
            .map(|c| c.data_type)
            .or_else(|| self.profile_properties.get(field).map(|p| p.data_type))
    }

    /// Computed fields whose formulas read `field`, plus segments whose
    /// property filters name it.
    pub fn dependents_of(&self, field: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .computed
            .values()
            .filter(|c| c.formula_references().iter().any(|r| r == field))
            .map(|c| c.field.clone())
            .collect();
        dependents.extend(
            self.segments
                .values()
                .filter(|s| s.referenced_properties().any(|p| p == field))
                .map(|s| format!("segment '{}'", s.name)),
        );
        dependents
    }

    fn rebuild_evaluation_order(&mut self) -> AudienceResult<()> {
        let graph = DependencyGraph::build(
            self.computed
                .values()
                .map(|c| (c.field.clone(), c.formula_references())),
        );
        self.evaluation_order = graph.topological_order()?;
        Ok(())
    }

    fn ensure_attribute_name_free(&self, field: &str) -> AudienceResult<()> {
        if self.computed.contains_key(field) {
            return Err(AudienceError::Conflict(format!(
                "computed field '{field}' already exists"
            )));
        }
        if self.profile_properties.contains_key(field) {
            return Err(AudienceError::Conflict(format!(
                "profile property '{field}' already exists"
            )));
        }
        Ok(())
    }

    fn ensure_segment_name_free(&self, name: &str, except: Option<Uuid>) -> AudienceResult<()> {
        let taken = self
            .segments
            .values()
            .any(|s| s.name == name && Some(s.id) != except);
        if taken {
            return Err(AudienceError::Conflict(format!(
                "segment '{name}' already exists"
            )));
        }
        Ok(())
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    projects: DashMap<String, Arc<SchemaSnapshot>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current point-in-time view of a project. Unknown projects yield an
    /// empty snapshot.
    pub fn snapshot(&self, project_id: &str) -> Arc<SchemaSnapshot> {
        self.projects
            .get(project_id)
            .map(|s| Arc::clone(s.value()))
            .unwrap_or_else(|| Arc::new(SchemaSnapshot::empty(project_id)))
    }

    pub fn projects(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.key().clone()).collect()
    }

    /// Apply `change` to a copy of the project's snapshot and publish the
    /// copy only if the change succeeds.
    fn mutate<T>(
        &self,
        project_id: &str,
        change: impl FnOnce(&mut SchemaSnapshot) -> AudienceResult<T>,
    ) -> AudienceResult<T> {
        let mut entry = self
            .projects
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(SchemaSnapshot::empty(project_id)));
        let mut next = SchemaSnapshot::clone(&entry);
        let out = change(&mut next)?;
        next.version += 1;
        debug!(project = %project_id, version = next.version, "Publishing schema snapshot");
        *entry = Arc::new(next);
        Ok(out)
    }

    // ─── Event schemas ──────────────────────────────────────────────────────

    pub fn create_event_schema(
        &self,
        project_id: &str,
        spec: &EventSchemaSpec,
    ) -> AudienceResult<EventSchema> {
        let schema = EventSchema::compile(spec)?;
        self.mutate(project_id, |snap| {
            if snap.event_schemas.contains_key(&schema.event_name) {
                return Err(AudienceError::Conflict(format!(
                    "event schema '{}' already exists",
                    schema.event_name
                )));
            }
            snap.event_schemas
                .insert(schema.event_name.clone(), schema.clone());
            Ok(())
        })?;
        info!(project = %project_id, event = %schema.event_name, "Event schema created");
        Ok(schema)
    }

    /// Replace an event schema. The event name is immutable.
    pub fn update_event_schema(
        &self,
        project_id: &str,
        event_name: &str,
        spec: &EventSchemaSpec,
    ) -> AudienceResult<EventSchema> {
        let schema = EventSchema::compile(spec)?;
        ensure_same_key("eventName", event_name, &schema.event_name)?;
        self.mutate(project_id, |snap| {
            let slot = snap
                .event_schemas
                .get_mut(event_name)
                .ok_or_else(|| not_found("event schema", event_name))?;
            *slot = schema.clone();
            Ok(())
        })?;
        info!(project = %project_id, event = %event_name, "Event schema updated");
        Ok(schema)
    }

    pub fn delete_event_schema(&self, project_id: &str, event_name: &str) -> AudienceResult<()> {
        self.mutate(project_id, |snap| {
            snap.event_schemas
                .remove(event_name)
                .map(|_| ())
                .ok_or_else(|| not_found("event schema", event_name))
        })?;
        info!(project = %project_id, event = %event_name, "Event schema deleted");
        Ok(())
    }

    // ─── Profile properties ─────────────────────────────────────────────────

    pub fn create_profile_property(
        &self,
        project_id: &str,
        spec: &SchemaFieldSpec,
    ) -> AudienceResult<SchemaField> {
        let field = SchemaField::compile(spec)?;
        self.mutate(project_id, |snap| {
            snap.ensure_attribute_name_free(&field.field)?;
            snap.profile_properties
                .insert(field.field.clone(), field.clone());
            Ok(())
        })?;
        info!(project = %project_id, field = %field.field, "Profile property declared");
        Ok(field)
    }

    pub fn update_profile_property(
        &self,
        project_id: &str,
        name: &str,
        spec: &SchemaFieldSpec,
    ) -> AudienceResult<SchemaField> {
        let field = SchemaField::compile(spec)?;
        ensure_same_key("field", name, &field.field)?;
        self.mutate(project_id, |snap| {
            let slot = snap
                .profile_properties
                .get_mut(name)
                .ok_or_else(|| not_found("profile property", name))?;
            *slot = field.clone();
            Ok(())
        })?;
        info!(project = %project_id, field = %name, "Profile property updated");
        Ok(field)
    }

    pub fn delete_profile_property(&self, project_id: &str, name: &str) -> AudienceResult<()> {
        self.mutate(project_id, |snap| {
            snap.profile_properties
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| not_found("profile property", name))
        })?;
        info!(project = %project_id, field = %name, "Profile property deleted");
        Ok(())
    }

    // ─── Computed fields ────────────────────────────────────────────────────

    pub fn create_computed_schema(
        &self,
        project_id: &str,
        spec: &ComputedSchemaSpec,
    ) -> AudienceResult<ComputedSchema> {
        let schema = ComputedSchema::compile(spec)?;
        self.mutate(project_id, |snap| {
            snap.ensure_attribute_name_free(&schema.field)?;
            snap.computed.insert(schema.field.clone(), schema.clone());
            snap.rebuild_evaluation_order()
        })?;
        info!(
            project = %project_id,
            field = %schema.field,
            schema_type = ?schema.schema_type(),
            "Computed field created"
        );
        Ok(schema)
    }

    /// Replace a computed field's definition. Re-runs cycle detection over
    /// the whole project.
    pub fn update_computed_schema(
        &self,
        project_id: &str,
        field: &str,
        spec: &ComputedSchemaSpec,
    ) -> AudienceResult<ComputedSchema> {
        let schema = ComputedSchema::compile(spec)?;
        ensure_same_key("field", field, &schema.field)?;
        self.mutate(project_id, |snap| {
            let slot = snap
                .computed
                .get_mut(field)
                .ok_or_else(|| not_found("computed field", field))?;
            *slot = schema.clone();
            snap.rebuild_evaluation_order()
        })?;
        info!(project = %project_id, field = %field, "Computed field updated");
        Ok(schema)
    }

    /// Blocked while other formulas or segment property filters read the
    /// field.
    pub fn delete_computed_schema(&self, project_id: &str, field: &str) -> AudienceResult<()> {
        self.mutate(project_id, |snap| {
            if !snap.computed.contains_key(field) {
                return Err(not_found("computed field", field));
            }
            let dependents = snap.dependents_of(field);
            if !dependents.is_empty() {
                return Err(AudienceError::DependencyViolation {
                    field: field.to_string(),
                    dependents,
                });
            }
            snap.computed.remove(field);
            snap.rebuild_evaluation_order()
        })?;
        info!(project = %project_id, field = %field, "Computed field deleted");
        Ok(())
    }

    pub fn get_computed_schema(&self, project_id: &str, field: &str) -> AudienceResult<ComputedSchema> {
        self.snapshot(project_id)
            .computed(field)
            .cloned()
            .ok_or_else(|| not_found("computed field", field))
    }

    // ─── Segments ───────────────────────────────────────────────────────────

    pub fn create_segment(
        &self,
        project_id: &str,
        spec: &SegmentDefinitionSpec,
    ) -> AudienceResult<SegmentDefinition> {
        let segment = SegmentDefinition::compile(Uuid::new_v4(), spec, Utc::now())?;
        self.mutate(project_id, |snap| {
            snap.ensure_segment_name_free(&segment.name, None)?;
            snap.segments.insert(segment.id, segment.clone());
            Ok(())
        })?;
        info!(
            project = %project_id,
            segment_id = %segment.id,
            name = %segment.name,
            filters = segment.filters.len(),
            "Segment created"
        );
        Ok(segment)
    }

    /// Replace a segment's name, description and filters. Id and creation
    /// time are kept.
    pub fn update_segment(
        &self,
        project_id: &str,
        id: Uuid,
        spec: &SegmentDefinitionSpec,
    ) -> AudienceResult<SegmentDefinition> {
        let compiled = SegmentDefinition::compile(id, spec, Utc::now())?;
        let updated = self.mutate(project_id, |snap| {
            snap.ensure_segment_name_free(&compiled.name, Some(id))?;
            let slot = snap
                .segments
                .get_mut(&id)
                .ok_or_else(|| not_found("segment", &id.to_string()))?;
            let updated = SegmentDefinition {
                created_at: slot.created_at,
                ..compiled
            };
            *slot = updated.clone();
            Ok(updated)
        })?;
        info!(project = %project_id, segment_id = %id, "Segment updated");
        Ok(updated)
    }

    pub fn delete_segment(&self, project_id: &str, id: Uuid) -> AudienceResult<()> {
        self.mutate(project_id, |snap| {
            snap.segments
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| not_found("segment", &id.to_string()))
        })?;
        info!(project = %project_id, segment_id = %id, "Segment deleted");
        Ok(())
    }

    pub fn get_segment(&self, project_id: &str, id: Uuid) -> AudienceResult<SegmentDefinition> {
        self.snapshot(project_id)
            .segment(&id)
            .cloned()
            .ok_or_else(|| not_found("segment", &id.to_string()))
    }
}

fn not_found(kind: &str, key: &str) -> AudienceError {
    AudienceError::NotFound(format!("{kind} '{key}'"))
}

fn ensure_same_key(name: &str, existing: &str, requested: &str) -> AudienceResult<()> {
    if existing == requested {
        return Ok(());
    }
    Err(AudienceError::validation(format!(
        "{name} is immutable ('{existing}' cannot become '{requested}')"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        AggregateConfigSpec, ConstraintSpec, FormulaConfigSpec, SegmentFilterSpec, TimeframeSpec,
    };
    use serde_json::json;

    const PROJECT: &str = "proj-1";

    fn formula(field: &str, source: &str) -> ComputedSchemaSpec {
        ComputedSchemaSpec {
            field: field.into(),
            display_name: None,
            schema_type: "formula".into(),
            data_type: "string".into(),
            aggregate_config: None,
            formula_config: Some(FormulaConfigSpec {
                formula: source.into(),
            }),
        }
    }

    fn ltv() -> ComputedSchemaSpec {
        ComputedSchemaSpec {
            field: "ltv".into(),
            display_name: Some("Lifetime value".into()),
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
        }
    }

    fn segment_on(property: &str) -> SegmentDefinitionSpec {
        SegmentDefinitionSpec {
            name: "High value".into(),
            description: None,
            filters: vec![SegmentFilterSpec {
                filter_type: "property".into(),
                event: None,
                property: Some(property.into()),
                constraints: vec![ConstraintSpec::new(
                    property,
                    "number",
                    "greater_than",
                    vec![json!(100)],
                )],
                aggregation: None,
                timeframe: None,
            }],
        }
    }

    #[test]
    fn test_duplicate_computed_field_conflicts() {
        let registry = SchemaRegistry::new();
        registry.create_computed_schema(PROJECT, &ltv()).unwrap();
        let err = registry.create_computed_schema(PROJECT, &ltv()).unwrap_err();
        assert!(matches!(err, AudienceError::Conflict(_)));

        // Other projects are independent.
        assert!(registry.create_computed_schema("proj-2", &ltv()).is_ok());
    }

    #[test]
    fn test_computed_field_and_profile_property_share_namespace() {
        let registry = SchemaRegistry::new();
        registry
            .create_profile_property(
                PROJECT,
                &SchemaFieldSpec {
                    field: "ltv".into(),
                    display_name: None,
                    data_type: "number".into(),
                    icon: None,
                    category: None,
                    suggested_values: vec![],
                },
            )
            .unwrap();
        let err = registry.create_computed_schema(PROJECT, &ltv()).unwrap_err();
        assert!(matches!(err, AudienceError::Conflict(_)));
    }

    #[test]
    fn test_evaluation_order_and_cycle_rejection() {
        let registry = SchemaRegistry::new();
        registry.create_computed_schema(PROJECT, &ltv()).unwrap();
        registry
            .create_computed_schema(PROJECT, &formula("band", r#"IF(MATH(ltv) > 100, "high", "low")"#))
            .unwrap();
        registry
            .create_computed_schema(PROJECT, &formula("label", r#"CAT(band, "-", a)"#))
            .unwrap();

        let snap = registry.snapshot(PROJECT);
        let order = snap.evaluation_order();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("ltv") < pos("band"));
        assert!(pos("band") < pos("label"));

        // label already reads `a`; defining `a` in terms of label closes a loop.
        let err = registry
            .create_computed_schema(PROJECT, &formula("a", "CAT(label)"))
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(ref m) if m.contains("cycle")));
        assert!(registry.snapshot(PROJECT).computed("a").is_none());
        assert_eq!(registry.snapshot(PROJECT).version(), snap.version());
    }

    #[test]
    fn test_update_introducing_cycle_rejected() {
        let registry = SchemaRegistry::new();
        registry.create_computed_schema(PROJECT, &ltv()).unwrap();
        registry
            .create_computed_schema(PROJECT, &formula("band", r#"IF(MATH(ltv) > 100, "high", "low")"#))
            .unwrap();
        registry
            .create_computed_schema(PROJECT, &formula("label", r#"CAT(band, "!")"#))
            .unwrap();
        let before = registry.snapshot(PROJECT);

        let err = registry
            .update_computed_schema(PROJECT, "band", &formula("band", "CAT(label)"))
            .unwrap_err();
        assert!(matches!(err, AudienceError::Validation(ref m) if m.contains("cycle")));

        let after = registry.snapshot(PROJECT);
        assert_eq!(after.version(), before.version());
        assert_eq!(after.computed("band"), before.computed("band"));
        assert_eq!(after.evaluation_order(), before.evaluation_order());

        registry
            .update_computed_schema(PROJECT, "band", &formula("band", r#"CAT("flat")"#))
            .unwrap();
        assert_eq!(registry.snapshot(PROJECT).version(), before.version() + 1);
    }

    #[test]
    fn test_self_reference_rejected() {
        let registry = SchemaRegistry::new();
        let err = registry
            .create_computed_schema(PROJECT, &formula("x", "CAT(x)"))
            .unwrap_err();
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_delete_blocked_by_dependents() {
        let registry = SchemaRegistry::new();
        registry.create_computed_schema(PROJECT, &ltv()).unwrap();
        registry
            .create_computed_schema(PROJECT, &formula("ltv_text", "CAT(ltv)"))
            .unwrap();
        let segment = registry.create_segment(PROJECT, &segment_on("ltv")).unwrap();

        let err = registry.delete_computed_schema(PROJECT, "ltv").unwrap_err();
        match err {
            AudienceError::DependencyViolation { field, dependents } => {
                assert_eq!(field, "ltv");
                assert_eq!(dependents.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        registry.delete_computed_schema(PROJECT, "ltv_text").unwrap();
        registry.delete_segment(PROJECT, segment.id).unwrap();
        registry.delete_computed_schema(PROJECT, "ltv").unwrap();
        assert!(registry.snapshot(PROJECT).evaluation_order().is_empty());
    }

    #[test]
    fn test_snapshots_are_isolated_from_later_edits() {
        let registry = SchemaRegistry::new();
        let before = registry.snapshot(PROJECT);
        registry.create_computed_schema(PROJECT, &ltv()).unwrap();
        assert!(before.computed("ltv").is_none());
        assert!(registry.snapshot(PROJECT).computed("ltv").is_some());
    }

    #[test]
    fn test_segment_crud() {
        let registry = SchemaRegistry::new();
        let created = registry.create_segment(PROJECT, &segment_on("spend")).unwrap();
        assert!(matches!(
            registry.create_segment(PROJECT, &segment_on("spend")).unwrap_err(),
            AudienceError::Conflict(_)
        ));

        let mut spec = segment_on("spend");
        spec.description = Some("Spent over 100".into());
        let updated = registry.update_segment(PROJECT, created.id, &spec).unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(
            registry.get_segment(PROJECT, created.id).unwrap().description.as_deref(),
            Some("Spent over 100")
        );

        registry.delete_segment(PROJECT, created.id).unwrap();
        assert!(matches!(
            registry.get_segment(PROJECT, created.id).unwrap_err(),
            AudienceError::NotFound(_)
        ));
    }

    #[test]
    fn test_event_schema_key_is_immutable() {
        let registry = SchemaRegistry::new();
        let spec = EventSchemaSpec {
            event_name: "purchase".into(),
            display_name: None,
            properties: vec![],
        };
        registry.create_event_schema(PROJECT, &spec).unwrap();
        let renamed = EventSchemaSpec {
            event_name: "order".into(),
            ..spec.clone()
        };
        assert!(registry
            .update_event_schema(PROJECT, "purchase", &renamed)
            .is_err());
        assert!(matches!(
            registry.create_event_schema(PROJECT, &spec).unwrap_err(),
            AudienceError::Conflict(_)
        ));
    }
}
