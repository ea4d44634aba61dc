//! Evaluation service: the entry point callers use to check membership,
//! compute fields and build reports against stored profiles.

use audience_core::{AudienceError, AudienceResult, EngineConfig, Event, Profile};
use audience_reporting::{ProfileRow, ReportPlan, ReportResolver, ReportSpec, ReportTable};
use audience_segmentation::schema::ComputedConfig;
use audience_segmentation::{
    AggregateConfig, ComputedResolver, ComputedValue, EventAggregator, MembershipOutcome,
    ScanLimits, SchemaRegistry, SegmentEvaluator,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::storage::{EventQuery, EventStore};

pub struct AudienceService {
    config: EngineConfig,
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EventStore>,
    evaluator: SegmentEvaluator,
    pool: rayon::ThreadPool,
    pinned_now: Option<DateTime<Utc>>,
}

impl AudienceService {
    pub fn new(
        config: EngineConfig,
        registry: Arc<SchemaRegistry>,
        store: Arc<dyn EventStore>,
    ) -> AudienceResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.evaluation.worker_threads)
            .thread_name(|i| format!("audience-eval-{i}"))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build evaluation pool: {e}"))?;
        let evaluator =
            SegmentEvaluator::new(EventAggregator::new(ScanLimits::from_config(&config.evaluation)));

        info!(
            node_id = %config.node_id,
            worker_threads = pool.current_num_threads(),
            max_events_per_scan = config.evaluation.max_events_per_scan,
            "Audience service initialized"
        );
        Ok(Self {
            config,
            registry,
            store,
            evaluator,
            pool,
            pinned_now: None,
        })
    }

    /// Evaluate every request as of `now` instead of the wall clock.
    pub fn pinned_at(mut self, now: DateTime<Utc>) -> Self {
        self.pinned_now = Some(now);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.pinned_now.unwrap_or_else(Utc::now)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &dyn EventStore {
        self.store.as_ref()
    }

    pub fn evaluator(&self) -> &SegmentEvaluator {
        &self.evaluator
    }

    pub(crate) fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    pub(crate) fn load_profile(
        &self,
        project_id: &str,
        profile_id: &str,
    ) -> AudienceResult<(Profile, Vec<Event>)> {
        self.load_profile_with(project_id, EventQuery::for_profile(profile_id))
    }

    fn load_profile_with(
        &self,
        project_id: &str,
        query: EventQuery,
    ) -> AudienceResult<(Profile, Vec<Event>)> {
        let profile = self
            .store
            .profile(project_id, &query.profile_id)?
            .ok_or_else(|| AudienceError::NotFound(format!("profile '{}'", query.profile_id)))?;
        let events = self.store.events(project_id, &query)?;
        Ok((profile, events))
    }

    /// Fetch only the events one aggregate can see.
    fn scoped_query(profile_id: &str, config: &AggregateConfig, now: DateTime<Utc>) -> EventQuery {
        let query = EventQuery::for_profile(profile_id).within(config.timeframe.resolve(now));
        match &config.event_name {
            Some(name) => query.named(name.clone()),
            None => query,
        }
    }

    pub fn matches(
        &self,
        project_id: &str,
        profile_id: &str,
        segment_id: Uuid,
    ) -> AudienceResult<MembershipOutcome> {
        let snapshot = self.registry.snapshot(project_id);
        let segment = snapshot
            .segment(&segment_id)
            .ok_or_else(|| AudienceError::NotFound(format!("segment '{segment_id}'")))?;
        let (profile, events) = self.load_profile(project_id, profile_id)?;
        let outcome = self
            .evaluator
            .evaluate(&snapshot, &profile, &events, segment, self.now());
        debug!(
            project = %project_id,
            profile = %profile_id,
            segment_id = %segment_id,
            matched = outcome.matched,
            degraded = outcome.degraded,
            "Membership evaluated"
        );
        Ok(outcome)
    }

    pub fn compute_schema(
        &self,
        project_id: &str,
        profile_id: &str,
        field: &str,
    ) -> AudienceResult<ComputedValue> {
        let snapshot = self.registry.snapshot(project_id);
        let now = self.now();
        let query = match snapshot.computed(field).map(|schema| &schema.config) {
            Some(ComputedConfig::Aggregate(config)) => Self::scoped_query(profile_id, config, now),
            _ => EventQuery::for_profile(profile_id),
        };
        let (profile, events) = self.load_profile_with(project_id, query)?;
        let mut resolver = ComputedResolver::new(
            &snapshot,
            &profile,
            &events,
            self.evaluator.aggregator(),
            now,
        );
        resolver.compute(field)
    }

    /// Every computed field for one profile, in dependency order.
    pub fn compute_all(
        &self,
        project_id: &str,
        profile_id: &str,
    ) -> AudienceResult<BTreeMap<String, Value>> {
        let snapshot = self.registry.snapshot(project_id);
        let (profile, events) = self.load_profile(project_id, profile_id)?;
        let mut resolver = ComputedResolver::new(
            &snapshot,
            &profile,
            &events,
            self.evaluator.aggregator(),
            self.now(),
        );
        Ok(resolver.resolve_all())
    }

    pub fn build_report(&self, project_id: &str, spec: &ReportSpec) -> AudienceResult<ReportTable> {
        self.build_report_cancellable(project_id, spec, &CancellationToken::new())
    }

    pub fn build_report_cancellable(
        &self,
        project_id: &str,
        spec: &ReportSpec,
        cancel: &CancellationToken,
    ) -> AudienceResult<ReportTable> {
        let snapshot = self.registry.snapshot(project_id);
        let plan = ReportPlan::compile(spec, &snapshot, &self.config.reporting)?;
        let now = self.now();

        let scope = plan.event_scope();
        let profiles = self.store.profiles(project_id)?;
        let loaded: Vec<(Profile, Vec<Event>)> = self.pool.install(|| {
            profiles
                .into_par_iter()
                .map(|profile| {
                    if cancel.is_cancelled() {
                        return Err(AudienceError::Cancelled);
                    }
                    let query = match scope {
                        Some(config) => Self::scoped_query(&profile.id, config, now),
                        None => EventQuery::for_profile(profile.id.clone()),
                    };
                    let events = self.store.events(project_id, &query)?;
                    Ok((profile, events))
                })
                .collect::<AudienceResult<Vec<_>>>()
        })?;
        let rows: Vec<ProfileRow<'_>> = loaded
            .iter()
            .map(|(profile, events)| ProfileRow { profile, events })
            .collect();

        let table = self.pool.install(|| {
            ReportResolver::new(&snapshot, &self.evaluator, now).resolve(&rows, &plan, || {
                cancel.is_cancelled()
            })
        })?;
        info!(
            project = %project_id,
            columns = table.columns.len(),
            total_rows = table.pagination.total_rows,
            degraded = table.degraded,
            "Report built"
        );
        Ok(table)
    }
}
