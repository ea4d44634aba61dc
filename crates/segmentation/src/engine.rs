//! Core segmentation engine: decides whether a profile belongs to a segment.

use audience_core::value::as_number;
use audience_core::{Event, Profile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{reduce, EventAggregator};
use crate::computed::ComputedResolver;
use crate::registry::SchemaSnapshot;
use crate::schema::{AggregateBy, SegmentDefinition, SegmentFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MembershipOutcome {
    pub matched: bool,
    /// Some event scan stopped at its limit, so `matched` was decided on
    /// partial data.
    pub degraded: bool,
}

/// Stateless evaluator; one instance can serve any number of threads.
#[derive(Debug, Clone, Default)]
pub struct SegmentEvaluator {
    aggregator: EventAggregator,
}

impl SegmentEvaluator {
    pub fn new(aggregator: EventAggregator) -> Self {
        Self { aggregator }
    }

    pub fn aggregator(&self) -> &EventAggregator {
        &self.aggregator
    }

    pub fn matches(
        &self,
        snapshot: &SchemaSnapshot,
        profile: &Profile,
        events: &[Event],
        segment: &SegmentDefinition,
        now: DateTime<Utc>,
    ) -> bool {
        self.evaluate(snapshot, profile, events, segment, now).matched
    }

    pub fn evaluate(
        &self,
        snapshot: &SchemaSnapshot,
        profile: &Profile,
        events: &[Event],
        segment: &SegmentDefinition,
        now: DateTime<Utc>,
    ) -> MembershipOutcome {
        let mut resolver = ComputedResolver::new(snapshot, profile, events, &self.aggregator, now);
        self.evaluate_with(&mut resolver, segment)
    }

    /// Evaluate against an existing resolver so computed values already
    /// memoized for this profile are reused.
    pub fn evaluate_with(
        &self,
        resolver: &mut ComputedResolver<'_>,
        segment: &SegmentDefinition,
    ) -> MembershipOutcome {
        let matched = segment
            .filters
            .iter()
            .all(|filter| self.filter_matches(resolver, filter));
        MembershipOutcome {
            matched,
            degraded: resolver.is_degraded(),
        }
    }

    fn filter_matches(&self, resolver: &mut ComputedResolver<'_>, filter: &SegmentFilter) -> bool {
        match filter {
            SegmentFilter::Event {
                event_name,
                constraints,
                aggregation,
                timeframe,
            } => {
                let window = timeframe.resolve(resolver.now());
                let scan = self.aggregator.scan(
                    resolver.events(),
                    &window,
                    Some(event_name.as_str()),
                    constraints,
                );
                if scan.degraded {
                    resolver.mark_degraded();
                }
                match aggregation {
                    None => !scan.events.is_empty(),
                    Some(agg) => {
                        let metric = reduce(
                            agg.operation,
                            agg.property.as_deref(),
                            AggregateBy::Total,
                            &scan.events,
                        );
                        agg.satisfied_by(as_number(&metric))
                    }
                }
            }
            SegmentFilter::Property {
                property,
                constraints,
            } => {
                let value = resolver.resolve(property);
                constraints.iter().all(|c| c.matches(Some(&value)))
            }
        }
    }
}
