//! Event aggregation: window the profile's events, apply payload filters,
//! then reduce to a single scalar.
//!
//! Scans are bounded by [`ScanLimits`]. Hitting the event cap or the time
//! budget stops the scan early and the partial reduction is returned with
//! `degraded` set; aggregation itself never fails.

use audience_core::config::EvaluationConfig;
use audience_core::value::{as_number, canonical_key, is_absent, number_value};
use audience_core::Event;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::predicates::{all_match, Constraint};
use crate::schema::{AggregateBy, AggregateConfig, AggregateOperation};
use crate::timeframe::TimeWindow;

/// How often (in events) the wall clock is consulted during a scan.
const CLOCK_CHECK_INTERVAL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
    pub max_events: usize,
    pub time_budget: Option<Duration>,
}

impl ScanLimits {
    pub fn unlimited() -> Self {
        Self {
            max_events: usize::MAX,
            time_budget: None,
        }
    }

    pub fn from_config(config: &EvaluationConfig) -> Self {
        Self {
            max_events: config.max_events_per_scan.max(1),
            time_budget: (config.scan_time_budget_ms > 0)
                .then(|| Duration::from_millis(config.scan_time_budget_ms)),
        }
    }
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self::from_config(&EvaluationConfig::default())
    }
}

/// Events that survived windowing and filtering, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Scan<'a> {
    pub events: Vec<&'a Event>,
    pub scanned: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutcome {
    pub value: Value,
    pub scanned: usize,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct EventAggregator {
    limits: ScanLimits,
}

impl EventAggregator {
    pub fn new(limits: ScanLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ScanLimits {
        self.limits
    }

    /// Collect the events named `event_name` (any name when `None`) whose
    /// timestamp falls in `window` and whose payload passes every filter.
    pub fn scan<'a>(
        &self,
        events: &'a [Event],
        window: &TimeWindow,
        event_name: Option<&str>,
        filters: &[Constraint],
    ) -> Scan<'a> {
        let started = Instant::now();
        let mut out = Scan::default();

        for event in events {
            if out.scanned >= self.limits.max_events {
                out.degraded = true;
                break;
            }
            if out.scanned % CLOCK_CHECK_INTERVAL == 0 && out.scanned > 0 {
                if let Some(budget) = self.limits.time_budget {
                    if started.elapsed() > budget {
                        out.degraded = true;
                        break;
                    }
                }
            }
            out.scanned += 1;

            if event_name.is_some_and(|name| event.event_name != name) {
                continue;
            }
            if !window.contains(event.timestamp) {
                continue;
            }
            if !all_match(filters, |field| event.property(field)) {
                continue;
            }
            out.events.push(event);
        }

        if out.degraded {
            warn!(
                scanned = out.scanned,
                max_events = self.limits.max_events,
                "Event scan hit its limit; returning a partial aggregate"
            );
        }
        out
    }

    /// Evaluate an aggregate computed field over one profile's events.
    pub fn compute(
        &self,
        events: &[Event],
        config: &AggregateConfig,
        now: DateTime<Utc>,
    ) -> AggregateOutcome {
        let window = config.timeframe.resolve(now);
        let scan = self.scan(
            events,
            &window,
            config.event_name.as_deref(),
            &config.filters,
        );
        AggregateOutcome {
            value: reduce(
                config.operation,
                config.event_property.as_deref(),
                config.aggregate_by,
                &scan.events,
            ),
            scanned: scan.scanned,
            degraded: scan.degraded,
        }
    }
}

// ─── Reduction ──────────────────────────────────────────────────────────────

/// Reduce qualifying events to a scalar. Empty input yields 0 for
/// count/sum/count_unique and null for everything else.
pub fn reduce(
    operation: AggregateOperation,
    property: Option<&str>,
    aggregate_by: AggregateBy,
    events: &[&Event],
) -> Value {
    match operation {
        AggregateOperation::Count => {
            let count = match aggregate_by {
                AggregateBy::Total => events.len(),
                AggregateBy::Unique => events
                    .iter()
                    .map(|e| canonical_key(&dedup_value(e, property)))
                    .collect::<HashSet<_>>()
                    .len(),
            };
            Value::from(count as u64)
        }
        AggregateOperation::Sum => {
            let total: f64 = numbers(events, property, aggregate_by).iter().sum();
            number_value(total)
        }
        AggregateOperation::Mean => {
            let values = numbers(events, property, aggregate_by);
            if values.is_empty() {
                return Value::Null;
            }
            number_value(values.iter().sum::<f64>() / values.len() as f64)
        }
        AggregateOperation::Min => numbers(events, property, AggregateBy::Total)
            .into_iter()
            .reduce(f64::min)
            .map_or(Value::Null, number_value),
        AggregateOperation::Max => numbers(events, property, AggregateBy::Total)
            .into_iter()
            .reduce(f64::max)
            .map_or(Value::Null, number_value),
        AggregateOperation::CountUnique => {
            let distinct: HashSet<String> = present(events, property)
                .map(|(_, v)| canonical_key(v))
                .collect();
            Value::from(distinct.len() as u64)
        }
        AggregateOperation::FirstTouch => chronological(events, property)
            .first()
            .map_or(Value::Null, |(_, v)| (*v).clone()),
        AggregateOperation::LastTouch => chronological(events, property)
            .last()
            .map_or(Value::Null, |(_, v)| (*v).clone()),
        AggregateOperation::Top => top(events, property),
    }
}

/// Present property values paired with their event.
fn present<'a>(
    events: &'a [&'a Event],
    property: Option<&'a str>,
) -> impl Iterator<Item = (&'a Event, &'a Value)> + 'a {
    events.iter().filter_map(move |e| {
        let value = e.property(property?)?;
        (!is_absent(Some(value))).then_some((*e, value))
    })
}

/// Stable by timestamp, so equal timestamps keep arrival order.
fn chronological<'a>(events: &'a [&'a Event], property: Option<&'a str>) -> Vec<(&'a Event, &'a Value)> {
    let mut touched: Vec<_> = present(events, property).collect();
    touched.sort_by_key(|(e, _)| e.timestamp);
    touched
}

fn top(events: &[&Event], property: Option<&str>) -> Value {
    // key -> (count, first chronological position, value)
    let mut tally: HashMap<String, (usize, usize, &Value)> = HashMap::new();
    for (position, (_, value)) in chronological(events, property).into_iter().enumerate() {
        tally
            .entry(canonical_key(value))
            .and_modify(|slot| slot.0 += 1)
            .or_insert((1, position, value));
    }
    tally
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map_or(Value::Null, |(_, _, value)| value.clone())
}

fn numbers(events: &[&Event], property: Option<&str>, aggregate_by: AggregateBy) -> Vec<f64> {
    let mut seen = HashSet::new();
    present(events, property)
        .filter(|(_, v)| aggregate_by == AggregateBy::Total || seen.insert(canonical_key(v)))
        .filter_map(|(_, v)| as_number(v))
        .collect()
}

/// The value `aggregateBy=unique` collapses on: the property when one is
/// configured, otherwise the whole payload.
fn dedup_value(event: &Event, property: Option<&str>) -> Value {
    match property {
        Some(p) => event.property(p).cloned().unwrap_or(Value::Null),
        None => Value::Object(
            event
                .payload
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeframe::{TimeUnit, Timeframe};
    use crate::wire::ConstraintSpec;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn purchase(days_ago: i64, amount: Value) -> Event {
        Event::new("p1", "purchase", now() - ChronoDuration::days(days_ago))
            .with_property("amount", amount)
    }

    fn config(operation: AggregateOperation, property: Option<&str>) -> AggregateConfig {
        AggregateConfig {
            operation,
            timeframe: Timeframe::Relative {
                value: 30,
                unit: TimeUnit::Days,
            },
            event_name: Some("purchase".into()),
            event_property: property.map(String::from),
            aggregate_by: AggregateBy::Total,
            filters: vec![],
        }
    }

    fn run(events: &[Event], config: &AggregateConfig) -> Value {
        EventAggregator::default().compute(events, config, now()).value
    }

    #[test]
    fn test_sum_over_window() {
        let events = vec![
            purchase(2, json!(10)),
            purchase(5, json!(25)),
            purchase(45, json!(100)),
            Event::new("p1", "refund", now()).with_property("amount", json!(7)),
        ];
        assert_eq!(run(&events, &config(AggregateOperation::Sum, Some("amount"))), json!(35));
    }

    #[test]
    fn test_empty_inputs() {
        let events: Vec<Event> = vec![];
        assert_eq!(run(&events, &config(AggregateOperation::Count, None)), json!(0));
        assert_eq!(run(&events, &config(AggregateOperation::Sum, Some("amount"))), json!(0));
        assert_eq!(run(&events, &config(AggregateOperation::CountUnique, Some("amount"))), json!(0));
        for op in [
            AggregateOperation::Mean,
            AggregateOperation::Min,
            AggregateOperation::Max,
            AggregateOperation::FirstTouch,
            AggregateOperation::LastTouch,
            AggregateOperation::Top,
        ] {
            assert_eq!(run(&events, &config(op, Some("amount"))), Value::Null, "{op:?}");
        }
    }

    #[test]
    fn test_numeric_reductions_skip_missing() {
        let events = vec![
            purchase(1, json!(4)),
            purchase(2, json!("8")),
            Event::new("p1", "purchase", now() - ChronoDuration::days(3)),
            purchase(4, json!("n/a")),
        ];
        assert_eq!(run(&events, &config(AggregateOperation::Mean, Some("amount"))), json!(6));
        assert_eq!(run(&events, &config(AggregateOperation::Min, Some("amount"))), json!(4));
        assert_eq!(run(&events, &config(AggregateOperation::Max, Some("amount"))), json!(8));
        assert_eq!(run(&events, &config(AggregateOperation::Count, None)), json!(4));
    }

    #[test]
    fn test_touch_and_top() {
        let events = vec![
            purchase(3, json!("b")),
            purchase(9, json!("a")),
            purchase(1, json!("c")),
            purchase(5, json!("c")),
            purchase(7, json!("a")),
        ];
        assert_eq!(run(&events, &config(AggregateOperation::FirstTouch, Some("amount"))), json!("a"));
        assert_eq!(run(&events, &config(AggregateOperation::LastTouch, Some("amount"))), json!("c"));
        // "a" and "c" both occur twice; "a" occurs first chronologically.
        assert_eq!(run(&events, &config(AggregateOperation::Top, Some("amount"))), json!("a"));
        assert_eq!(run(&events, &config(AggregateOperation::CountUnique, Some("amount"))), json!(3));
    }

    #[test]
    fn test_touch_ties_keep_arrival_order() {
        let at = now() - ChronoDuration::hours(1);
        let events = vec![
            Event::new("p1", "purchase", at).with_property("sku", json!("first")),
            Event::new("p1", "purchase", at).with_property("sku", json!("second")),
        ];
        assert_eq!(run(&events, &config(AggregateOperation::FirstTouch, Some("sku"))), json!("first"));
        assert_eq!(run(&events, &config(AggregateOperation::LastTouch, Some("sku"))), json!("second"));
    }

    #[test]
    fn test_aggregate_by_unique() {
        let events = vec![
            purchase(1, json!(10)),
            purchase(2, json!(10)),
            purchase(3, json!(5)),
        ];
        let mut cfg = config(AggregateOperation::Sum, Some("amount"));
        cfg.aggregate_by = AggregateBy::Unique;
        assert_eq!(run(&events, &cfg), json!(15));

        let mut cfg = config(AggregateOperation::Count, Some("amount"));
        cfg.aggregate_by = AggregateBy::Unique;
        assert_eq!(run(&events, &cfg), json!(2));

        let mut cfg = config(AggregateOperation::Max, Some("amount"));
        cfg.aggregate_by = AggregateBy::Unique;
        assert_eq!(run(&events, &cfg), json!(10));
    }

    #[test]
    fn test_payload_filters_applied_before_reduction() {
        let events = vec![
            purchase(1, json!(10)).with_property("currency", json!("USD")),
            purchase(2, json!(99)).with_property("currency", json!("EUR")),
        ];
        let mut cfg = config(AggregateOperation::Sum, Some("amount"));
        cfg.filters = vec![Constraint::compile(&ConstraintSpec::new(
            "currency",
            "string",
            "is",
            vec![json!("usd")],
        ))
        .unwrap()];
        assert_eq!(run(&events, &cfg), json!(10));
    }

    #[test]
    fn test_scan_cap_degrades() {
        let events: Vec<Event> = (0..10).map(|i| purchase(1, json!(i))).collect();
        let aggregator = EventAggregator::new(ScanLimits {
            max_events: 4,
            time_budget: None,
        });
        let outcome = aggregator.compute(&events, &config(AggregateOperation::Sum, Some("amount")), now());
        assert!(outcome.degraded);
        assert_eq!(outcome.scanned, 4);
        assert_eq!(outcome.value, json!(6));

        let outcome = EventAggregator::default().compute(
            &events,
            &config(AggregateOperation::Count, None),
            now(),
        );
        assert!(!outcome.degraded);
        assert_eq!(outcome.value, json!(10));
    }

    #[test]
    fn test_time_budget_degrades() {
        let events: Vec<Event> = (0..1000).map(|_| purchase(1, json!(1))).collect();
        let aggregator = EventAggregator::new(ScanLimits {
            max_events: usize::MAX,
            time_budget: Some(Duration::ZERO),
        });
        let outcome = aggregator.compute(&events, &config(AggregateOperation::Sum, Some("amount")), now());
        assert!(outcome.degraded);
        assert_eq!(outcome.scanned, CLOCK_CHECK_INTERVAL);
        assert_eq!(outcome.value.as_f64(), Some(CLOCK_CHECK_INTERVAL as f64));

        let generous = EventAggregator::new(ScanLimits {
            max_events: usize::MAX,
            time_budget: Some(Duration::from_secs(60)),
        });
        let outcome = generous.compute(&events, &config(AggregateOperation::Count, None), now());
        assert!(!outcome.degraded);
        assert_eq!(outcome.scanned, 1000);
    }
}
