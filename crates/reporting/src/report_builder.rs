//! Report builder: resolve property and people-metric columns per profile,
//! then sort and paginate the resulting table.

use audience_core::config::ReportingConfig;
use audience_core::value::{as_number, as_text};
use audience_core::{AudienceError, AudienceResult, DataType, Event, Profile};
use audience_segmentation::schema::AggregateConfig;
use audience_segmentation::wire::AggregateConfigSpec;
use audience_segmentation::{
    ComputedResolver, EventAggregator, SchemaSnapshot, SegmentDefinition, SegmentEvaluator,
};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

// ─── Wire types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnFormat {
    Number,
    Currency,
    Percentage,
    Duration,
    #[default]
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnSourceSpec {
    Property { property: String },
    PeopleMetric { metric: AggregateConfigSpec },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportColumnSpec {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(flatten)]
    pub source: ColumnSourceSpec,
    #[serde(default)]
    pub format: Option<ColumnFormat>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub column: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSpec {
    pub columns: Vec<ReportColumnSpec>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Restrict rows to members of this segment.
    #[serde(default)]
    pub segment_id: Option<Uuid>,
}

// ─── Compiled plan ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ColumnSource {
    Property(String),
    PeopleMetric(AggregateConfig),
}

#[derive(Debug, Clone)]
pub struct ReportColumn {
    pub key: String,
    pub label: String,
    pub source: ColumnSource,
    pub format: ColumnFormat,
    /// Sort numerically rather than lexicographically.
    pub numeric: bool,
}

impl ReportColumn {
    pub fn compile(spec: &ReportColumnSpec, snapshot: &SchemaSnapshot) -> AudienceResult<Self> {
        let key = spec.key.trim().to_string();
        if key.is_empty() {
            return Err(AudienceError::validation("report column key must not be empty"));
        }
        let (source, numeric, fallback) = match &spec.source {
            ColumnSourceSpec::Property { property } => {
                let data_type = snapshot.data_type_of(property);
                (
                    ColumnSource::Property(property.clone()),
                    data_type.is_some_and(|t| t.is_numeric()),
                    default_format(data_type),
                )
            }
            ColumnSourceSpec::PeopleMetric { metric } => {
                let config = AggregateConfig::compile(metric)?;
                let numeric = config.operation.is_numeric();
                let fallback = if numeric {
                    ColumnFormat::Number
                } else {
                    ColumnFormat::Text
                };
                (ColumnSource::PeopleMetric(config), numeric, fallback)
            }
        };
        let format = spec.format.unwrap_or(fallback);
        Ok(Self {
            label: spec.label.clone().unwrap_or_else(|| key.clone()),
            key,
            source,
            format,
            numeric,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReportPlan {
    pub columns: Vec<ReportColumn>,
    /// Index into `columns` plus direction.
    pub sort: Option<(usize, SortOrder)>,
    pub page: usize,
    pub page_size: usize,
    pub segment: Option<SegmentDefinition>,
}

impl ReportPlan {
    pub fn compile(
        spec: &ReportSpec,
        snapshot: &SchemaSnapshot,
        config: &ReportingConfig,
    ) -> AudienceResult<Self> {
        if spec.columns.is_empty() {
            return Err(AudienceError::validation("report needs at least one column"));
        }
        let columns = spec
            .columns
            .iter()
            .map(|c| ReportColumn::compile(c, snapshot))
            .collect::<AudienceResult<Vec<_>>>()?;

        let mut keys = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !keys.insert(c.key.as_str())) {
            return Err(AudienceError::validation(format!(
                "duplicate report column '{}'",
                dup.key
            )));
        }

        let sort = spec
            .sort
            .as_ref()
            .map(|s| {
                columns
                    .iter()
                    .position(|c| c.key == s.column)
                    .map(|idx| (idx, s.order))
                    .ok_or_else(|| {
                        AudienceError::validation(format!("unknown sort column '{}'", s.column))
                    })
            })
            .transpose()?;

        let segment = spec
            .segment_id
            .map(|id| {
                snapshot
                    .segment(&id)
                    .cloned()
                    .ok_or_else(|| AudienceError::NotFound(format!("segment '{id}'")))
            })
            .transpose()?;

        let max_page_size = config.max_page_size.max(1);
        Ok(Self {
            columns,
            sort,
            page: spec.page.unwrap_or(1).max(1),
            page_size: spec
                .page_size
                .unwrap_or(config.default_page_size)
                .clamp(1, max_page_size),
            segment,
        })
    }

    /// The one aggregate whose event name and timeframe bound every event
    /// this plan reads. `None` when any column or the segment needs the
    /// full history.
    pub fn event_scope(&self) -> Option<&AggregateConfig> {
        if self.segment.is_some() {
            return None;
        }
        let mut metrics = self.columns.iter().map(|c| match &c.source {
            ColumnSource::PeopleMetric(config) => Some(config),
            ColumnSource::Property(_) => None,
        });
        let first = metrics.next()??;
        metrics
            .all(|m| {
                m.is_some_and(|c| c.event_name == first.event_name && c.timeframe == first.timeframe)
            })
            .then_some(first)
    }
}

// ─── Output ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnHeader {
    pub key: String,
    pub label: String,
    pub format: ColumnFormat,
    pub numeric: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    pub profile_id: String,
    pub values: Vec<Value>,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page: usize,
    pub page_size: usize,
    pub total_rows: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTable {
    pub columns: Vec<ColumnHeader>,
    pub rows: Vec<ReportRow>,
    pub pagination: PageInfo,
    pub degraded: bool,
    pub generated_at: DateTime<Utc>,
}

/// One profile and its events, as fetched from storage.
#[derive(Debug, Clone, Copy)]
pub struct ProfileRow<'a> {
    pub profile: &'a Profile,
    pub events: &'a [Event],
}

// ─── Resolver ───────────────────────────────────────────────────────────────

pub struct ReportResolver<'a> {
    snapshot: &'a SchemaSnapshot,
    evaluator: &'a SegmentEvaluator,
    now: DateTime<Utc>,
}

impl<'a> ReportResolver<'a> {
    pub fn new(
        snapshot: &'a SchemaSnapshot,
        evaluator: &'a SegmentEvaluator,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            evaluator,
            now,
        }
    }

    fn aggregator(&self) -> &'a EventAggregator {
        self.evaluator.aggregator()
    }

    /// Resolve every profile in parallel, then sort and slice. `is_cancelled`
    /// is polled before each profile.
    pub fn resolve<F>(
        &self,
        profiles: &[ProfileRow<'_>],
        plan: &ReportPlan,
        is_cancelled: F,
    ) -> AudienceResult<ReportTable>
    where
        F: Fn() -> bool + Sync,
    {
        let resolved: Option<Vec<Option<ReportRow>>> = profiles
            .par_iter()
            .map(|row| (!is_cancelled()).then(|| self.resolve_row(row, plan)))
            .collect();
        let Some(resolved) = resolved else {
            info!(project = %self.snapshot.project_id(), "Report build cancelled");
            return Err(AudienceError::Cancelled);
        };

        let mut rows: Vec<ReportRow> = resolved.into_iter().flatten().collect();
        if let Some((idx, order)) = plan.sort {
            let numeric = plan.columns[idx].numeric;
            sort_rows(&mut rows, idx, order, numeric);
        }

        let degraded = rows.iter().any(|r| r.degraded);
        let total_rows = rows.len();
        let total_pages = total_rows.div_ceil(plan.page_size);
        let start = (plan.page - 1).saturating_mul(plan.page_size).min(total_rows);
        let end = start.saturating_add(plan.page_size).min(total_rows);
        let rows: Vec<ReportRow> = rows.drain(start..end).collect();

        debug!(
            project = %self.snapshot.project_id(),
            total_rows,
            page = plan.page,
            returned = rows.len(),
            degraded,
            "Report resolved"
        );

        Ok(ReportTable {
            columns: plan
                .columns
                .iter()
                .map(|c| ColumnHeader {
                    key: c.key.clone(),
                    label: c.label.clone(),
                    format: c.format,
                    numeric: c.numeric,
                })
                .collect(),
            rows,
            pagination: PageInfo {
                page: plan.page,
                page_size: plan.page_size,
                total_rows,
                total_pages,
            },
            degraded,
            generated_at: self.now,
        })
    }

    /// `None` when the plan is segment-restricted and the profile is not a
    /// member.
    fn resolve_row(&self, row: &ProfileRow<'_>, plan: &ReportPlan) -> Option<ReportRow> {
        let aggregator = self.aggregator();
        let mut resolver =
            ComputedResolver::new(self.snapshot, row.profile, row.events, aggregator, self.now);

        if let Some(segment) = &plan.segment {
            if !self.evaluator.evaluate_with(&mut resolver, segment).matched {
                return None;
            }
        }

        let values = plan
            .columns
            .iter()
            .map(|column| match &column.source {
                ColumnSource::Property(property) => resolver.resolve(property),
                ColumnSource::PeopleMetric(config) => {
                    let outcome = aggregator.compute(row.events, config, self.now);
                    if outcome.degraded {
                        resolver.mark_degraded();
                    }
                    outcome.value
                }
            })
            .collect();

        Some(ReportRow {
            profile_id: row.profile.id.clone(),
            values,
            degraded: resolver.is_degraded(),
        })
    }
}

/// Stable sort on one column. Nulls go last in both directions; equal
/// values fall back to profile id. A column without a numeric type still
/// sorts numerically when every non-null value coerces to a number.
pub fn sort_rows(rows: &mut [ReportRow], column: usize, order: SortOrder, numeric: bool) {
    let numeric = numeric
        || rows.iter().all(|row| match row.values.get(column) {
            None | Some(Value::Null) => true,
            Some(value) => as_number(value).is_some(),
        });
    rows.sort_by(|a, b| {
        let left = a.values.get(column).unwrap_or(&Value::Null);
        let right = b.values.get(column).unwrap_or(&Value::Null);
        let by_value = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            (false, false) => {
                let ord = compare_values(left, right, numeric);
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            }
        };
        by_value.then_with(|| a.profile_id.cmp(&b.profile_id))
    });
}

fn compare_values(left: &Value, right: &Value, numeric: bool) -> Ordering {
    if numeric {
        match (as_number(left), as_number(right)) {
            (Some(l), Some(r)) => return l.total_cmp(&r),
            // Numeric values before uncoercible ones.
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => {}
        }
    }
    as_text(left).cmp(&as_text(right))
}

/// Format for a property column declared without one.
pub fn default_format(data_type: Option<DataType>) -> ColumnFormat {
    match data_type {
        Some(DataType::Number) => ColumnFormat::Number,
        Some(DataType::Duration) => ColumnFormat::Duration,
        _ => ColumnFormat::Text,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
