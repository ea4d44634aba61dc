//! Population sweep: evaluate one segment against every profile in a
//! project, in parallel, with cooperative cancellation.

use audience_core::{AudienceError, AudienceResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::service::AudienceService;
use crate::storage::EventQuery;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub project_id: String,
    pub segment_id: Uuid,
    pub segment_name: String,
    /// Profiles actually evaluated (fewer than the population when cancelled).
    pub evaluated: usize,
    pub members: Vec<String>,
    /// Profiles whose membership was decided on a capped scan.
    pub degraded: Vec<String>,
    /// Profiles whose events could not be read.
    pub failed: Vec<String>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

enum Verdict {
    Skipped,
    Failed,
    Evaluated { matched: bool, degraded: bool },
}

impl AudienceService {
    /// Evaluate `segment_id` for the whole population. Cancellation is
    /// checked before each profile; a cancelled sweep returns what it had
    /// evaluated so far with `cancelled` set.
    pub fn sweep_segment(
        &self,
        project_id: &str,
        segment_id: Uuid,
        cancel: &CancellationToken,
    ) -> AudienceResult<SweepReport> {
        let started = Instant::now();
        let snapshot = self.registry().snapshot(project_id);
        let segment = snapshot
            .segment(&segment_id)
            .ok_or_else(|| AudienceError::NotFound(format!("segment '{segment_id}'")))?;
        let profiles = self.store().profiles(project_id)?;
        let now = self.now();

        info!(
            project = %project_id,
            segment = %segment.name,
            population = profiles.len(),
            "Segment sweep started"
        );

        let verdicts: Vec<(String, Verdict)> = self.pool().install(|| {
            profiles
                .par_iter()
                .map(|profile| {
                    if cancel.is_cancelled() {
                        return (profile.id.clone(), Verdict::Skipped);
                    }
                    let events = match self
                        .store()
                        .events(project_id, &EventQuery::for_profile(profile.id.clone()))
                    {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(profile = %profile.id, error = %e, "Failed to load events");
                            return (profile.id.clone(), Verdict::Failed);
                        }
                    };
                    let outcome = self
                        .evaluator()
                        .evaluate(&snapshot, profile, &events, segment, now);
                    (
                        profile.id.clone(),
                        Verdict::Evaluated {
                            matched: outcome.matched,
                            degraded: outcome.degraded,
                        },
                    )
                })
                .collect()
        });

        let mut report = SweepReport {
            project_id: project_id.to_string(),
            segment_id,
            segment_name: segment.name.clone(),
            evaluated: 0,
            members: Vec::new(),
            degraded: Vec::new(),
            failed: Vec::new(),
            cancelled: cancel.is_cancelled(),
            elapsed_ms: 0,
        };
        for (profile_id, verdict) in verdicts {
            match verdict {
                Verdict::Skipped => report.cancelled = true,
                Verdict::Failed => report.failed.push(profile_id),
                Verdict::Evaluated { matched, degraded } => {
                    report.evaluated += 1;
                    if degraded {
                        report.degraded.push(profile_id.clone());
                    }
                    if matched {
                        report.members.push(profile_id);
                    }
                }
            }
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            project = %project_id,
            segment = %report.segment_name,
            evaluated = report.evaluated,
            members = report.members.len(),
            degraded = report.degraded.len(),
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed_ms,
            "Segment sweep finished"
        );
        Ok(report)
    }
}
