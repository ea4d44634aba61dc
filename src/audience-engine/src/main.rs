//! Audience Engine: evaluate segments, computed fields and reports against
//! a project fixture.

use anyhow::Context;
use audience_core::config::EngineConfig;
use audience_reporting::{export, ExportFormat, ExportMode, ReportSpec};
use audience_segmentation::SchemaRegistry;
use audience_service::{AudienceService, Fixture, InMemoryStore};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "audience-engine")]
#[command(about = "Segment, computed-field and report evaluation over profile event histories")]
#[command(version)]
struct Cli {
    /// Project fixture (definitions, profiles and events)
    #[arg(long, global = true, env = "AUDIENCE_FIXTURE")]
    fixture: Option<PathBuf>,

    /// Configuration file (environment variables still apply on top)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Evaluation worker threads (overrides config)
    #[arg(long, global = true, env = "AUDIENCE__EVALUATION__WORKER_THREADS")]
    worker_threads: Option<usize>,

    /// Event scan cap per aggregation (overrides config)
    #[arg(long, global = true, env = "AUDIENCE__EVALUATION__MAX_EVENTS_PER_SCAN")]
    max_events_per_scan: Option<usize>,

    /// Evaluate as of this instant instead of the wall clock (RFC 3339)
    #[arg(long, global = true)]
    now: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the fixture and print what it registered
    Validate,
    /// Evaluate one segment for every profile
    Sweep {
        /// Segment name or id
        #[arg(long)]
        segment: String,
    },
    /// Check a single profile's membership
    Matches {
        #[arg(long)]
        profile: String,
        /// Segment name or id
        #[arg(long)]
        segment: String,
    },
    /// Compute one field, or every field, for a profile
    Compute {
        #[arg(long)]
        profile: String,
        #[arg(long)]
        field: Option<String>,
    },
    /// Build a report from a JSON report definition
    Report {
        /// Report definition file
        #[arg(long)]
        spec: PathBuf,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// Emit unformatted values
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Csv => ExportFormat::Csv,
            OutputFormat::Json => ExportFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audience_engine=info,audience_service=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    if let Some(threads) = cli.worker_threads {
        config.evaluation.worker_threads = threads;
    }
    if let Some(max) = cli.max_events_per_scan {
        config.evaluation.max_events_per_scan = max;
    }

    let fixture_path = cli
        .fixture
        .clone()
        .context("--fixture (or AUDIENCE_FIXTURE) is required")?;
    let fixture = Fixture::from_path(&fixture_path)
        .with_context(|| format!("reading fixture {}", fixture_path.display()))?;

    let registry = Arc::new(SchemaRegistry::new());
    let store = Arc::new(InMemoryStore::new());
    let summary = fixture.apply(&registry, &store)?;
    let project = summary.project_id.clone();

    info!(
        node_id = %config.node_id,
        project = %project,
        worker_threads = config.evaluation.worker_threads,
        max_events_per_scan = config.evaluation.max_events_per_scan,
        "Audience engine starting"
    );

    let mut service = AudienceService::new(config, registry, store)?;
    if let Some(now) = cli.now {
        service = service.pinned_at(now);
    }
    let service = Arc::new(service);

    let output = match cli.command {
        Command::Validate => serde_json::to_string_pretty(&summary)?,
        Command::Sweep { segment } => {
            let segment_id = resolve_segment(&service, &project, &segment)?;
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling sweep");
                    on_signal.cancel();
                }
            });

            let worker = Arc::clone(&service);
            let report = tokio::task::spawn_blocking(move || {
                worker.sweep_segment(&project, segment_id, &cancel)
            })
            .await??;
            serde_json::to_string_pretty(&report)?
        }
        Command::Matches { profile, segment } => {
            let segment_id = resolve_segment(&service, &project, &segment)?;
            let outcome = service.matches(&project, &profile, segment_id)?;
            serde_json::to_string_pretty(&outcome)?
        }
        Command::Compute { profile, field } => match field {
            Some(field) => {
                serde_json::to_string_pretty(&service.compute_schema(&project, &profile, &field)?)?
            }
            None => serde_json::to_string_pretty(&service.compute_all(&project, &profile)?)?,
        },
        Command::Report { spec, format, raw } => {
            let raw_spec = std::fs::read_to_string(&spec)
                .with_context(|| format!("reading report definition {}", spec.display()))?;
            let spec: ReportSpec = serde_json::from_str(&raw_spec)?;
            let worker = Arc::clone(&service);
            let table = tokio::task::spawn_blocking(move || worker.build_report(&project, &spec))
                .await??;
            let mode = if raw { ExportMode::Raw } else { ExportMode::Formatted };
            export(&table, format.into(), mode)?
        }
    };

    println!("{output}");
    Ok(())
}

/// Accept either a segment id or its name.
fn resolve_segment(service: &AudienceService, project: &str, key: &str) -> anyhow::Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(key) {
        return Ok(id);
    }
    service
        .registry()
        .snapshot(project)
        .segment_by_name(key)
        .map(|segment| segment.id)
        .with_context(|| format!("no segment named '{key}' in project '{project}'"))
}
