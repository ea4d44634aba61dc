use serde::Deserialize;

use crate::error::AudienceResult;

/// Root engine configuration. Loaded from environment variables with the
/// prefix `AUDIENCE__` and an optional TOML/JSON config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// Upper bound on events scanned by a single aggregation call.
    #[serde(default = "default_max_events_per_scan")]
    pub max_events_per_scan: usize,
    /// Wall-clock budget for a single aggregation call. Zero disables it.
    #[serde(default = "default_scan_time_budget_ms")]
    pub scan_time_budget_ms: u64,
    /// Worker threads for per-profile fan-out. Zero uses one per core.
    #[serde(default)]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

// Default functions
fn default_node_id() -> String {
    "audience-01".to_string()
}
fn default_max_events_per_scan() -> usize {
    100_000
}
fn default_scan_time_budget_ms() -> u64 {
    250
}
fn default_page_size() -> usize {
    50
}
fn default_max_page_size() -> usize {
    1_000
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_events_per_scan: default_max_events_per_scan(),
            scan_time_budget_ms: default_scan_time_budget_ms(),
            worker_threads: 0,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            evaluation: EvaluationConfig::default(),
            reporting: ReportingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> AudienceResult<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an optional file, then overlay environment
    /// variables (`AUDIENCE__EVALUATION__MAX_EVENTS_PER_SCAN=5000`).
    pub fn load_from(path: Option<&str>) -> AudienceResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AUDIENCE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }
}
