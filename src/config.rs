use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::pipeline::executor::{CostModel, ExecutorSettings};
use crate::pipeline::render::DEFAULT_RENDER_DPI;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::router::RoutingPolicy;
use crate::pipeline::validation::Tolerance;

/// Application-level constants
pub const APP_NAME: &str = "report-extract";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
/// Platform data-local dir, or the working directory when none is known.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the default extraction cache directory
pub fn default_cache_dir() -> PathBuf {
    app_data_dir().join("cache")
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "report_extract=info"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Runtime configuration of the extraction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Part of every cache key; bump it when prompts or schemas change.
    pub schema_version: String,
    pub model_name: String,
    pub ollama_url: String,
    pub call_timeout_secs: u64,
    pub structure_timeout_secs: u64,
    pub max_concurrent_agents: usize,
    pub max_in_flight_calls: usize,
    pub repair_retries: u32,
    pub retry: RetryPolicy,
    pub routing: RoutingPolicy,
    pub tolerance: Tolerance,
    pub render_dpi: u32,
    pub topology_sample_pages: u32,
    pub cache_dir: Option<PathBuf>,
    /// Ignore persisted cache entries (fresh results are still written).
    pub cache_bust: bool,
    pub cost: CostModel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schema_version: "v1".to_string(),
            model_name: "qwen2.5vl:7b".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            call_timeout_secs: 180,
            structure_timeout_secs: 60,
            max_concurrent_agents: 4,
            max_in_flight_calls: 2,
            repair_retries: 2,
            retry: RetryPolicy::default(),
            routing: RoutingPolicy::default(),
            tolerance: Tolerance::default(),
            render_dpi: DEFAULT_RENDER_DPI,
            topology_sample_pages: 8,
            cache_dir: None,
            cache_bust: false,
            cost: CostModel::default(),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON config file, or defaults when no path is given.
    /// Missing keys take their default; out-of-range values are clamped.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?
            }
            None => Self::default(),
        };
        config.clamp();
        Ok(config)
    }

    fn clamp(&mut self) {
        if self.max_concurrent_agents == 0 {
            warn!("max_concurrent_agents must be at least 1, using 1");
            self.max_concurrent_agents = 1;
        }
        if self.max_in_flight_calls == 0 {
            warn!("max_in_flight_calls must be at least 1, using 1");
            self.max_in_flight_calls = 1;
        }
        if self.retry.max_attempts == 0 {
            warn!("retry.max_attempts must be at least 1, using 1");
            self.retry.max_attempts = 1;
        }
        if self.topology_sample_pages == 0 {
            warn!("topology_sample_pages must be at least 1, using 1");
            self.topology_sample_pages = 1;
        }
        if self.render_dpi == 0 {
            warn!(default = DEFAULT_RENDER_DPI, "render_dpi must be positive, using default");
            self.render_dpi = DEFAULT_RENDER_DPI;
        }

        let threshold = self.routing.acceptance_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            let clamped = if threshold.is_nan() { 0.5 } else { threshold.clamp(0.0, 1.0) };
            warn!(threshold, clamped, "routing.acceptance_threshold outside [0, 1]");
            self.routing.acceptance_threshold = clamped;
        }

        let similarity = self.tolerance.string_similarity;
        if !(0.0..=1.0).contains(&similarity) {
            let clamped = if similarity.is_nan() { 0.85 } else { similarity.clamp(0.0, 1.0) };
            warn!(similarity, clamped, "tolerance.string_similarity outside [0, 1]");
            self.tolerance.string_similarity = clamped;
        }
        if self.tolerance.relative.is_nan() || self.tolerance.relative < 0.0 {
            warn!(relative = self.tolerance.relative, "tolerance.relative must be non-negative, using 0");
            self.tolerance.relative = 0.0;
        }
        if self.tolerance.absolute_epsilon.is_nan() || self.tolerance.absolute_epsilon < 0.0 {
            warn!(
                absolute_epsilon = self.tolerance.absolute_epsilon,
                "tolerance.absolute_epsilon must be non-negative, using 0"
            );
            self.tolerance.absolute_epsilon = 0.0;
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn structure_timeout(&self) -> Duration {
        Duration::from_secs(self.structure_timeout_secs.max(1))
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            render_dpi: self.render_dpi,
            call_timeout: self.call_timeout(),
            repair_retries: self.repair_retries,
            retry: self.retry.clone(),
            cost: self.cost,
        }
    }
}
