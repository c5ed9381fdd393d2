//! Application configuration for enrichflow.
//!
//! User config lives at `~/.enrichflow/enrichflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "enrichflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".enrichflow";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "enrichflow.db";

// ---------------------------------------------------------------------------
// Config structs (matching enrichflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub enrichment: EnrichmentSection,

    #[serde(default)]
    pub sink: SinkSection,

    #[serde(default)]
    pub reconciler: ReconcilerSection,
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Database file. Defaults to `~/.enrichflow/enrichflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Buffered change events before a slow subscriber starts lagging.
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: None,
            change_feed_capacity: default_change_feed_capacity(),
        }
    }
}

fn default_change_feed_capacity() -> usize {
    1024
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Messages pulled per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Messages processed in parallel within one batch.
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,

    /// Sleep between empty polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Deliveries before a message is dead-lettered.
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_queue_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_receive_count: default_max_receive_count(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_queue_concurrency() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_receive_count() -> u32 {
    5
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentSection {
    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Per-attempt timeout.
    #[serde(default = "default_enrichment_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_enrichment_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_enrichment_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Records enriched concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Times a change event is redelivered after a store write failure.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

impl Default for EnrichmentSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_enrichment_timeout(),
            max_attempts: default_enrichment_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_enrichment_max_delay_ms(),
            workers: default_workers(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

fn default_endpoint() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_enrichment_timeout() -> u64 {
    240
}
fn default_enrichment_attempts() -> u32 {
    10
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_enrichment_max_delay_ms() -> u64 {
    60_000
}
fn default_workers() -> usize {
    4
}
fn default_max_deliveries() -> u32 {
    3
}

/// `[sink]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSection {
    /// Status webhook. Reconciliation is disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_sink_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_sink_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_sink_timeout(),
            max_attempts: default_sink_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_sink_max_delay_ms(),
        }
    }
}

fn default_sink_timeout() -> u64 {
    15
}
fn default_sink_attempts() -> u32 {
    3
}
fn default_sink_max_delay_ms() -> u64 {
    8_000
}

/// `[reconciler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSection {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Records pushed per chunk during a sweep.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pause between chunks, to respect the sink's rate limits.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,

    /// A sweep stops starting new chunks after this long.
    #[serde(default = "default_sweep_budget")]
    pub sweep_budget_secs: u64,

    /// Bounded depth of the worker → reconciler hand-off channel.
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,

    /// Maximum characters of error detail sent to the sink.
    #[serde(default = "default_error_summary_len")]
    pub error_summary_len: usize,

    /// INGESTED records older than this are redriven by the sweep.
    #[serde(default = "default_stale_ingest_after")]
    pub stale_ingest_after_secs: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            sweep_budget_secs: default_sweep_budget(),
            handoff_capacity: default_handoff_capacity(),
            error_summary_len: default_error_summary_len(),
            stale_ingest_after_secs: default_stale_ingest_after(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}
fn default_chunk_size() -> usize {
    25
}
fn default_chunk_delay_ms() -> u64 {
    1000
}
fn default_sweep_budget() -> u64 {
    60
}
fn default_handoff_capacity() -> usize {
    256
}
fn default_error_summary_len() -> usize {
    500
}
fn default_stale_ingest_after() -> u64 {
    900
}

impl AppConfig {
    /// Reject values that would make the pipeline misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.enrichment.endpoint).map_err(|e| {
            PipelineError::config(format!(
                "invalid enrichment.endpoint {:?}: {e}",
                self.enrichment.endpoint
            ))
        })?;

        if let Some(url) = &self.sink.url {
            Url::parse(url)
                .map_err(|e| PipelineError::config(format!("invalid sink.url {url:?}: {e}")))?;
        }

        let positive = [
            ("queue.batch_size", self.queue.batch_size),
            ("queue.concurrency", self.queue.concurrency),
            ("enrichment.max_attempts", self.enrichment.max_attempts as usize),
            ("enrichment.workers", self.enrichment.workers),
            ("enrichment.max_deliveries", self.enrichment.max_deliveries as usize),
            ("sink.max_attempts", self.sink.max_attempts as usize),
            ("reconciler.chunk_size", self.reconciler.chunk_size),
            ("reconciler.handoff_capacity", self.reconciler.handoff_capacity),
            ("store.change_feed_capacity", self.store.change_feed_capacity),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(PipelineError::config(format!("{name} must be at least 1")));
            }
        }

        Ok(())
    }

    /// Resolved database path.
    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(config_dir()?.join(DB_FILE_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.enrichflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.enrichflow/enrichflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PipelineError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the enrichment API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.enrichment.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(PipelineError::config(format!(
            "enrichment API key not found. Set the {var_name} environment variable."
        ))),
    }
}
