use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tasks::IndexUpdate;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub tailer: TailerConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub search_index: Option<SearchIndexConfig>,
    #[serde(default)]
    pub vector_store: Option<VectorStoreConfig>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskOverride>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_max_body_bytes() -> usize {
    256 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Scheme and host of the dispatch server; the task's port is appended.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_get_timeout_secs")]
    pub get_timeout_secs: u64,
    #[serde(default = "default_finish_timeout_secs")]
    pub finish_timeout_secs: u64,
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_retry_ms")]
    pub empty_backoff_ms: u64,
    #[serde(default)]
    pub save_locally: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            get_timeout_secs: default_get_timeout_secs(),
            finish_timeout_secs: default_finish_timeout_secs(),
            retry_ms: default_retry_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            empty_backoff_ms: default_retry_ms(),
            save_locally: false,
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    20
}
fn default_get_timeout_secs() -> u64 {
    30
}
fn default_finish_timeout_secs() -> u64 {
    200
}
fn default_retry_ms() -> u64 {
    1000
}
fn default_idle_poll_ms() -> u64 {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Undispatched batches the queue may hold before the producer pauses.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// Unacknowledged batches before the producer sweeps instead of enqueuing.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_pending_retry_ms")]
    pub pending_retry_ms: u64,
    /// Preprocessing threads; defaults to `max(30, cores - 1)`.
    #[serde(default)]
    pub pool_size: Option<usize>,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_queued: default_max_queued(),
            max_pending: default_max_pending(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            pending_retry_ms: default_pending_retry_ms(),
            pool_size: None,
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl DispatchConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_max_queued() -> usize {
    10
}
fn default_max_pending() -> usize {
    50
}
fn default_stale_after_secs() -> u64 {
    120
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_pending_retry_ms() -> u64 {
    1000
}
fn default_progress_interval_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TailerConfig {
    /// Keep polling after EOF until the confirmation window closes.
    #[serde(default = "default_follow")]
    pub follow: bool,
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
    #[serde(default = "default_confirm_secs")]
    pub confirm_secs: u64,
    #[serde(default = "default_confirm_min_attempts")]
    pub confirm_min_attempts: u32,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self {
            follow: default_follow(),
            sleep_ms: default_sleep_ms(),
            confirm_secs: default_confirm_secs(),
            confirm_min_attempts: default_confirm_min_attempts(),
        }
    }
}

fn default_follow() -> bool {
    true
}
fn default_sleep_ms() -> u64 {
    1000
}
fn default_confirm_secs() -> u64 {
    60
}
fn default_confirm_min_attempts() -> u32 {
    5
}

/// How each record's image is turned into the bytes shipped to workers.
#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    /// Payload field holding the `data:image/...;base64,` URL.
    #[serde(default = "default_image_field")]
    pub field: String,
    /// Larger decoded payloads are dropped before decoding.
    #[serde(default = "default_max_image_bytes")]
    pub max_bytes: usize,
    /// Images are shrunk to fit a square of this side, never enlarged.
    #[serde(default = "default_thumbnail_px")]
    pub thumbnail_px: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            field: default_image_field(),
            max_bytes: default_max_image_bytes(),
            thumbnail_px: default_thumbnail_px(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_image_field() -> String {
    "img_data".to_string()
}
fn default_max_image_bytes() -> usize {
    32 * 1024 * 1024
}
fn default_thumbnail_px() -> u32 {
    300
}
fn default_jpeg_quality() -> u8 {
    75
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_root")]
    pub root: PathBuf,
    #[serde(default = "default_shard_len")]
    pub shard_len: usize,
    /// Reprocess records even when their output file already exists.
    #[serde(default)]
    pub force: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            shard_len: default_shard_len(),
            force: false,
        }
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./data/out")
}
fn default_shard_len() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchIndexConfig {
    /// Base URL of the search engine, e.g. `http://localhost:9200`.
    pub url: String,
    pub index: String,
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
    /// Write a placeholder for records skipped because their output exists.
    /// Applies to `index_update = "placeholder"` tasks only.
    #[serde(default)]
    pub mark_done_on_skip: bool,
}

fn default_index_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_initial_capacity_mb")]
    pub initial_capacity_mb: u64,
}

fn default_initial_capacity_mb() -> u64 {
    64
}

/// Per-task overrides of the built-in task table, or new task definitions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TaskOverride {
    pub port: Option<u16>,
    pub processor: Option<String>,
    pub field_name: Option<String>,
    pub index_update: Option<IndexUpdate>,
    pub vectors: Option<bool>,
}

impl Config {
    /// Defaults for running without a config file.
    pub fn minimal() -> Self {
        Self::default()
    }
}

/// Load the config at `path`, or [`Config::minimal`] when the file is absent.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        Ok(Config::minimal())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.dispatch.batch_size == 0 {
        anyhow::bail!("dispatch.batch_size must be > 0");
    }
    if config.dispatch.max_queued == 0 {
        anyhow::bail!("dispatch.max_queued must be > 0");
    }
    if config.dispatch.max_pending == 0 {
        anyhow::bail!("dispatch.max_pending must be > 0");
    }
    if config.dispatch.stale_after_secs == 0 {
        anyhow::bail!("dispatch.stale_after_secs must be > 0");
    }
    if config.dispatch.pool_size == Some(0) {
        anyhow::bail!("dispatch.pool_size must be > 0");
    }
    if config.preprocess.thumbnail_px == 0 {
        anyhow::bail!("preprocess.thumbnail_px must be > 0");
    }
    if !(1..=100).contains(&config.preprocess.jpeg_quality) {
        anyhow::bail!("preprocess.jpeg_quality must be in [1, 100]");
    }
    if !(1..=64).contains(&config.output.shard_len) {
        anyhow::bail!("output.shard_len must be in [1, 64]");
    }
    if config.tailer.confirm_min_attempts == 0 {
        anyhow::bail!("tailer.confirm_min_attempts must be > 0");
    }
    if let Some(store) = &config.vector_store {
        if store.initial_capacity_mb == 0 {
            anyhow::bail!("vector_store.initial_capacity_mb must be > 0");
        }
    }
    Ok(())
}
