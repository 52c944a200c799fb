//! Configuration loading, validation, and management for TaskMind.
//!
//! Loads configuration from `~/.taskmind/config.toml` with environment
//! variable overrides. Validates all settings at startup.
//!
//! Every threshold the engine relies on (session caps, retrieval depth,
//! token budget, retry budgets) lives here as an explicit, documented value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.taskmind/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where the memory index and task database live (default `~/.taskmind/data`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Short-term session memory
    #[serde(default)]
    pub session: SessionConfig,

    /// Long-term vector memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Context assembly
    #[serde(default)]
    pub context: ContextConfig,

    /// Task detection pipeline
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Ticket sequencer
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Language model and embedding provider
    #[serde(default)]
    pub provider: ProviderConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Turns kept per session; older turns are evicted first
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Sliding expiry, refreshed on every append
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Turns older than this are evicted even if under the count cap
    #[serde(default = "default_max_turn_age")]
    pub max_turn_age_secs: u64,

    /// Refresh the rolling session summary after this many new turns (0 disables)
    #[serde(default = "default_summary_every")]
    pub summary_every: usize,
}

fn default_max_turns() -> usize {
    20
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_max_turn_age() -> u64 {
    86_400
}
fn default_summary_every() -> usize {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            ttl_secs: default_session_ttl(),
            max_turn_age_secs: default_max_turn_age(),
            summary_every: default_summary_every(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        bounded_secs(self.ttl_secs)
    }

    pub fn max_turn_age(&self) -> Duration {
        bounded_secs(self.max_turn_age_secs)
    }
}

/// Upper bound for every duration setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_DURATION_SECS))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Long-term matches retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Cosine similarity below which matches are ignored
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Automatic snapshot after this many upserts (0 disables)
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: usize,

    /// Rewrite the log right after a user is erased
    #[serde(default = "default_true")]
    pub compact_on_erase: bool,

    /// Dimension of the local hashing embedder
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.2
}
fn default_snapshot_every() -> usize {
    64
}
fn default_embedding_dimension() -> usize {
    256
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            snapshot_every: default_snapshot_every(),
            compact_on_erase: true,
            embedding_dimension: default_embedding_dimension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Default token budget for an assembled context
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Memory index calls slower than this degrade to session-only context
    #[serde(default = "default_index_timeout")]
    pub index_timeout_ms: u64,
}

fn default_token_budget() -> usize {
    3000
}
fn default_index_timeout() -> u64 {
    1500
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            index_timeout_ms: default_index_timeout(),
        }
    }
}

impl ContextConfig {
    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_model_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_delay_ms: 250,
        max_delay_ms: 8_000,
        multiplier: default_multiplier(),
    }
}

fn default_sequencer_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 20,
        max_delay_ms: 1_000,
        multiplier: default_multiplier(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-call timeout for the extraction model call
    #[serde(default = "default_model_timeout")]
    pub model_timeout_secs: u64,

    /// Messages analyzed concurrently within a batch
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Messages received longer ago than this are discarded as stale (0 disables)
    #[serde(default = "default_max_message_age")]
    pub max_message_age_secs: u64,

    /// Backoff for transient model failures
    #[serde(default = "default_model_retry")]
    pub retry: RetryConfig,
}

fn default_model_timeout() -> u64 {
    30
}
fn default_max_concurrency() -> usize {
    3
}
fn default_max_message_age() -> u64 {
    10 * 60 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: default_model_timeout(),
            max_concurrency: default_max_concurrency(),
            max_message_age_secs: default_max_message_age(),
            retry: default_model_retry(),
        }
    }
}

impl PipelineConfig {
    pub fn model_timeout(&self) -> Duration {
        bounded_secs(self.model_timeout_secs)
    }

    /// `None` when the stale filter is disabled.
    pub fn max_message_age(&self) -> Option<Duration> {
        (self.max_message_age_secs > 0).then(|| bounded_secs(self.max_message_age_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Width of the zero-padded ticket id
    #[serde(default = "default_ticket_width")]
    pub width: usize,

    /// Backoff for counter contention
    #[serde(default = "default_sequencer_retry")]
    pub retry: RetryConfig,
}

fn default_ticket_width() -> usize {
    6
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            width: default_ticket_width(),
            retry: default_sequencer_retry(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key for the OpenAI-compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// "hashing" (local, deterministic) or "remote"
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Temperature for chat replies
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-call timeout for chat replies
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_provider() -> String {
    "hashing".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_chat_timeout() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            model: default_model(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            chat_timeout_secs: default_chat_timeout(),
        }
    }
}

impl ProviderConfig {
    pub fn chat_timeout(&self) -> Duration {
        bounded_secs(self.chat_timeout_secs)
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("embedding_provider", &self.embedding_provider)
            .field("embedding_model", &self.embedding_model)
            .field("temperature", &self.temperature)
            .field("chat_timeout_secs", &self.chat_timeout_secs)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.taskmind/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `TASKMIND_API_KEY`, then `OPENAI_API_KEY`
    /// - `TASKMIND_API_URL`
    /// - `TASKMIND_MODEL`
    /// - `TASKMIND_DATA_DIR`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup` (injected for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup("TASKMIND_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = lookup("TASKMIND_API_URL") {
            self.provider.api_url = url;
        }
        if let Some(model) = lookup("TASKMIND_MODEL") {
            self.provider.model = model;
        }
        if let Some(dir) = lookup("TASKMIND_DATA_DIR") {
            self.data_dir = Some(dir);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".taskmind")
    }

    /// Directory holding the memory index and the task database.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Directory of the vector memory log and snapshot.
    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir().join("memory")
    }

    /// SQLite database holding tasks and the ticket counter.
    pub fn tasks_db_path(&self) -> PathBuf {
        self.data_dir().join("tasks.sqlite")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_turns must be at least 1".into(),
            ));
        }
        if self.session.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.ttl_secs must be > 0".into(),
            ));
        }
        if !(-1.0..=1.0).contains(&self.memory.min_score) {
            return Err(ConfigError::ValidationError(
                "memory.min_score must be between -1.0 and 1.0".into(),
            ));
        }
        if self.memory.embedding_dimension == 0 {
            return Err(ConfigError::ValidationError(
                "memory.embedding_dimension must be > 0".into(),
            ));
        }
        if self.context.token_budget == 0 {
            return Err(ConfigError::ValidationError(
                "context.token_budget must be > 0".into(),
            ));
        }
        if self.pipeline.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "pipeline.max_concurrency must be at least 1".into(),
            ));
        }
        if !(1..=18).contains(&self.sequencer.width) {
            return Err(ConfigError::ValidationError(
                "sequencer.width must be between 1 and 18".into(),
            ));
        }
        for (name, secs) in [
            ("session.ttl_secs", self.session.ttl_secs),
            ("session.max_turn_age_secs", self.session.max_turn_age_secs),
            ("context.index_timeout_ms", self.context.index_timeout_ms / 1000),
            ("pipeline.model_timeout_secs", self.pipeline.model_timeout_secs),
            ("pipeline.max_message_age_secs", self.pipeline.max_message_age_secs),
            ("provider.chat_timeout_secs", self.provider.chat_timeout_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "{name} must be at most {MAX_DURATION_SECS} seconds"
                )));
            }
        }
        for (name, retry) in [("pipeline.retry", &self.pipeline.retry), ("sequencer.retry", &self.sequencer.retry)] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
            if retry.multiplier < 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.multiplier must be >= 1.0"
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !matches!(self.provider.embedding_provider.as_str(), "hashing" | "remote") {
            return Err(ConfigError::ValidationError(format!(
                "provider.embedding_provider must be \"hashing\" or \"remote\", got \"{}\"",
                self.provider.embedding_provider
            )));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
