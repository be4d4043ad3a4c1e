//! Configuration loader and validator for the sync engine.
use crate::model::Operand;
use crate::platform::ErrorTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub platforms: Platforms,
    #[serde(default)]
    pub notify: Notify,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides `{data_dir}/adsync.db`; `DATABASE_URL` wins over both.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Store namespace every pass runs against.
    pub namespace: String,
}

/// Pass tuning. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub submit_delay_secs: u64,
    pub backoff_base_secs: u64,
    pub max_backoff_secs: u64,
    pub stuck_attempt_threshold: u32,
    pub max_poll_attempts: u32,
    /// Chunks submitted per account and pass.
    pub parallel_job_ceiling: usize,
    /// Accounts processed concurrently by a schedule pass.
    pub pass_concurrency: usize,
    /// Jobs polled concurrently by a check pass.
    pub poll_concurrency: usize,
    pub poll_batch_limit: usize,
    pub flush_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            submit_delay_secs: 30,
            backoff_base_secs: 30,
            max_backoff_secs: 3600,
            stuck_attempt_threshold: 5,
            max_poll_attempts: 48,
            parallel_job_ceiling: 4,
            pass_concurrency: 4,
            poll_concurrency: 4,
            poll_batch_limit: 100,
            flush_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platforms {
    #[serde(default)]
    pub microsoft: Option<MicrosoftConfig>,
    #[serde(default)]
    pub google: Option<GoogleConfig>,
}

/// Bulk-file (CSV upload) platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MicrosoftConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub base_url: String,
    pub developer_token: String,
    pub access_token: String,
    pub customer_id: String,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default)]
    pub chunk_sizes: BTreeMap<Operand, usize>,
    /// Layered over the built-in error table.
    #[serde(default)]
    pub errors: Option<ErrorTable>,
}

/// Batch-job (JSON) platform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoogleConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub base_url: String,
    pub api_version: String,
    pub developer_token: String,
    pub access_token: String,
    #[serde(default)]
    pub login_customer_id: Option<String>,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    #[serde(default)]
    pub chunk_sizes: BTreeMap<Operand, usize>,
    #[serde(default)]
    pub errors: Option<ErrorTable>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notify {
    /// Chat webhook receiving `{"text": ...}` posts.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn enabled() -> bool {
    true
}

fn default_min_request_interval_ms() -> u64 {
    1000
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match (self.data_dir.strip_prefix("~/"), std::env::var("HOME")) {
            (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
            _ => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL`, then `app.database_url`, then a file under the data dir.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/adsync.db", self.app.resolved_data_dir()))
    }

    pub fn microsoft(&self) -> Option<&MicrosoftConfig> {
        self.platforms.microsoft.as_ref().filter(|c| c.enabled)
    }

    pub fn google(&self) -> Option<&GoogleConfig> {
        self.platforms.google.as_ref().filter(|c| c.enabled)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if blank(&cfg.app.data_dir) {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if blank(&cfg.app.namespace) {
        return Err(ConfigError::Invalid("app.namespace must be non-empty"));
    }

    let e = &cfg.engine;
    if e.backoff_base_secs == 0 {
        return Err(ConfigError::Invalid("engine.backoff_base_secs must be > 0"));
    }
    if e.max_backoff_secs < e.backoff_base_secs {
        return Err(ConfigError::Invalid(
            "engine.max_backoff_secs must be >= engine.backoff_base_secs",
        ));
    }
    if e.stuck_attempt_threshold == 0 {
        return Err(ConfigError::Invalid("engine.stuck_attempt_threshold must be > 0"));
    }
    if e.max_poll_attempts < e.stuck_attempt_threshold {
        return Err(ConfigError::Invalid(
            "engine.max_poll_attempts must be >= engine.stuck_attempt_threshold",
        ));
    }
    if e.parallel_job_ceiling == 0 {
        return Err(ConfigError::Invalid("engine.parallel_job_ceiling must be > 0"));
    }
    if e.pass_concurrency == 0 || e.poll_concurrency == 0 {
        return Err(ConfigError::Invalid("engine concurrency limits must be > 0"));
    }
    if e.poll_batch_limit == 0 {
        return Err(ConfigError::Invalid("engine.poll_batch_limit must be > 0"));
    }
    if e.flush_batch_size == 0 {
        return Err(ConfigError::Invalid("engine.flush_batch_size must be > 0"));
    }

    if cfg.microsoft().is_none() && cfg.google().is_none() {
        return Err(ConfigError::Invalid("at least one platform must be enabled"));
    }
    if let Some(ms) = cfg.microsoft() {
        if blank(&ms.base_url) {
            return Err(ConfigError::Invalid("platforms.microsoft.base_url must be non-empty"));
        }
        if blank(&ms.developer_token) || blank(&ms.access_token) {
            return Err(ConfigError::Invalid("platforms.microsoft credentials must be non-empty"));
        }
        if blank(&ms.customer_id) {
            return Err(ConfigError::Invalid("platforms.microsoft.customer_id must be non-empty"));
        }
        if ms.chunk_sizes.values().any(|&n| n == 0) {
            return Err(ConfigError::Invalid("platforms.microsoft.chunk_sizes must be > 0"));
        }
    }
    if let Some(g) = cfg.google() {
        if blank(&g.base_url) || blank(&g.api_version) {
            return Err(ConfigError::Invalid(
                "platforms.google.base_url and api_version must be non-empty",
            ));
        }
        if blank(&g.developer_token) || blank(&g.access_token) {
            return Err(ConfigError::Invalid("platforms.google credentials must be non-empty"));
        }
        if g.chunk_sizes.values().any(|&n| n == 0) {
            return Err(ConfigError::Invalid("platforms.google.chunk_sizes must be > 0"));
        }
    }

    if let Some(url) = &cfg.notify.webhook_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid("notify.webhook_url must be an http(s) URL"));
        }
    }

    Ok(())
}

/// Returns the documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  namespace: "default"

engine:
  submit_delay_secs: 30
  backoff_base_secs: 30
  max_backoff_secs: 3600
  stuck_attempt_threshold: 5
  max_poll_attempts: 48
  parallel_job_ceiling: 4
  pass_concurrency: 4
  poll_concurrency: 4
  poll_batch_limit: 100
  flush_batch_size: 500

platforms:
  microsoft:
    base_url: "https://bulk.api.bingads.microsoft.com/Bulk/v13"
    developer_token: "YOUR_DEVELOPER_TOKEN"
    access_token: "YOUR_OAUTH_ACCESS_TOKEN"
    customer_id: "123456789"
    min_request_interval_ms: 1000
    chunk_sizes:
      keyword: 10000
    errors:
      permanent_codes: [1100, 1201, 1217]
  google:
    base_url: "https://googleads.googleapis.com"
    api_version: "v17"
    developer_token: "YOUR_DEVELOPER_TOKEN"
    access_token: "YOUR_OAUTH_ACCESS_TOKEN"
    login_customer_id: "1234567890"

notify:
  webhook_url: "https://hooks.example.com/services/T000/B000/XXXX"
"#
}
