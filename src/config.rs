//! Configuration loader and validator for the marketplace sale-event tap.
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::{PaginationMode, SchemaVersion};
use crate::retry::RetryPolicy;

pub const DEFAULT_API_URL: &str = "https://api.opensea.io/api/v2";
pub const DEFAULT_COLLECTIONS: &str = "dcl-names";

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
    #[serde(default)]
    pub app: App,
    pub api: Api,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub retry: Retry,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct App {
    pub data_dir: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
        }
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Marketplace API access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub auth_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub schema_version: SchemaVersion,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// What to sync and how to page through it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncOptions {
    #[serde(default = "default_collections")]
    pub collections: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub pagination: PaginationMode,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages_per_partition: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            collections: default_collections(),
            start_date: None,
            pagination: PaginationMode::default(),
            page_size: default_page_size(),
            window_days: default_window_days(),
            max_pages_per_partition: default_max_pages(),
        }
    }
}

/// Backoff settings for the HTTP layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Retry {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_seconds: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            base_delay_ms: 500,
            max_delay_seconds: 60,
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.into()
}

fn default_collections() -> String {
    DEFAULT_COLLECTIONS.into()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_page_size() -> u32 {
    300
}

fn default_window_days() -> u32 {
    30
}

fn default_max_pages() -> u32 {
    100_000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Parsed `sync.start_date`. Validation guarantees it parses when set.
    pub fn start_date(&self) -> Option<NaiveDate> {
        self.sync
            .start_date
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_secs(self.retry.max_delay_seconds),
        )
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

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.api.auth_token.trim().is_empty() {
        return Err(ConfigError::Invalid("api.auth_token must be non-empty"));
    }
    if reqwest::Url::parse(cfg.api.api_url.trim()).is_err() {
        return Err(ConfigError::Invalid("api.api_url must be an absolute URL"));
    }
    if cfg.api.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("api.request_timeout_seconds must be > 0"));
    }

    if cfg.sync.collections.split(',').all(|c| c.trim().is_empty()) {
        return Err(ConfigError::Invalid(
            "sync.collections must name at least one collection",
        ));
    }
    if let Some(start) = cfg.sync.start_date.as_deref() {
        if NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d").is_err() {
            return Err(ConfigError::Invalid("sync.start_date must be YYYY-MM-DD"));
        }
    }
    if cfg.sync.page_size == 0 {
        return Err(ConfigError::Invalid("sync.page_size must be > 0"));
    }
    if cfg.sync.window_days == 0 {
        return Err(ConfigError::Invalid("sync.window_days must be > 0"));
    }
    if cfg.sync.max_pages_per_partition == 0 {
        return Err(ConfigError::Invalid(
            "sync.max_pages_per_partition must be > 0",
        ));
    }

    if cfg.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
    }
    // max_delay_seconds == 0 disables the cap rather than the delay

    Ok(())
}

/// Returns a documented example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

api:
  auth_token: "YOUR_OPENSEA_API_KEY"
  api_url: "https://api.opensea.io/api/v2"
  schema_version: v2
  request_timeout_seconds: 60

sync:
  # comma separated collection slugs, one partition each
  collections: "dcl-names,boredapeyachtclub"
  start_date: "2023-12-10"
  # cursor: opaque `next` cursor + watermark (v2 API)
  # window: offset paging inside 30-day windows (v1 API)
  pagination: cursor
  page_size: 300
  window_days: 30

retry:
  max_attempts: 20
  base_delay_ms: 500
  max_delay_seconds: 60
"#
}
