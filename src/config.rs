//! Configuration loader and validator for the repost bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
    pub telegram: Telegram,
    pub instagram: Instagram,
    pub scheduler: Scheduler,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub tick_interval_ms: u64,
    pub max_concurrent_jobs: usize,
}

/// Telegram bot settings, used for outbound notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
}

/// Platform endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instagram {
    pub base_url: String,
    pub user_agent: String,
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Scheduling, retry and backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub min_interval_minutes: u32,
    pub default_interval_minutes: u32,
    pub max_interval_minutes: u32,
    pub fetch_limit: usize,
    pub transient_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_base_seconds: u64,
    pub max_backoff_seconds: u64,
    pub publish_delay_seconds: u64,
    pub restart_grace_seconds: u64,
    pub warn_after_failures: u32,
    #[serde(default)]
    pub auto_pause_after_failures: Option<u32>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Default SQLite URL inside the data directory.
    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/repostbot.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.app.tick_interval_ms)
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
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_ms must be > 0"));
    }
    if cfg.app.max_concurrent_jobs == 0 {
        return Err(ConfigError::Invalid("app.max_concurrent_jobs must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.instagram.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("instagram.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.instagram.base_url).is_err() {
        return Err(ConfigError::Invalid("instagram.base_url must be a valid URL"));
    }
    if cfg.instagram.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "instagram.request_timeout_seconds must be > 0",
        ));
    }

    let s = &cfg.scheduler;
    if s.min_interval_minutes == 0 {
        return Err(ConfigError::Invalid("scheduler.min_interval_minutes must be > 0"));
    }
    if s.max_interval_minutes < s.min_interval_minutes {
        return Err(ConfigError::Invalid(
            "scheduler.max_interval_minutes must be >= min_interval_minutes",
        ));
    }
    if s.default_interval_minutes < s.min_interval_minutes
        || s.default_interval_minutes > s.max_interval_minutes
    {
        return Err(ConfigError::Invalid(
            "scheduler.default_interval_minutes must lie within [min, max]",
        ));
    }
    if s.fetch_limit == 0 {
        return Err(ConfigError::Invalid("scheduler.fetch_limit must be > 0"));
    }
    if s.backoff_base_seconds == 0 {
        return Err(ConfigError::Invalid("scheduler.backoff_base_seconds must be > 0"));
    }
    if s.max_backoff_seconds < s.backoff_base_seconds {
        return Err(ConfigError::Invalid(
            "scheduler.max_backoff_seconds must be >= backoff_base_seconds",
        ));
    }
    if s.warn_after_failures == 0 {
        return Err(ConfigError::Invalid("scheduler.warn_after_failures must be > 0"));
    }
    if s.auto_pause_after_failures == Some(0) {
        return Err(ConfigError::Invalid(
            "scheduler.auto_pause_after_failures must be > 0 when set",
        ));
    }

    Ok(())
}

/// Example configuration, also used as the test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_ms: 1000
  max_concurrent_jobs: 4

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"

instagram:
  base_url: "https://i.instagram.com/api/v1/"
  user_agent: "ig-repostbot/0.1"
  request_timeout_seconds: 30
  proxy: null

scheduler:
  min_interval_minutes: 15
  default_interval_minutes: 60
  max_interval_minutes: 1440
  fetch_limit: 5
  transient_retries: 3
  retry_delay_ms: 2000
  backoff_base_seconds: 60
  max_backoff_seconds: 21600
  publish_delay_seconds: 5
  restart_grace_seconds: 10
  warn_after_failures: 3
  auto_pause_after_failures: null
"#
}
