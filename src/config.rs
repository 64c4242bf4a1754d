//! Configuration loader and validator for the pickup sync client.
use reqwest::Url;
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

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub api: Api,
    #[serde(default)]
    pub health: Health,
    pub realtime: Realtime,
    #[serde(default)]
    pub notifications: Notifications,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Log connectivity transitions and sync results at info level.
    #[serde(default = "default_true")]
    pub announce_transitions: bool,
}

/// REST backend used for replaying queued requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Api {
    pub base_url: String,
    #[serde(default = "default_api_timeout_ms")]
    pub timeout_ms: u64,
}

/// Active reachability probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    /// Absolute URL, or a path joined onto `api.base_url`.
    #[serde(default)]
    pub url: Option<String>,
    /// Periodic probe interval; 0 disables the probe loop.
    #[serde(default)]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Require a successful probe before trusting a network "online" event.
    #[serde(default = "default_true")]
    pub verify_online: bool,
}

/// WebSocket notification channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Realtime {
    pub url: String,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_ms")]
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    #[serde(default = "default_feed_capacity")]
    pub feed_capacity: usize,
}

pub const DEFAULT_HEALTH_PATH: &str = "/api/health";

fn default_true() -> bool {
    true
}

fn default_api_timeout_ms() -> u64 {
    15_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_reconnect_ms() -> u64 {
    3_000
}

fn default_feed_capacity() -> usize {
    10
}

impl Default for Health {
    fn default() -> Self {
        Self {
            url: None,
            probe_interval_ms: 0,
            timeout_ms: default_probe_timeout_ms(),
            verify_online: true,
        }
    }
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            feed_capacity: default_feed_capacity(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// SQLite URL for the local store, honouring `DATABASE_URL` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/pickup-sync.db?mode=rwc",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn api_base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api.base_url).map_err(|_| ConfigError::Invalid("api.base_url must be a valid URL"))
    }

    /// Health endpoint, defaulting to `/api/health` on the API host.
    pub fn health_url(&self) -> Result<Url, ConfigError> {
        let base = self.api_base_url()?;
        let raw = self.health.url.as_deref().unwrap_or(DEFAULT_HEALTH_PATH);
        match Url::parse(raw) {
            Ok(url) => Ok(url),
            Err(_) => base
                .join(raw)
                .map_err(|_| ConfigError::Invalid("health.url must be a URL or path")),
        }
    }

    pub fn realtime_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.realtime.url).map_err(|_| ConfigError::Invalid("realtime.url must be a valid URL"))
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.health.probe_interval_ms > 0).then(|| Duration::from_millis(self.health.probe_interval_ms))
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
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    cfg.api_base_url()?;
    if cfg.api.timeout_ms == 0 {
        return Err(ConfigError::Invalid("api.timeout_ms must be > 0"));
    }

    cfg.health_url()?;
    if cfg.health.timeout_ms == 0 {
        return Err(ConfigError::Invalid("health.timeout_ms must be > 0"));
    }

    let ws = cfg.realtime_url()?;
    if !matches!(ws.scheme(), "ws" | "wss") {
        return Err(ConfigError::Invalid("realtime.url must use ws:// or wss://"));
    }
    if cfg.realtime.heartbeat_interval_ms == 0 {
        return Err(ConfigError::Invalid("realtime.heartbeat_interval_ms must be > 0"));
    }
    // reconnect_delay_ms of 0 is allowed: retry immediately.

    if cfg.notifications.feed_capacity == 0 {
        return Err(ConfigError::Invalid("notifications.feed_capacity must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  announce_transitions: true

api:
  base_url: "https://api.example.com/"
  timeout_ms: 15000

health:
  url: "/api/health"
  probe_interval_ms: 0
  timeout_ms: 5000
  verify_online: true

realtime:
  url: "wss://api.example.com"
  heartbeat_interval_ms: 30000
  reconnect_delay_ms: 3000

notifications:
  feed_capacity: 10
"#
}
