//! Service configuration.
//!
//! Read from a TOML file (`DUPLEX_CONFIG`, default `duplex.toml`; a missing
//! file means defaults), then overridden by `SVC_*` environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "DUPLEX_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "duplex.toml";

/// Echo service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket listener port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Fallback log filter when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Heartbeat period in milliseconds.
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,

    /// Outbound write workers shared by all connections.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".into()
}

fn default_poll_period_ms() -> u64 {
    5000
}

fn default_workers() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            poll_period_ms: default_poll_period_ms(),
            workers: default_workers(),
        }
    }
}

impl Config {
    /// Loads the file named by `DUPLEX_CONFIG` and applies environment
    /// overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mut config = Self::from_file(Path::new(&path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Applies `SVC_*` overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(port) = lookup("SVC_PORT") {
            self.port = port.parse().context("SVC_PORT")?;
        }
        if let Some(level) = lookup("SVC_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(period) = lookup("SVC_POLL_PERIOD_MS") {
            self.poll_period_ms = period.parse().context("SVC_POLL_PERIOD_MS")?;
        }
        if let Some(workers) = lookup("SVC_WORKERS") {
            self.workers = workers.parse().context("SVC_WORKERS")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_period_ms == 0 {
            bail!("poll_period_ms must be greater than zero");
        }
        if self.workers == 0 {
            bail!("workers must be greater than zero");
        }
        Ok(())
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}
