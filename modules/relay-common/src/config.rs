use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process configuration loaded from environment variables.
/// Holds secrets and deployment values; tuning lives in the TOML `FileConfig`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub config_path: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("PORT must be a number")?,
            config_path: std::env::var("RELAY_CONFIG").ok().map(PathBuf::from),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .collect(),
        };

        tracing::info!(
            port = config.port,
            config_path = ?config.config_path,
            allowed_origins = config.allowed_origins.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Load the TOML tuning file if one is configured, otherwise defaults.
    pub fn file_config(&self) -> Result<FileConfig> {
        match &self.config_path {
            Some(path) => load_config(path),
            None => Ok(FileConfig::default()),
        }
    }
}

/// TOML-backed tuning for the fan-out core. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub fanout: FanoutSettings,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    pub publisher: PublisherSettings,
    pub search: SearchSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanoutSettings {
    /// How long `apply` waits for secondary outcomes before returning.
    pub grace_period_ms: u64,
    /// Upper bound on concurrently running propagation tasks.
    pub max_in_flight: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 250,
            max_in_flight: 256,
        }
    }
}

impl FanoutSettings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            call_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitSettings {
    /// Failures inside `window_ms` that open the circuit.
    pub failure_threshold: usize,
    pub window_ms: u64,
    /// How long the circuit stays open once tripped.
    pub open_ms: u64,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            open_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherSettings {
    pub channel: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            channel: "user_events".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchSettings {
    /// Per-field byte limit of indexed terms.
    pub max_field_bytes: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_field_bytes: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    /// Entries older than this read as missing. `None` keeps them forever.
    pub ttl_secs: Option<u64>,
}

impl CacheSettings {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}
