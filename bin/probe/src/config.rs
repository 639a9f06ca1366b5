//! Probe configuration.
//!
//! Loaded via the `config` crate from an optional file, overridden by
//! environment variables prefixed `SWITCHBOARD` with `__` separators
//! (e.g. `SWITCHBOARD_TESTER__TIMEOUT_MS=5000`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use switchboard_integration::IntegrationConfig;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "SWITCHBOARD_CONFIG";
/// Configuration file used when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "switchboard.toml";

/// Probe configuration.
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    /// Integrations to register and check.
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,

    /// Health-check behavior.
    #[serde(default)]
    pub tester: TesterSettings,
}

/// Health-check timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TesterSettings {
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per integration before reporting failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts; attempt `n` waits `n` times this.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

impl Default for TesterSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl TesterSettings {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl ProbeConfig {
    /// Loads configuration from `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or environment values are invalid.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        Self::from_source(config::File::from(path).required(false))
    }

    fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .add_source(
                config::Environment::with_prefix("SWITCHBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
