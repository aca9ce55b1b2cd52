//! Engine configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial (or
//! empty) object is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use strum::{Display, EnumString};

const DEFAULT_RETRIES: u32 = 60;
const DEFAULT_INTERVAL_SECS: u64 = 3;

/// How forking tasks execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ForkMode {
    /// Run the child scheduler in a new OS process, fire-and-forget
    #[default]
    Process,
    /// Run the child scheduler to completion on the current thread
    Inline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fork_mode: ForkMode,
    /// Deep-copy vars for inline forks; process forks always isolate
    pub isolate_inline_forks: bool,
    /// Seconds between SIGTERM and SIGKILL when terminating branch processes
    pub shutdown_grace_secs: u64,
    pub polling: PollingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fork_mode: ForkMode::Process,
            isolate_inline_forks: false,
            shutdown_grace_secs: 5,
            polling: PollingConfig::default(),
        }
    }
}

/// Defaults for resource status polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Upper bound of the doubling delay in `wait_for_status`
    pub timeout_secs: u64,
    /// Sleeps allowed by `wait_for_status_with_retries`
    pub retries: i64,
    /// Seconds between checks in `wait_for_status_with_retries`
    pub interval_secs: i64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Fixed-interval polling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
        }
    }
}

impl PollingConfig {
    pub const DEFAULT: PollingConfig = PollingConfig {
        timeout_secs: 60,
        retries: DEFAULT_RETRIES as i64,
        interval_secs: DEFAULT_INTERVAL_SECS as i64,
    };

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry policy with non-positive values replaced by the defaults
    pub fn retry_policy(&self) -> RetryPolicy {
        let retries = if self.retries <= 0 {
            tracing::warn!(
                "Treating non-positive polling.retries {} as {}",
                self.retries,
                DEFAULT_RETRIES
            );
            DEFAULT_RETRIES
        } else {
            u32::try_from(self.retries).unwrap_or(u32::MAX)
        };
        let interval = if self.interval_secs <= 0 {
            tracing::warn!(
                "Treating non-positive polling.interval_secs {} as {}",
                self.interval_secs,
                DEFAULT_INTERVAL_SECS
            );
            DEFAULT_INTERVAL_SECS
        } else {
            self.interval_secs.unsigned_abs()
        };
        RetryPolicy {
            retries,
            interval: Duration::from_secs(interval),
        }
    }
}

impl EngineConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize engine configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load and validate configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.polling.timeout_secs == 0 {
            anyhow::bail!("polling.timeout_secs must be greater than zero");
        }
        if self.fork_mode == ForkMode::Process && self.isolate_inline_forks {
            tracing::debug!("isolate_inline_forks has no effect in process fork mode");
        }
        Ok(())
    }
}
