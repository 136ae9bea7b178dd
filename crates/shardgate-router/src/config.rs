use serde::{Deserialize, Serialize};
use shardgate_common::protocol::error::{Result, ShardgateError};
use std::path::Path;
use std::time::Duration;

/// Retry policy for commands that hit a stale topology.
///
/// Only the command path retries; queries and get-mores hand staleness back
/// to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRetryConfig {
    /// Total attempts, including the first one.
    ///
    /// A forced topology refresh runs before every attempt but the first,
    /// so `max_attempts - 1` refreshes happen before the final failure.
    /// Default: 5
    pub max_attempts: usize,
}

impl Default for CommandRetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Merged-cursor batching and reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Documents in a first batch when the client did not ask for a size.
    /// Default: 101
    pub default_batch_size: usize,
    /// Approximate serialized size at which a batch is cut short.
    /// Later batches may use three times this. Default: 1 MiB
    pub max_batch_bytes: usize,
    /// Merged cursors untouched for this long are reclaimed.
    /// Default: 10 minutes
    pub idle_timeout_ms: u64,
    /// How often the reaper looks for idle cursors. Default: 60 s
    pub reap_interval_ms: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 101,
            max_batch_bytes: 1024 * 1024,
            idle_timeout_ms: 10 * 60 * 1000,
            reap_interval_ms: 60 * 1000,
        }
    }
}

impl CursorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Router configuration.
///
/// Loaded from a JSON file or built from defaults; every field is optional
/// in the file.
///
/// # Example
///
/// ```
/// use shardgate_router::RouterConfig;
///
/// let config = RouterConfig::default()
///     .with_max_command_attempts(3)
///     .with_default_batch_size(50);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.cursors.default_batch_size, 50);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub command_retry: CommandRetryConfig,
    pub cursors: CursorConfig,
}

impl RouterConfig {
    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: RouterConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_retry.max_attempts == 0 {
            return Err(ShardgateError::Config(
                "command_retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.cursors.default_batch_size == 0 {
            return Err(ShardgateError::Config(
                "cursors.default_batch_size must be at least 1".into(),
            ));
        }
        if self.cursors.max_batch_bytes == 0 {
            return Err(ShardgateError::Config(
                "cursors.max_batch_bytes must be at least 1".into(),
            ));
        }
        if self.cursors.reap_interval_ms == 0 {
            return Err(ShardgateError::Config(
                "cursors.reap_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn with_max_command_attempts(mut self, max_attempts: usize) -> Self {
        self.command_retry.max_attempts = max_attempts;
        self
    }

    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.cursors.default_batch_size = size;
        self
    }

    pub fn with_max_batch_bytes(mut self, bytes: usize) -> Self {
        self.cursors.max_batch_bytes = bytes;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cursors.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.cursors.reap_interval_ms = interval.as_millis() as u64;
        self
    }
}
