//! Engine configuration
//!
//! Every field has a default, so an empty TOML document is a valid config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget handed to the workflow executor with every submission
///
/// `-1` means unlimited for both counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries per failed operation
    pub task_retries: i32,
    /// Seconds between operation retries
    pub task_retry_interval_secs: u64,
    /// Retries of a whole instance subgraph after its operation retries are exhausted
    pub subgraph_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            task_retries: 60,
            task_retry_interval_secs: 15,
            subgraph_retries: 0,
        }
    }
}

impl RetryPolicy {
    /// Marker for an unlimited retry counter
    pub const UNLIMITED: i32 = -1;

    #[inline]
    #[must_use]
    pub fn task_retry_interval(&self) -> Duration {
        Duration::from_secs(self.task_retry_interval_secs)
    }

    /// Whether another operation retry is allowed after `attempts` retries
    #[must_use]
    pub fn allows_task_retry(&self, attempts: u32) -> bool {
        allows(self.task_retries, attempts)
    }

    /// Whether another subgraph retry is allowed after `attempts` retries
    #[must_use]
    pub fn allows_subgraph_retry(&self, attempts: u32) -> bool {
        allows(self.subgraph_retries, attempts)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("task_retries", self.task_retries),
            ("subgraph_retries", self.subgraph_retries),
        ] {
            if value < Self::UNLIMITED {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be -1 or non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

fn allows(limit: i32, attempts: u32) -> bool {
    match u32::try_from(limit) {
        Ok(limit) => attempts < limit,
        Err(_) => limit == RetryPolicy::UNLIMITED,
    }
}

/// Retries of transient storage failures inside the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageRetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Base backoff, doubled per attempt
    pub backoff_ms: u64,
}

impl Default for StorageRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 50,
        }
    }
}

impl StorageRetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retry_policy: RetryPolicy,
    pub storage_retry: StorageRetryPolicy,
    /// Reinstall live instances of nodes whose properties or operations changed
    pub reinstall_on_modify: bool,
    /// Workflow name submitted to the executor
    pub update_workflow: String,
    /// Attach skeleton payloads to planned steps
    pub include_payloads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            storage_retry: StorageRetryPolicy::default(),
            reinstall_on_modify: true,
            update_workflow: "update".to_string(),
            include_payloads: true,
        }
    }
}

impl EngineConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns [`ConfigError`] on malformed TOML or out-of-range values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry_policy.validate()?;
        if self.storage_retry.attempts == 0 {
            return Err(ConfigError::Invalid(
                "storage_retry.attempts must be at least 1".to_string(),
            ));
        }
        if self.update_workflow.is_empty() {
            return Err(ConfigError::Invalid("update_workflow must not be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    #[must_use]
    pub fn with_storage_retry(mut self, storage_retry: StorageRetryPolicy) -> Self {
        self.storage_retry = storage_retry;
        self
    }

    #[must_use]
    pub fn with_reinstall_on_modify(mut self, reinstall: bool) -> Self {
        self.reinstall_on_modify = reinstall;
        self
    }

    #[must_use]
    pub fn with_update_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.update_workflow = workflow.into();
        self
    }

    #[must_use]
    pub fn with_payloads(mut self, include: bool) -> Self {
        self.include_payloads = include;
        self
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
