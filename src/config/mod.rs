use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};
use crate::federation::{RetryPolicy, MAX_SESSION_DURATION};

pub const DEFAULT_CONFIG_FILE: &str = ".cloudaudit.toml";

/// Top-level configuration from `.cloudaudit.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Requested session lifetime. Capped at one hour.
    pub session_duration_secs: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Timeout of one trust-exchange call; an expired call is retried.
    pub attempt_timeout_secs: u64,
    pub external_id: Option<String>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            session_duration_secs: MAX_SESSION_DURATION.as_secs(),
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 2_000,
            attempt_timeout_secs: 10,
            external_id: None,
        }
    }
}

impl FederationConfig {
    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_secs).min(MAX_SESSION_DURATION)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-call limit for inventory collection and each checker.
    pub checker_timeout_secs: u64,
    pub max_concurrent_checkers: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            checker_timeout_secs: 30,
            max_concurrent_checkers: 8,
        }
    }
}

impl ExecutionConfig {
    pub fn checker_timeout(&self) -> Duration {
        Duration::from_secs(self.checker_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Events buffered per subscriber before new ones are dropped.
    pub subscriber_buffer: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Returns default if file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.federation.max_attempts == 0 {
            return Err(AuditError::Config(
                "federation.max_attempts must be at least 1".into(),
            ));
        }
        if self.federation.base_backoff_ms > self.federation.max_backoff_ms {
            return Err(AuditError::Config(
                "federation.base_backoff_ms exceeds federation.max_backoff_ms".into(),
            ));
        }
        if self.federation.attempt_timeout_secs == 0 {
            return Err(AuditError::Config(
                "federation.attempt_timeout_secs must be positive".into(),
            ));
        }
        if self.execution.checker_timeout_secs == 0 {
            return Err(AuditError::Config(
                "execution.checker_timeout_secs must be positive".into(),
            ));
        }
        if self.execution.max_concurrent_checkers == 0 {
            return Err(AuditError::Config(
                "execution.max_concurrent_checkers must be at least 1".into(),
            ));
        }
        if self.progress.subscriber_buffer == 0 {
            return Err(AuditError::Config(
                "progress.subscriber_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Generate a starter config file.
    pub fn starter_toml() -> &'static str {
        r#"# cloudaudit configuration

[federation]
# Session lifetime requested per inspection, in seconds (max 3600).
session_duration_secs = 3600
# Attempts for transient federation failures, with exponential backoff.
max_attempts = 3
base_backoff_ms = 200
max_backoff_ms = 2000
# Timeout of one trust-exchange call, in seconds.
attempt_timeout_secs = 10
# external_id = "your-external-id"

[execution]
# Per-call timeout for inventory collection and each checker.
checker_timeout_secs = 30
max_concurrent_checkers = 8

[progress]
# Events buffered per progress subscriber before new ones are dropped.
subscriber_buffer = 64
"#
    }
}
