//! Environment-driven configuration.
//!
//! Every component also has an options struct with sensible defaults, so loading from the
//! environment is optional. `CourierConfig` only gathers those settings in one place for
//! binaries that want to be configured through environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Variable holding the pub/sub project the queues live in.
pub const PROJECT_ID_VAR: &str = "PUBSUB_JOB_QUEUE_PROJECT_ID";

/// Project used when [`PROJECT_ID_VAR`] is not set.
pub const DEFAULT_PROJECT_ID: &str = "job_queue";

const ENV_PREFIX: &str = "COURIER_";

/// How the producer hands messages to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Wait for the broker to accept the message; failures are returned to the caller.
    Sync,
    /// Fire and forget; failures are only logged.
    #[default]
    Async,
}

/// Settings for the client, producer, executor and worker.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CourierConfig {
    #[serde(default = "default_project_id")]
    pub project_id: String,

    /// Ack deadline given to subscriptions created by this process.
    #[serde(default = "default_ack_deadline_seconds")]
    pub ack_deadline_seconds: u64,

    /// Upper bound on concurrently executing jobs. `None` means the available parallelism.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// How long a worker waits for its listener to stop.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    /// Pause after a failed pull before the listener tries again.
    #[serde(default = "default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,

    #[serde(default)]
    pub publish_mode: PublishMode,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            ack_deadline_seconds: default_ack_deadline_seconds(),
            max_concurrency: None,
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            error_backoff_seconds: default_error_backoff_seconds(),
            publish_mode: PublishMode::default(),
        }
    }
}

impl CourierConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let prefixed = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some(project_id) = lookup(PROJECT_ID_VAR).filter(|v| !v.trim().is_empty()) {
            config.project_id = project_id;
        }

        if let Some((key, value)) = prefixed("ACK_DEADLINE_SECONDS") {
            config.ack_deadline_seconds = parse(&key, &value)?;
        }

        if let Some((key, value)) = prefixed("MAX_CONCURRENCY") {
            let max: usize = parse(&key, &value)?;
            if max == 0 {
                return Err(ConfigError::invalid(&key, &value));
            }
            config.max_concurrency = Some(max);
        }

        if let Some((key, value)) = prefixed("SHUTDOWN_TIMEOUT_SECONDS") {
            config.shutdown_timeout_seconds = parse(&key, &value)?;
        }

        if let Some((key, value)) = prefixed("ERROR_BACKOFF_SECONDS") {
            config.error_backoff_seconds = parse(&key, &value)?;
        }

        if let Some((key, value)) = prefixed("PUBLISH_MODE") {
            config.publish_mode = match value.to_lowercase().as_str() {
                "sync" => PublishMode::Sync,
                "async" => PublishMode::Async,
                _ => return Err(ConfigError::invalid(&key, &value)),
            };
        }

        Ok(config)
    }

    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, value))
}

fn default_project_id() -> String {
    DEFAULT_PROJECT_ID.to_string()
}

fn default_ack_deadline_seconds() -> u64 {
    600
}

fn default_shutdown_timeout_seconds() -> u64 {
    10
}

fn default_error_backoff_seconds() -> u64 {
    5
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}
