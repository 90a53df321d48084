use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;
use std::convert::Infallible;
use thiserror::Error;

/// Attempts before a failing job is given up on.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Delay before a failed job is tried again (5 minutes).
pub fn default_retry_wait() -> Duration {
    Duration::minutes(5)
}

/// A job-handler interface, registered with [`JobRouter`](crate::runner::job_router::JobRouter)
/// under its job class.
///
/// ## Example
/// ```rust
/// use courier::runner::job_processor::JobProcessor;
/// use async_trait::async_trait;
/// use serde::Deserialize;
///
/// struct SendEmail;
///
/// #[derive(Deserialize)]
/// struct SendEmailArgs(String, String);
///
/// #[async_trait]
/// impl JobProcessor for SendEmail {
///     type Arguments = SendEmailArgs;
///     type Error = anyhow::Error;
///
///     fn job_class() -> &'static str {
///         "SendEmail"
///     }
///
///     async fn perform(&self, job_id: &str, arguments: Self::Arguments) -> Result<(), Self::Error> {
///         let SendEmailArgs(to, subject) = arguments;
///         tracing::info!(job_id, %to, %subject, "sending");
///         Ok(())
///     }
/// }
/// ```
///
/// ## Services
/// If your job processor requires external services (database client, REST client, etc.),
/// add them directly as struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The job's arguments, decoded from the descriptor's `arguments` field.
    type Arguments: Send;

    /// The error type returned by this job.
    type Error: Send + Into<JobError>;

    /// Class name the job framework writes into `job_class`.
    fn job_class() -> &'static str
    where
        Self: Sized;

    async fn perform(&self, job_id: &str, arguments: Self::Arguments) -> Result<(), Self::Error>;

    /// Total executions allowed before the job is moved to the morgue.
    ///
    /// Default: 3
    fn attempts(&self) -> u32 {
        DEFAULT_ATTEMPTS
    }

    /// Default: 5 minutes
    fn retry_wait(&self) -> Duration {
        default_retry_wait()
    }
}

/// Error types for job processing.
#[derive(Error, Debug)]
pub enum JobError {
    /// Failed to deserialize job arguments with context.
    #[error("Failed to deserialize arguments: {error}\nArguments sample: {arguments_sample}")]
    Deserialization {
        #[source]
        error: serde_json::Error,
        arguments_sample: String,
    },

    /// Error from job handler implementation.
    #[error("Job handler error: {0}")]
    HandlerError(#[source] anyhow::Error),
}

impl JobError {
    pub fn deserialization_error(error: serde_json::Error, arguments: &Value) -> Self {
        let arguments_sample = arguments.to_string().chars().take(500).collect();

        Self::Deserialization {
            error,
            arguments_sample,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::HandlerError(error)
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}
