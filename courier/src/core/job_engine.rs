use async_trait::async_trait;
use thiserror::Error;

use crate::core::job_descriptor::JobDescriptor;

/// The job-execution engine the executor hands descriptors to.
///
/// The engine owns the retry policy: transient failures are retried internally (usually by
/// re-enqueueing the job with a later `scheduled_at`) and only surface here once the retry
/// budget is exhausted. The executor never looks at job classes or arguments.
///
/// ## Example
/// ```rust
/// use async_trait::async_trait;
/// use courier::core::job_descriptor::JobDescriptor;
/// use courier::core::job_engine::{EngineError, JobEngine};
///
/// struct Noop;
///
/// #[async_trait]
/// impl JobEngine for Noop {
///     async fn run(&self, descriptor: &JobDescriptor) -> Result<(), EngineError> {
///         tracing::info!(job_id = %descriptor.job_id, "nothing to do");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobEngine: Send + Sync {
    async fn run(&self, descriptor: &JobDescriptor) -> Result<(), EngineError>;
}

/// Error types for job execution.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The job failed and will not be retried by the engine.
    #[error("Job {job_id} failed permanently: {source}")]
    PermanentFailure {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn permanent(job_id: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::PermanentFailure {
            job_id: job_id.into(),
            source: source.into(),
        }
    }
}
