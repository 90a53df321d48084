use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{instrument, warn};

use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job_descriptor::JobDescriptor;
use crate::core::job_engine::{EngineError, JobEngine};
use crate::core::transport::Transport;
use crate::runner::enqueue::{Enqueue, EnqueueError, EnqueueOptions};
use crate::runner::job_processor::JobProcessor;

/// A job processor router and the reference [`JobEngine`]. Matches `job_class` to a
/// [`JobProcessor`] and applies its retry policy.
///
/// Every run increments the descriptor's `executions`. A failed run also increments
/// `exception_executions[<job class>]`; while `executions` is below the processor's
/// `attempts()`, the updated descriptor is re-enqueued `retry_wait()` from now and the failure
/// is absorbed. After that the failure is reported as [`EngineError::PermanentFailure`] and the
/// executor moves the job to the morgue.
///
/// ## Example
/// ```rust
/// use courier::core::client::{Client, ClientConfig};
/// use courier::core::transport::Transport;
/// use courier::runner::enqueue::Enqueue;
/// use courier::runner::job_processor::JobProcessor;
/// use courier::runner::job_router::JobRouter;
/// use async_trait::async_trait;
///
/// struct Cleanup;
///
/// #[async_trait]
/// impl JobProcessor for Cleanup {
///     type Arguments = Vec<String>;
///     type Error = anyhow::Error;
///
///     fn job_class() -> &'static str {
///         "Cleanup"
///     }
///
///     async fn perform(&self, _job_id: &str, paths: Vec<String>) -> anyhow::Result<()> {
///         tracing::info!(?paths, "cleaning up");
///         Ok(())
///     }
/// }
///
/// fn router<T: Transport>(client: Client<T>) -> JobRouter<T> {
///     let mut r = JobRouter::new(Enqueue::new(client));
///     r.add_job_handler(Cleanup);
///     r
/// }
/// ```
pub struct JobRouter<T: Transport> {
    jobs: HashMap<&'static str, BoxedJobHandler>,
    enqueue: Enqueue<T>,
}

impl<T: Transport> JobRouter<T> {
    /// `enqueue` publishes the retries.
    pub fn new(enqueue: Enqueue<T>) -> Self {
        Self {
            jobs: HashMap::new(),
            enqueue,
        }
    }

    /// Register a job handler with the router. If a handler for that job class is already
    /// present, it will get replaced.
    pub fn add_job_handler<J>(&mut self, job: J)
    where
        J: JobProcessor + 'static,
        J::Arguments: DeserializeOwned,
    {
        let boxed = WrappedJobHandler::new(job).boxed();
        self.jobs.insert(J::job_class(), boxed);
    }

    pub fn job_classes(&self) -> Vec<&'static str> {
        self.jobs.keys().copied().collect()
    }
}

#[async_trait]
impl<T: Transport> JobEngine for JobRouter<T> {
    #[instrument(skip_all, fields(job_id = %descriptor.job_id, job_class = descriptor.job_class(), executions = descriptor.executions()))]
    async fn run(&self, descriptor: &JobDescriptor) -> Result<(), EngineError> {
        let job_id = descriptor.job_id.as_str();
        let class = descriptor
            .job_class()
            .ok_or_else(|| EngineError::permanent(job_id, RouterError::MissingJobClass))?;
        let handler = self.jobs.get(class).ok_or_else(|| {
            EngineError::permanent(
                job_id,
                RouterError::UnknownJobClass {
                    job_class: class.to_string(),
                },
            )
        })?;

        let executions = descriptor.executions().saturating_add(1);
        let error = match handler.perform(job_id, descriptor.arguments()).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        tracing::error!("Error during job processing: {}", error);

        if executions >= handler.attempts() {
            return Err(EngineError::permanent(job_id, error));
        }

        let mut retry = descriptor.clone();
        retry.set_executions(executions);
        retry.set_exception_executions(class, descriptor.exception_executions(class).saturating_add(1));
        let retry_at = Utc::now() + handler.retry_wait();
        warn!(
            attempt = executions,
            attempts = handler.attempts(),
            %retry_at,
            "Retrying job \"{}\"",
            job_id
        );
        let options = EnqueueOptions::new()
            .at(retry_at)
            .on_queue(retry.queue_name.clone());
        self.enqueue
            .enqueue(&retry, options)
            .await
            .map_err(|source| EngineError::permanent(job_id, RouterError::RetryFailed(source)))?;
        Ok(())
    }
}

/// Errors returned by the router.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Job descriptor has no job_class")]
    MissingJobClass,
    #[error("Router is not configured to run job class '{job_class}'")]
    UnknownJobClass { job_class: String },
    #[error("Failed to schedule retry: {0}")]
    RetryFailed(#[source] EnqueueError),
}
