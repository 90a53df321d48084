use async_trait::async_trait;
use chrono::Duration;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::instrument;

use crate::runner::job_processor::{JobError, JobProcessor};

/// Shorthand for boxed trait object for a WrappedJobHandler.
pub type BoxedJobHandler = Box<dyn JobProcessor<Arguments = Value, Error = JobError>>;

/// Object-safe adapter that decodes raw `arguments` before calling the typed processor.
/// [`JobRouter`](crate::runner::job_router::JobRouter) does the wrapping.
pub struct WrappedJobHandler<J: JobProcessor> {
    job: J,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Arguments: DeserializeOwned,
{
    pub fn new(job: J) -> Self {
        Self { job }
    }

    pub fn boxed(self) -> BoxedJobHandler {
        Box::new(self) as BoxedJobHandler
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Arguments: DeserializeOwned,
{
    type Arguments = Value;
    type Error = JobError;

    fn job_class() -> &'static str {
        J::job_class()
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, job_class = %Self::job_class()))]
    async fn perform(&self, job_id: &str, arguments: Self::Arguments) -> Result<(), Self::Error> {
        let typed: J::Arguments = serde_json::from_value(arguments.clone())
            .map_err(|error| JobError::deserialization_error(error, &arguments))?;

        self.job.perform(job_id, typed).await.map_err(Into::into)
    }

    fn attempts(&self) -> u32 {
        self.job.attempts()
    }

    fn retry_wait(&self) -> Duration {
        self.job.retry_wait()
    }
}
