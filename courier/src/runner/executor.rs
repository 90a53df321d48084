use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::core::client::Client;
use crate::core::config::CourierConfig;
use crate::core::job_descriptor::JobDescriptor;
use crate::core::job_engine::{EngineError, JobEngine};
use crate::core::transport::{ReceivedMessage, Transport, TransportError};
use crate::core::{epoch_seconds, MORGUE_QUEUE};
use crate::runner::enqueue::{Enqueue, EnqueueError, EnqueueOptions};
use crate::runner::in_flight::InFlightLocks;

/// Where `Executor::process` runs the per-message logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Await the message in the caller's task. Deterministic, meant for tests.
    Inline,
    /// Spawn onto the runtime; at most `max_concurrency` messages are processed at once and the
    /// rest wait in an unbounded queue.
    #[default]
    Pool,
}

/// Options for configuring the executor.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ExecutorOptions {
    pub dispatch: Dispatch,

    /// Maximum number of concurrently processed messages (default: available parallelism).
    pub max_concurrency: usize,
}

impl ExecutorOptions {
    pub fn inline() -> Self {
        Self::default().with_dispatch(Dispatch::Inline)
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            dispatch: Dispatch::default(),
            max_concurrency: default_concurrency(),
        }
    }
}

impl From<&CourierConfig> for ExecutorOptions {
    fn from(config: &CourierConfig) -> Self {
        Self::default().with_max_concurrency(config.max_concurrency.unwrap_or_else(default_concurrency))
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The engine ran the job; the message was acknowledged.
    Succeeded,
    /// The engine gave up; the job went to the morgue and the message was acknowledged.
    DeadLettered,
    /// Not due yet; redelivery was pushed back by `seconds`.
    Delayed { seconds: u32 },
    /// The body is not a job descriptor; left for redelivery.
    ParseFailed,
    /// The job is already running in this process; left for redelivery.
    DuplicateSuppressed,
}

impl Disposition {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Disposition::Succeeded | Disposition::DeadLettered)
    }
}

/// Consumer-side decision logic for a single delivery.
///
/// Scheduling, retries and dead-lettering all work through the transport's redelivery deadline:
/// a message that is not due yet gets its deadline pushed to the scheduled time, and only a
/// job that finished (successfully or in the morgue) is ever acknowledged. A crash mid-job
/// therefore leads to redelivery.
pub struct Executor<T: Transport> {
    inner: Arc<ExecutorInner<T>>,
}

struct ExecutorInner<T: Transport> {
    client: Client<T>,
    dead_letter: Enqueue<T>,
    engine: Arc<dyn JobEngine>,
    locks: InFlightLocks,
    permits: Arc<Semaphore>,
    options: ExecutorOptions,
}

impl<T: Transport> Clone for Executor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Executor<T> {
    /// `enqueue` is used to republish jobs to the morgue; its publish mode applies there too.
    pub fn new(enqueue: Enqueue<T>, engine: Arc<dyn JobEngine>, options: ExecutorOptions) -> Self {
        info!(
            dispatch = ?options.dispatch,
            max_concurrency = options.max_concurrency,
            "Initializing job executor"
        );
        Self {
            inner: Arc::new(ExecutorInner {
                client: enqueue.client().clone(),
                dead_letter: enqueue,
                engine,
                locks: InFlightLocks::new(),
                permits: Arc::new(Semaphore::new(options.max_concurrency)),
                options,
            }),
        }
    }

    /// Jobs currently executing in this executor.
    pub fn in_flight(&self) -> &InFlightLocks {
        &self.inner.locks
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.inner.options
    }

    /// Handle a delivery. Never fails: errors are logged and the message is left to the
    /// transport's redelivery.
    ///
    /// With [`Dispatch::Pool`] this returns as soon as the work is queued.
    pub async fn process(&self, message: ReceivedMessage) {
        info!("Message \"{}\" received.", message.id);
        match self.inner.options.dispatch {
            Dispatch::Inline => self.process_and_log(message).await,
            Dispatch::Pool => {
                let executor = self.clone();
                let permits = self.inner.permits.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    executor.process_and_log(message).await;
                });
            }
        }
    }

    async fn process_and_log(&self, message: ReceivedMessage) {
        let message_id = message.id.clone();
        if let Err(error) = self.process_message(message).await {
            error!(%message_id, %error, "Message processing failed, leaving it for redelivery");
        }
    }

    /// Run the decision logic for one delivery in the current task.
    #[instrument(skip_all, fields(message_id = %message.id, delivery_attempt = message.delivery_attempt))]
    pub async fn process_message(
        &self,
        message: ReceivedMessage,
    ) -> Result<Disposition, ExecutorError> {
        let descriptor = match JobDescriptor::from_slice(&message.data) {
            Ok(descriptor) => descriptor,
            Err(error) => {
                error!("Parsing the message data failed, error: {}", error);
                error!(message = ?message, "Unparseable message left unacknowledged");
                return Ok(Disposition::ParseFailed);
            }
        };

        let now = epoch_seconds(Utc::now());
        let scheduled_at = scheduled_at(&message);
        if now < scheduled_at {
            let seconds = delay_seconds(scheduled_at, now);
            self.inner.client.extend_ack_deadline(&message, seconds).await?;
            info!("Message \"{}\" was delayed for {} seconds.", message.id, seconds);
            return Ok(Disposition::Delayed { seconds });
        }

        let job_id = descriptor.job_id.clone();
        let Some(guard) = self.inner.locks.try_acquire(&job_id) else {
            debug!(%job_id, "Job already running in this process, skipping delivery");
            return Ok(Disposition::DuplicateSuppressed);
        };

        info!(job_class = descriptor.job_class(), "Processing job \"{}\"..", job_id);
        let outcome = self.inner.engine.run(&descriptor).await;
        drop(guard);

        let disposition = match outcome {
            Ok(()) => Disposition::Succeeded,
            Err(EngineError::PermanentFailure { source, .. }) => {
                warn!(%job_id, error = %source, "Job failed permanently");
                self.inner
                    .dead_letter
                    .enqueue_raw(
                        &job_id,
                        message.data.clone(),
                        EnqueueOptions::now().on_queue(MORGUE_QUEUE),
                    )
                    .await
                    .map_err(|source| ExecutorError::DeadLetter {
                        job_id: job_id.clone(),
                        source,
                    })?;
                info!("Moving job to morgue \"{}\".", job_id);
                Disposition::DeadLettered
            }
        };

        self.inner.client.acknowledge_message(&message).await?;
        info!("Message \"{}\" acknowledged.", message.id);
        Ok(disposition)
    }
}

/// `scheduled_at` of a delivery. A missing or garbled attribute makes the job due immediately.
fn scheduled_at(message: &ReceivedMessage) -> f64 {
    match message.scheduled_at().map(|raw| (raw, raw.trim().parse::<f64>())) {
        Some((_, Ok(value))) if value.is_finite() => value,
        Some((raw, _)) => {
            warn!(message_id = %message.id, scheduled_at = raw, "Unreadable scheduled_at, running now");
            0.0
        }
        None => {
            warn!(message_id = %message.id, "Message has no scheduled_at, running now");
            0.0
        }
    }
}

fn delay_seconds(scheduled_at: f64, now: f64) -> u32 {
    (scheduled_at - now).ceil().clamp(0.0, u32::MAX as f64) as u32
}

/// Errors returned while processing a delivery. The message stays unacknowledged.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    #[error("Failed to move job {job_id} to the morgue: {source}")]
    DeadLetter {
        job_id: String,
        #[source]
        source: EnqueueError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
