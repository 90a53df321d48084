use bytes::Bytes;
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::core::client::Client;
use crate::core::job_descriptor::JobDescriptor;
use crate::core::transport::{Attributes, PublishedMessage, Transport, TransportError};
use crate::core::{epoch_seconds, DateTime, DEFAULT_QUEUE, SCHEDULED_AT_ATTRIBUTE};

pub use crate::core::config::PublishMode;

/// Where and when an enqueued job should run.
///
/// # Examples
///
/// ```rust
/// use courier::runner::enqueue::EnqueueOptions;
/// use chrono::Duration;
///
/// // Run as soon as possible on the default queue
/// let opts = EnqueueOptions::now();
/// assert_eq!(opts.queue_name(), "default");
///
/// // Run in 5 minutes on the "mailers" queue
/// let opts = EnqueueOptions::new()
///     .in_duration(Duration::minutes(5))
///     .on_queue("mailers");
/// ```
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    scheduled_at: f64,
    queue_name: String,
}

impl EnqueueOptions {
    /// Create options with default values (now, default queue).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now() -> Self {
        Self::default()
    }

    pub fn at(mut self, scheduled_at: DateTime) -> Self {
        self.scheduled_at = epoch_seconds(scheduled_at);
        self
    }

    /// Set the scheduled time as float epoch seconds.
    pub fn at_timestamp(mut self, scheduled_at: f64) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    pub fn in_duration(mut self, duration: Duration) -> Self {
        self.scheduled_at = epoch_seconds(Utc::now() + duration);
        self
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Scheduled time as float epoch seconds.
    pub fn scheduled_at(&self) -> f64 {
        self.scheduled_at
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            scheduled_at: epoch_seconds(Utc::now()),
            queue_name: DEFAULT_QUEUE.to_string(),
        }
    }
}

/// Producer side: turns job descriptors into messages on the queue's topic.
///
/// In [`PublishMode::Async`] (the default) publishing is fire-and-forget and failures are only
/// logged. [`PublishMode::Sync`] waits for the broker and returns its errors.
pub struct Enqueue<T: Transport> {
    client: Client<T>,
    mode: PublishMode,
}

impl<T: Transport> Clone for Enqueue<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            mode: self.mode,
        }
    }
}

impl<T: Transport> Enqueue<T> {
    pub fn new(client: Client<T>) -> Self {
        Self {
            client,
            mode: PublishMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    /// Publish `descriptor` to the topic of `options.queue_name()` with a `scheduled_at`
    /// attribute.
    ///
    /// Returns the published message in sync mode and `None` in async mode.
    #[instrument(skip_all, err, fields(job_id = %descriptor.job_id, queue = %options.queue_name()))]
    pub async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
        options: EnqueueOptions,
    ) -> Result<Option<PublishedMessage>, EnqueueError> {
        debug!(
            "Enqueueing job \"{}\" to the \"{}\" queue..",
            descriptor.job_id, options.queue_name
        );

        let data = descriptor
            .to_bytes()
            .map_err(|source| EnqueueError::Serialize {
                job_id: descriptor.job_id.clone(),
                source,
            })?;
        self.publish(&descriptor.job_id, data, options).await
    }

    /// Publish an already serialized descriptor byte for byte, with a fresh `scheduled_at`
    /// attribute. Used to move a delivered job elsewhere without touching its document.
    #[instrument(skip_all, err, fields(job_id = %job_id, queue = %options.queue_name()))]
    pub async fn enqueue_raw(
        &self,
        job_id: &str,
        data: Bytes,
        options: EnqueueOptions,
    ) -> Result<Option<PublishedMessage>, EnqueueError> {
        debug!(
            "Republishing job \"{}\" to the \"{}\" queue..",
            job_id, options.queue_name
        );
        self.publish(job_id, data, options).await
    }

    async fn publish(
        &self,
        job_id: &str,
        data: Bytes,
        options: EnqueueOptions,
    ) -> Result<Option<PublishedMessage>, EnqueueError> {
        if !options.scheduled_at.is_finite() {
            return Err(EnqueueError::InvalidSchedule(options.scheduled_at));
        }
        let topic = self.client.topic(&options.queue_name).await?;
        let attributes = Attributes::from([(
            SCHEDULED_AT_ATTRIBUTE.to_string(),
            options.scheduled_at.to_string(),
        )]);

        match self.mode {
            PublishMode::Sync => Ok(Some(self.client.publish(&topic, data, attributes).await?)),
            PublishMode::Async => {
                let job_id = job_id.to_string();
                let queue = options.queue_name;
                self.client
                    .publish_async(&topic, data, attributes, move |result| {
                        if let Err(error) = result {
                            error!(%job_id, %queue, %error, "Failed to publish job");
                        }
                    });
                Ok(None)
            }
        }
    }

    /// Stop the async publishers; with `wait`, also wait for in-flight publishes.
    pub async fn shutdown(&self, wait: bool) {
        self.client.shutdown_publishers(wait).await;
    }
}

/// Errors related to enqueueing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EnqueueError {
    #[error("Failed to serialize job {job_id}: {source}")]
    Serialize {
        job_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid scheduled_at timestamp: {0}")]
    InvalidSchedule(f64),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::ClientConfig;
    use crate::testing::RecordingTransport;
    use chrono::TimeZone;
    use serde_json::json;

    fn enqueue(mode: PublishMode) -> Enqueue<RecordingTransport> {
        Enqueue::new(Client::new(RecordingTransport::default(), ClientConfig::default()))
            .with_mode(mode)
    }

    fn descriptor() -> JobDescriptor {
        JobDescriptor::new("job-1", "default")
            .with_field("job_class", json!("MockJob"))
            .with_field("arguments", json!([]))
    }

    #[test]
    fn test_options_defaults() {
        let before = epoch_seconds(Utc::now());
        let opts = EnqueueOptions::new();
        let after = epoch_seconds(Utc::now());

        assert_eq!(opts.queue_name(), "default");
        assert!(opts.scheduled_at() >= before);
        assert!(opts.scheduled_at() <= after);
    }

    #[test]
    fn test_options_at() {
        let time = Utc.with_ymd_and_hms(2024, 6, 15, 14, 30, 0).unwrap();
        let opts = EnqueueOptions::new().at(time).on_queue("serial");

        assert_eq!(opts.scheduled_at(), 1_718_461_800.0);
        assert_eq!(opts.queue_name(), "serial");
    }

    #[test]
    fn test_options_in_duration() {
        let expected = epoch_seconds(Utc::now() + Duration::minutes(5));
        let opts = EnqueueOptions::new().in_duration(Duration::minutes(5));

        assert!((opts.scheduled_at() - expected).abs() < 2.0);
    }

    #[tokio::test]
    async fn test_sync_enqueue_sets_scheduled_at() {
        let enqueue = enqueue(PublishMode::Sync);
        let timestamp = epoch_seconds(Utc::now()) + 10.0;

        let message = enqueue
            .enqueue(&descriptor(), EnqueueOptions::new().at_timestamp(timestamp))
            .await
            .unwrap()
            .unwrap();

        let stored: f64 = message.attributes["scheduled_at"].parse().unwrap();
        assert_eq!(stored, timestamp);
        let body: JobDescriptor = serde_json::from_slice(&message.data).unwrap();
        assert_eq!(body, descriptor());
        assert_eq!(enqueue.client().transport().published_to("default").len(), 1);
    }

    #[tokio::test]
    async fn test_sync_enqueue_to_named_queue() {
        let enqueue = enqueue(PublishMode::Sync);

        enqueue
            .enqueue(&descriptor(), EnqueueOptions::now().on_queue("serial"))
            .await
            .unwrap();

        let transport = enqueue.client().transport();
        assert_eq!(transport.published_to("serial").len(), 1);
        assert!(transport.published_to("default").is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_raw_keeps_body_bytes() {
        let enqueue = enqueue(PublishMode::Sync);
        let body = Bytes::from_static(br#"{"job_id":"job-1","job_class":"MockJob","arguments":[]}"#);

        let message = enqueue
            .enqueue_raw("job-1", body.clone(), EnqueueOptions::new().at_timestamp(42.5).on_queue("morgue"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(message.data, body);
        assert_eq!(message.attributes["scheduled_at"], "42.5");
        assert_eq!(enqueue.client().transport().published_to("morgue").len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_raw_rejects_invalid_schedule() {
        let enqueue = enqueue(PublishMode::Sync);

        let error = enqueue
            .enqueue_raw("job-1", Bytes::from_static(b"{}"), EnqueueOptions::new().at_timestamp(f64::NAN))
            .await
            .unwrap_err();

        assert!(matches!(error, EnqueueError::InvalidSchedule(_)));
        assert!(enqueue.client().transport().state().published.is_empty());
    }

    #[tokio::test]
    async fn test_sync_enqueue_propagates_publish_errors() {
        let enqueue = enqueue(PublishMode::Sync);
        enqueue.client().transport().state().fail_publish = true;

        let error = enqueue
            .enqueue(&descriptor(), EnqueueOptions::now())
            .await
            .unwrap_err();
        assert!(matches!(error, EnqueueError::Transport(_)));
    }

    #[tokio::test]
    async fn test_async_enqueue_swallows_publish_errors() {
        let enqueue = enqueue(PublishMode::Async);
        enqueue.client().transport().state().fail_publish = true;

        let result = enqueue.enqueue(&descriptor(), EnqueueOptions::now()).await;
        enqueue.shutdown(true).await;

        assert!(matches!(result, Ok(None)));
        assert!(enqueue.client().transport().state().published.is_empty());
    }

    #[tokio::test]
    async fn test_async_enqueue_is_drained_on_shutdown() {
        let enqueue = enqueue(PublishMode::Async);

        for _ in 0..3 {
            enqueue
                .enqueue(&descriptor(), EnqueueOptions::now())
                .await
                .unwrap();
        }
        enqueue.shutdown(true).await;

        assert_eq!(enqueue.client().transport().published_to("default").len(), 3);
    }

    #[tokio::test]
    async fn test_rejects_non_finite_schedule() {
        let enqueue = enqueue(PublishMode::Sync);

        let error = enqueue
            .enqueue(&descriptor(), EnqueueOptions::now().at_timestamp(f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(error, EnqueueError::InvalidSchedule(_)));
    }
}
