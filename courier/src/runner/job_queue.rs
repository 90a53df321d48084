use crate::core::client::Client;
use crate::core::job_descriptor::JobDescriptor;
use crate::core::transport::{PublishedMessage, Subscription, Transport, TransportError};
use crate::core::{epoch_seconds, Utc};
use crate::runner::enqueue::{Enqueue, EnqueueError, EnqueueOptions};
use crate::runner::executor::Executor;
use crate::runner::worker::{drain, Worker, WorkerOptions};

/// Entry points for the job framework: enqueue descriptors and manage per-queue
/// subscriptions. Holds no decision logic of its own.
pub struct JobQueue<T: Transport> {
    client: Client<T>,
    enqueue: Enqueue<T>,
}

impl<T: Transport> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            enqueue: self.enqueue.clone(),
        }
    }
}

impl<T: Transport> JobQueue<T> {
    pub fn new(client: Client<T>, enqueue: Enqueue<T>) -> Self {
        Self { client, enqueue }
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    /// Enqueue `descriptor` on its own queue to run as soon as possible.
    pub async fn enqueue(
        &self,
        descriptor: &JobDescriptor,
    ) -> Result<Option<PublishedMessage>, EnqueueError> {
        self.enqueue_at(descriptor, epoch_seconds(Utc::now())).await
    }

    /// Enqueue `descriptor` on its own queue to run no earlier than `timestamp` (float epoch
    /// seconds).
    pub async fn enqueue_at(
        &self,
        descriptor: &JobDescriptor,
        timestamp: f64,
    ) -> Result<Option<PublishedMessage>, EnqueueError> {
        let options = EnqueueOptions::new()
            .at_timestamp(timestamp)
            .on_queue(descriptor.queue_name.clone());
        self.enqueue.enqueue(descriptor, options).await
    }

    pub async fn shutdown(&self, wait: bool) {
        self.enqueue.shutdown(wait).await;
    }

    /// Subscription a worker for `queue_name` listens on.
    pub async fn worker_sub(&self, queue_name: &str) -> Result<Subscription, TransportError> {
        self.client.subscription(queue_name).await
    }

    pub fn worker(
        &self,
        queue_name: impl Into<String>,
        executor: Executor<T>,
        options: WorkerOptions,
    ) -> Worker<T> {
        Worker::new(queue_name, self.client.clone(), executor, options)
    }

    /// Drop every pending message on `queue_name` without running it.
    ///
    /// Pulls block, so a batch the transport is still preparing is not mistaken for an empty
    /// queue.
    pub async fn clear(&self, queue_name: &str) -> Result<usize, TransportError> {
        let subscription = self.worker_sub(queue_name).await?;
        drain(&self.client, &subscription, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::ClientConfig;
    use crate::core::config::PublishMode;
    use crate::core::SCHEDULED_AT_ATTRIBUTE;
    use crate::testing::RecordingTransport;
    use serde_json::json;

    fn job_queue(mode: PublishMode) -> JobQueue<RecordingTransport> {
        let client = Client::new(RecordingTransport::default(), ClientConfig::default());
        let enqueue = Enqueue::new(client.clone()).with_mode(mode);
        JobQueue::new(client, enqueue)
    }

    fn descriptor(queue_name: &str) -> JobDescriptor {
        JobDescriptor::new("job-1", queue_name).with_field("job_class", json!("MockJob"))
    }

    #[tokio::test]
    async fn test_enqueue_at_uses_descriptor_queue() {
        let queue = job_queue(PublishMode::Sync);

        let published = queue
            .enqueue_at(&descriptor("mailers"), 1_700_000_000.5)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(published.attributes[SCHEDULED_AT_ATTRIBUTE], "1700000000.5");
        let transport = queue.client().transport();
        assert_eq!(transport.published_to("mailers").len(), 1);
        assert!(transport.published_to("default").is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_schedules_now() {
        let queue = job_queue(PublishMode::Sync);
        let before = epoch_seconds(Utc::now());

        let published = queue.enqueue(&descriptor("default")).await.unwrap().unwrap();

        let scheduled_at: f64 = published.attributes[SCHEDULED_AT_ATTRIBUTE].parse().unwrap();
        assert!(scheduled_at >= before);
        assert!(scheduled_at <= epoch_seconds(Utc::now()));
    }

    #[tokio::test]
    async fn test_async_enqueue_completes_on_shutdown() {
        let queue = job_queue(PublishMode::Async);

        let published = queue.enqueue(&descriptor("default")).await.unwrap();
        queue.shutdown(true).await;

        assert!(published.is_none());
        assert_eq!(queue.client().transport().published_to("default").len(), 1);
    }

    #[tokio::test]
    async fn test_worker_sub_is_cached() {
        let queue = job_queue(PublishMode::Sync);

        let first = queue.worker_sub("default").await.unwrap();
        let second = queue.worker_sub("default").await.unwrap();

        assert_eq!(first.path(), "projects/job_queue/subscriptions/default");
        assert_eq!(first.path(), second.path());
        assert_eq!(queue.client().transport().state().subscription_lookups, 1);
    }

    #[tokio::test]
    async fn test_clear_acknowledges_everything() {
        let queue = job_queue(PublishMode::Sync);
        let transport = queue.client().transport().clone();
        transport.push_batch(vec![
            RecordingTransport::message(b"{}", &[]),
            RecordingTransport::message(b"garbage", &[]),
        ]);

        let cleared = queue.clear("default").await.unwrap();

        assert_eq!(cleared, 2);
        let state = transport.state();
        assert_eq!(state.acknowledged.len(), 2);
        assert_eq!(state.pulls, 2);
        assert_eq!(state.immediate_pulls, 0);
    }
}
