use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

use crate::core::config::{ConfigError, CourierConfig};
use crate::core::subscriber::Subscriber;
use crate::core::transport::{
    Attributes, PublishedMessage, ReceivedMessage, Subscription, Topic, Transport, TransportError,
};

/// Options for the transport client.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    /// Project (namespace) the topics and subscriptions belong to (default: `job_queue`).
    pub project_id: String,

    /// Ack deadline for subscriptions created through this client (default: 10 minutes).
    pub ack_deadline: Duration,
}

impl ClientConfig {
    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_ack_deadline(mut self, ack_deadline: Duration) -> Self {
        self.ack_deadline = ack_deadline;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&CourierConfig::default())
    }
}

impl From<&CourierConfig> for ClientConfig {
    fn from(config: &CourierConfig) -> Self {
        Self {
            project_id: config.project_id.clone(),
            ack_deadline: config.ack_deadline(),
        }
    }
}

/// Process-wide handle to a [`Transport`].
///
/// Resolves topics and subscriptions once and caches them for the lifetime of the client,
/// runs fire-and-forget publishes on per-topic async publishers and builds push-style
/// [`Subscriber`]s on top of pull. Cloning is cheap; clones share caches and publishers.
pub struct Client<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

struct ClientInner<T> {
    transport: Arc<T>,
    config: ClientConfig,
    topics: RwLock<HashMap<String, Topic>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    publishers: Mutex<HashMap<String, TaskTracker>>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self::with_shared(Arc::new(transport), config)
    }

    /// Build a client around a transport that is shared with other owners.
    pub fn with_shared(transport: Arc<T>, config: ClientConfig) -> Self {
        info!(project_id = %config.project_id, ack_deadline = ?config.ack_deadline, "Initializing pub/sub client");
        Self {
            inner: Arc::new(ClientInner {
                transport,
                config,
                topics: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                publishers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Build a client configured from the environment (see [`CourierConfig::from_env`]).
    pub fn from_env(transport: T) -> Result<Self, ConfigError> {
        let config = CourierConfig::from_env()?;
        Ok(Self::new(transport, ClientConfig::from(&config)))
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Find or create a topic.
    pub async fn topic(&self, name: &str) -> Result<Topic, TransportError> {
        if let Some(topic) = self.inner.topics.read().await.get(name) {
            return Ok(topic.clone());
        }

        let wanted = Topic::new(&self.inner.config.project_id, name);
        let topic = self.inner.transport.get_or_create_topic(&wanted).await?;
        debug!(topic = %topic.path(), "Resolved topic");

        let mut topics = self.inner.topics.write().await;
        Ok(topics.entry(name.to_string()).or_insert(topic).clone())
    }

    /// Find or create a subscription bound to the topic of the same name.
    pub async fn subscription(&self, name: &str) -> Result<Subscription, TransportError> {
        if let Some(subscription) = self.inner.subscriptions.read().await.get(name) {
            return Ok(subscription.clone());
        }
        let topic = self.topic(name).await?;
        self.subscription_with(name, &topic, self.inner.config.ack_deadline)
            .await
    }

    /// Find or create a subscription bound to `topic`. Only a newly created subscription gets
    /// `ack_deadline`; an existing one keeps its own.
    pub async fn subscription_with(
        &self,
        name: &str,
        topic: &Topic,
        ack_deadline: Duration,
    ) -> Result<Subscription, TransportError> {
        if let Some(subscription) = self.inner.subscriptions.read().await.get(name) {
            return Ok(subscription.clone());
        }

        let wanted = Subscription::new(
            &self.inner.config.project_id,
            name,
            topic.clone(),
            ack_deadline,
        );
        let subscription = self
            .inner
            .transport
            .get_or_create_subscription(&wanted)
            .await?;
        debug!(subscription = %subscription.path(), topic = %topic.path(), "Resolved subscription");

        let mut subscriptions = self.inner.subscriptions.write().await;
        Ok(subscriptions
            .entry(name.to_string())
            .or_insert(subscription)
            .clone())
    }

    /// Publish and wait for the broker to accept the message.
    #[instrument(skip_all, err, fields(topic = %topic.name()))]
    pub async fn publish(
        &self,
        topic: &Topic,
        data: Bytes,
        attributes: Attributes,
    ) -> Result<PublishedMessage, TransportError> {
        self.inner.transport.publish(topic, data, attributes).await
    }

    /// Publish without waiting. `on_complete` runs exactly once with the outcome.
    ///
    /// The publish runs on the topic's async publisher, which [`shutdown_publishers`] can drain.
    /// Once that publisher is stopped, `on_complete` receives
    /// [`TransportError::PublisherStopped`] right away.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`shutdown_publishers`]: Client::shutdown_publishers
    pub fn publish_async<F>(&self, topic: &Topic, data: Bytes, attributes: Attributes, on_complete: F)
    where
        F: FnOnce(Result<PublishedMessage, TransportError>) + Send + 'static,
    {
        let tracker = self.async_publisher(topic.name());
        if tracker.is_closed() {
            on_complete(Err(TransportError::PublisherStopped(
                topic.name().to_string(),
            )));
            return;
        }

        let transport = self.inner.transport.clone();
        let topic = topic.clone();
        tracker.spawn(async move {
            let result = transport.publish(&topic, data, attributes).await;
            on_complete(result);
        });
    }

    /// Stop every async publisher. With `wait`, resolve only once their in-flight publishes
    /// have completed.
    pub async fn shutdown_publishers(&self, wait: bool) {
        let trackers: Vec<(String, TaskTracker)> = self
            .lock_publishers()
            .iter()
            .map(|(name, tracker)| (name.clone(), tracker.clone()))
            .collect();

        for (topic, tracker) in trackers {
            tracker.close();
            if wait {
                debug!(%topic, pending = tracker.len(), "Waiting for async publisher to drain");
                tracker.wait().await;
            }
        }
        info!("Shutdown of async publishers complete.");
    }

    pub async fn pull(
        &self,
        subscription: &Subscription,
        immediate: bool,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        self.inner.transport.pull(subscription, immediate).await
    }

    pub async fn acknowledge(
        &self,
        subscription: &Subscription,
        messages: &[ReceivedMessage],
    ) -> Result<(), TransportError> {
        if messages.is_empty() {
            return Ok(());
        }
        let ack_ids: Vec<String> = messages.iter().map(|m| m.ack_id.clone()).collect();
        self.inner
            .transport
            .acknowledge(subscription.path(), &ack_ids)
            .await
    }

    /// Acknowledge a single delivery on the subscription it came from.
    pub async fn acknowledge_message(&self, message: &ReceivedMessage) -> Result<(), TransportError> {
        self.inner
            .transport
            .acknowledge(&message.subscription, std::slice::from_ref(&message.ack_id))
            .await
    }

    /// Postpone redelivery of `message` until `seconds` from now.
    pub async fn extend_ack_deadline(
        &self,
        message: &ReceivedMessage,
        seconds: u32,
    ) -> Result<(), TransportError> {
        self.inner
            .transport
            .modify_ack_deadline(&message.subscription, &message.ack_id, seconds)
            .await
    }

    /// Build a push-style subscriber that calls `handler` for every delivery.
    ///
    /// The subscriber is returned stopped; register an error hook with
    /// [`Subscriber::on_error`] and then call [`Subscriber::start`].
    pub fn listen<F, Fut>(&self, subscription: &Subscription, handler: F) -> Subscriber
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let transport: Arc<dyn Transport> = self.inner.transport.clone();
        Subscriber::new(transport, subscription.clone(), handler)
    }

    fn async_publisher(&self, topic: &str) -> TaskTracker {
        self.lock_publishers()
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    fn lock_publishers(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskTracker>> {
        self.inner
            .publishers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use tokio::sync::oneshot;

    fn client() -> Client<RecordingTransport> {
        Client::new(RecordingTransport::default(), ClientConfig::default())
    }

    #[tokio::test]
    async fn test_topic_is_created_once_and_cached() {
        let client = client();

        let first = client.topic("default").await.unwrap();
        let second = client.topic("default").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.path(), "projects/job_queue/topics/default");
        assert_eq!(client.transport().state().topic_lookups, 1);
    }

    #[tokio::test]
    async fn test_subscription_defaults() {
        let client = client();

        let subscription = client.subscription("default").await.unwrap();

        assert_eq!(subscription.path(), "projects/job_queue/subscriptions/default");
        assert_eq!(subscription.topic().name(), "default");
        assert_eq!(subscription.ack_deadline(), Duration::from_secs(600));

        client.subscription("default").await.unwrap();
        assert_eq!(client.transport().state().subscription_lookups, 1);
    }

    #[tokio::test]
    async fn test_subscription_with_custom_project_and_deadline() {
        let client = Client::new(
            RecordingTransport::default(),
            ClientConfig::default()
                .with_project_id("billing")
                .with_ack_deadline(Duration::from_secs(30)),
        );

        let topic = client.topic("invoices").await.unwrap();
        let subscription = client
            .subscription_with("invoices-audit", &topic, Duration::from_secs(45))
            .await
            .unwrap();

        assert_eq!(subscription.path(), "projects/billing/subscriptions/invoices-audit");
        assert_eq!(subscription.topic().path(), "projects/billing/topics/invoices");
        assert_eq!(subscription.ack_deadline(), Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_publish_async_reports_outcome() {
        let client = client();
        let topic = client.topic("default").await.unwrap();
        let (tx, rx) = oneshot::channel();

        client.publish_async(&topic, Bytes::from_static(b"{}"), Attributes::new(), move |result| {
            let _ = tx.send(result.map(|m| m.data));
        });

        let data = rx.await.unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"{}"));
        assert_eq!(client.transport().state().published.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_async_failure_goes_to_callback() {
        let client = client();
        client.transport().state().fail_publish = true;
        let topic = client.topic("default").await.unwrap();
        let (tx, rx) = oneshot::channel();

        client.publish_async(&topic, Bytes::from_static(b"{}"), Attributes::new(), move |result| {
            let _ = tx.send(result.is_err());
        });

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops_publishers() {
        let client = client();
        let topic = client.topic("default").await.unwrap();

        for _ in 0..5 {
            client.publish_async(&topic, Bytes::from_static(b"{}"), Attributes::new(), |_| {});
        }
        client.shutdown_publishers(true).await;
        assert_eq!(client.transport().state().published.len(), 5);

        let (tx, rx) = oneshot::channel();
        client.publish_async(&topic, Bytes::from_static(b"{}"), Attributes::new(), move |result| {
            let _ = tx.send(result);
        });
        match rx.await.unwrap() {
            Err(TransportError::PublisherStopped(name)) => assert_eq!(name, "default"),
            other => panic!("Expected PublisherStopped, got {:?}", other),
        }
        assert_eq!(client.transport().state().published.len(), 5);
    }

    #[tokio::test]
    async fn test_acknowledge_and_extend_use_delivery_handles() {
        let client = client();
        let subscription = client.subscription("default").await.unwrap();
        let first = RecordingTransport::message(b"{}", &[]);
        let second = RecordingTransport::message(b"{}", &[]);

        client.extend_ack_deadline(&first, 300).await.unwrap();
        client.acknowledge_message(&first).await.unwrap();
        client.acknowledge(&subscription, &[]).await.unwrap();
        client.acknowledge(&subscription, &[second.clone()]).await.unwrap();

        let state = client.transport().state();
        assert_eq!(state.deadline_changes, vec![(first.ack_id.clone(), 300)]);
        assert_eq!(state.acknowledged, vec![first.ack_id.clone(), second.ack_id.clone()]);
    }
}
