#![doc = include_str!("../README.md")]

use async_trait::async_trait;
use bytes::Bytes;
use courier::core::transport::{
    Attributes, PublishedMessage, ReceivedMessage, Subscription, Topic, Transport, TransportError,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

mod queue;
mod state;

use queue::StoredMessage;
use state::BrokerState;

/// Options for configuring the in-memory transport.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct MemoryTransportOptions {
    /// How long a blocking pull waits for messages (default: 1 second)
    pub pull_timeout: Duration,

    /// Maximum number of messages returned by one pull (default: 100)
    pub max_messages: usize,
}

impl MemoryTransportOptions {
    pub fn with_pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    /// Values below 1 are raised to 1.
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }
}

impl Default for MemoryTransportOptions {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_secs(1),
            max_messages: 100,
        }
    }
}

/// An in-process pub/sub broker implementing [`Transport`].
///
/// Topics fan out to every subscription bound to them. Delivered messages stay outstanding
/// until acknowledged; when a delivery's ack deadline passes, the message is handed out again
/// with a higher `delivery_attempt`. Deadlines run on tokio's clock, so paused-time tests can
/// advance them.
///
/// Cloning is cheap and clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    options: MemoryTransportOptions,
}

impl MemoryTransport {
    pub fn new(options: MemoryTransportOptions) -> Self {
        Self {
            state: Arc::default(),
            options,
        }
    }

    pub fn options(&self) -> &MemoryTransportOptions {
        &self.options
    }

    /// Messages on `subscription_path` waiting to be delivered (including expired deliveries).
    pub fn pending_count(&self, subscription_path: &str) -> Result<usize, TransportError> {
        Ok(self
            .lock()
            .queue_mut(subscription_path)?
            .pending_count(Instant::now()))
    }

    /// Deliveries on `subscription_path` waiting for an acknowledgement.
    pub fn outstanding_count(&self, subscription_path: &str) -> Result<usize, TransportError> {
        Ok(self
            .lock()
            .queue_mut(subscription_path)?
            .outstanding_count(Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn get_or_create_topic(&self, topic: &Topic) -> Result<Topic, TransportError> {
        Ok(self.lock().get_or_create_topic(topic))
    }

    async fn get_or_create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, TransportError> {
        self.lock().get_or_create_subscription(subscription)
    }

    #[instrument(skip_all, err, fields(topic = %topic.path()))]
    async fn publish(
        &self,
        topic: &Topic,
        data: Bytes,
        attributes: Attributes,
    ) -> Result<PublishedMessage, TransportError> {
        let message = StoredMessage {
            id: Uuid::now_v7().to_string(),
            data,
            attributes,
            deliveries: 0,
        };
        let delivered = self.lock().publish(topic, message.clone())?;
        debug!(message_id = %message.id, subscriptions = delivered, "Published message");

        Ok(PublishedMessage {
            id: message.id,
            data: message.data,
            attributes: message.attributes,
        })
    }

    async fn pull(
        &self,
        subscription: &Subscription,
        immediate: bool,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        let give_up = Instant::now() + self.options.pull_timeout;
        loop {
            let (notify, wake_at) = {
                let mut state = self.lock();
                let queue = state.queue_mut(subscription.path())?;
                let now = Instant::now();
                let batch = queue.take(now, self.options.max_messages);
                if !batch.is_empty() || immediate || now >= give_up {
                    return Ok(batch);
                }
                let wake_at = queue
                    .next_expiry()
                    .map_or(give_up, |expiry| expiry.min(give_up));
                (queue.notify().clone(), wake_at)
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            // Registers interest before the state is looked at again.
            notified.as_mut().enable();
            if self.has_pending(subscription)? {
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(
        &self,
        subscription_path: &str,
        ack_ids: &[String],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let queue = state.queue_mut(subscription_path)?;
        for ack_id in ack_ids {
            if !queue.acknowledge(ack_id) {
                debug!(%ack_id, subscription = subscription_path, "Ignoring unknown or expired ack id");
            }
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription_path: &str,
        ack_id: &str,
        seconds: u32,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let queue = state.queue_mut(subscription_path)?;
        if !queue.modify_deadline(ack_id, seconds, Instant::now()) {
            debug!(%ack_id, subscription = subscription_path, "Ignoring deadline change for unknown or expired ack id");
        }
        Ok(())
    }
}

impl MemoryTransport {
    fn has_pending(&self, subscription: &Subscription) -> Result<bool, TransportError> {
        Ok(self
            .lock()
            .queue_mut(subscription.path())?
            .pending_count(Instant::now())
            > 0)
    }
}
