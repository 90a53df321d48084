use courier::core::transport::{Subscription, Topic, TransportError};
use std::collections::HashMap;

use crate::queue::{StoredMessage, SubscriptionQueue};

/// Everything the in-memory broker knows, keyed by fully qualified path.
#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    topics: HashMap<String, TopicEntry>,
    subscriptions: HashMap<String, SubscriptionQueue>,
}

#[derive(Debug)]
struct TopicEntry {
    topic: Topic,
    subscriptions: Vec<String>,
}

impl BrokerState {
    pub fn get_or_create_topic(&mut self, topic: &Topic) -> Topic {
        self.topics
            .entry(topic.path().to_string())
            .or_insert_with(|| {
                tracing::debug!(topic = %topic.path(), "Creating topic");
                TopicEntry {
                    topic: topic.clone(),
                    subscriptions: Vec::new(),
                }
            })
            .topic
            .clone()
    }

    /// An existing subscription is returned as it is. A new one needs its topic to exist.
    pub fn get_or_create_subscription(
        &mut self,
        subscription: &Subscription,
    ) -> Result<Subscription, TransportError> {
        if let Some(existing) = self.subscriptions.get(subscription.path()) {
            return Ok(existing.subscription().clone());
        }

        let topic = self
            .topics
            .get_mut(subscription.topic().path())
            .ok_or_else(|| TransportError::TopicNotFound(subscription.topic().path().to_string()))?;
        topic.subscriptions.push(subscription.path().to_string());

        tracing::debug!(
            subscription = %subscription.path(),
            topic = %subscription.topic().path(),
            ack_deadline = ?subscription.ack_deadline(),
            "Creating subscription"
        );
        self.subscriptions.insert(
            subscription.path().to_string(),
            SubscriptionQueue::new(subscription.clone()),
        );
        Ok(subscription.clone())
    }

    /// Hand a copy of `message` to every subscription bound to `topic`. Returns how many got one.
    pub fn publish(&mut self, topic: &Topic, message: StoredMessage) -> Result<usize, TransportError> {
        let entry = self
            .topics
            .get(topic.path())
            .ok_or_else(|| TransportError::TopicNotFound(topic.path().to_string()))?;

        let mut delivered = 0;
        for path in &entry.subscriptions {
            if let Some(queue) = self.subscriptions.get_mut(path) {
                queue.push(message.clone());
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub fn queue_mut(&mut self, subscription_path: &str) -> Result<&mut SubscriptionQueue, TransportError> {
        self.subscriptions
            .get_mut(subscription_path)
            .ok_or_else(|| TransportError::SubscriptionNotFound(subscription_path.to_string()))
    }
}
