use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::SCHEDULED_AT_ATTRIBUTE;

/// Message attributes, a flat string map travelling next to the body.
pub type Attributes = HashMap<String, String>;

/// A named publish channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    path: String,
}

impl Topic {
    pub fn new(project_id: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: format!("projects/{project_id}/topics/{name}"),
        }
    }

    /// Short name, identical to the queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified name, `projects/{project}/topics/{name}`.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A named receive channel bound to a topic.
///
/// The ack deadline is the only redelivery timer in the system: a delivered message that is
/// neither acknowledged nor extended within the deadline is handed out again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    name: String,
    path: String,
    topic: Topic,
    ack_deadline: Duration,
}

impl Subscription {
    pub fn new(project_id: &str, name: &str, topic: Topic, ack_deadline: Duration) -> Self {
        Self {
            name: name.to_string(),
            path: format!("projects/{project_id}/subscriptions/{name}"),
            topic,
            ack_deadline,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified name, `projects/{project}/subscriptions/{name}`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }
}

/// A message as accepted by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: String,
    pub data: Bytes,
    pub attributes: Attributes,
}

/// A single delivery of a message.
///
/// The same message may be delivered several times; every delivery carries its own `ack_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: String,
    pub data: Bytes,
    pub attributes: Attributes,
    pub ack_id: String,
    /// Path of the subscription this delivery came from.
    pub subscription: String,
    /// Approximate number of times this message has been delivered, starting at 1.
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    /// Raw value of the `scheduled_at` attribute.
    pub fn scheduled_at(&self) -> Option<&str> {
        self.attributes
            .get(SCHEDULED_AT_ATTRIBUTE)
            .map(String::as_str)
    }
}

/// An interface to a publish/subscribe backend with at-least-once delivery.
///
/// Implementations only provide the primitive operations. Caching, fire-and-forget publishing
/// and push-style listening are layered on top by [`Client`](crate::core::client::Client).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fetch the topic, creating it when it does not exist yet.
    async fn get_or_create_topic(&self, topic: &Topic) -> Result<Topic, TransportError>;

    /// Fetch the subscription, creating it (bound to its topic, with its ack deadline) when it
    /// does not exist yet. An existing subscription keeps its original settings.
    async fn get_or_create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, TransportError>;

    /// Publish a message and wait for the broker to accept it.
    async fn publish(
        &self,
        topic: &Topic,
        data: Bytes,
        attributes: Attributes,
    ) -> Result<PublishedMessage, TransportError>;

    /// Pull a batch of messages.
    ///
    /// With `immediate` the call returns right away, possibly with an empty batch. Otherwise it
    /// waits a backend-defined time for messages to become available.
    async fn pull(
        &self,
        subscription: &Subscription,
        immediate: bool,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Acknowledge deliveries. Unknown or expired ack ids are ignored.
    async fn acknowledge(
        &self,
        subscription_path: &str,
        ack_ids: &[String],
    ) -> Result<(), TransportError>;

    /// Push the redelivery deadline of an outstanding delivery to `seconds` from now.
    /// Zero releases the message for immediate redelivery.
    async fn modify_ack_deadline(
        &self,
        subscription_path: &str,
        ack_id: &str,
        seconds: u32,
    ) -> Result<(), TransportError>;
}

/// Errors related to transport operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Topic '{0}' not found")]
    TopicNotFound(String),

    #[error("Subscription '{0}' not found")]
    SubscriptionNotFound(String),

    #[error("Async publisher for topic '{0}' is stopped")]
    PublisherStopped(String),

    /// Connection or other backend error.
    #[error("Transport backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_project_qualified() {
        let topic = Topic::new("job_queue", "default");
        let subscription =
            Subscription::new("job_queue", "default", topic.clone(), Duration::from_secs(600));

        assert_eq!(topic.path(), "projects/job_queue/topics/default");
        assert_eq!(subscription.path(), "projects/job_queue/subscriptions/default");
        assert_eq!(subscription.topic(), &topic);
        assert_eq!(subscription.ack_deadline(), Duration::from_secs(600));
    }

    #[test]
    fn test_scheduled_at_attribute() {
        let mut message = ReceivedMessage {
            id: "msg-1".to_string(),
            data: Bytes::from_static(b"{}"),
            attributes: Attributes::new(),
            ack_id: "ack-1".to_string(),
            subscription: "projects/job_queue/subscriptions/default".to_string(),
            delivery_attempt: 1,
        };
        assert_eq!(message.scheduled_at(), None);

        message
            .attributes
            .insert("scheduled_at".to_string(), "1718461800.25".to_string());
        assert_eq!(message.scheduled_at(), Some("1718461800.25"));
    }

    #[test]
    fn test_transport_error_source_chain() {
        use std::error::Error;

        let error = TransportError::Backend(anyhow::anyhow!("connection refused"));
        assert!(error.source().is_some());
        assert!(error.to_string().contains("connection refused"));

        let error = TransportError::PublisherStopped("default".to_string());
        assert!(error.to_string().contains("default"));
    }

    #[test]
    fn test_transport_error_variants() {
        fn kind(error: &TransportError) -> &'static str {
            match error {
                TransportError::TopicNotFound(_) => "topic",
                TransportError::SubscriptionNotFound(_) => "subscription",
                TransportError::PublisherStopped(_) => "publisher",
                TransportError::Backend(_) => "backend",
            }
        }

        assert_eq!(kind(&TransportError::TopicNotFound("a".into())), "topic");
        assert_eq!(kind(&TransportError::SubscriptionNotFound("a".into())), "subscription");
        assert_eq!(kind(&TransportError::PublisherStopped("a".into())), "publisher");
        assert_eq!(kind(&TransportError::Backend(anyhow::anyhow!("down"))), "backend");
    }
}
