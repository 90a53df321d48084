//! Shared test specifications for Transport implementations.
//!
//! These test functions can be called by any backend to ensure consistent delivery
//! semantics across all implementations.

/// Generate all transport spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// courier::generate_transport_spec_tests! {
///     backend = "memory",
///     test_attr = tokio::test(start_paused = true),
///     setup = || MemoryTransport::default()
/// }
/// ```
#[macro_export]
macro_rules! generate_transport_spec_tests {
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        setup = || $setup_expr:expr
    ) => {
        paste::paste! {
            // Producer-side tests
            #[$test_attr]
            async fn [<enqueue_then_pull_preserves_scheduled_at_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_enqueue_then_pull_preserves_scheduled_at(transport).await;
            }

            #[$test_attr]
            async fn [<publish_fans_out_to_every_subscription_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_publish_fans_out_to_every_subscription(transport).await;
            }

            #[$test_attr]
            async fn [<publish_before_subscription_is_not_retained_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_publish_before_subscription_is_not_retained(transport).await;
            }

            #[$test_attr]
            async fn [<publish_to_missing_topic_fails_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_publish_to_missing_topic_fails(transport).await;
            }

            // Delivery and redelivery tests
            #[$test_attr]
            async fn [<unacknowledged_message_is_redelivered_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_unacknowledged_message_is_redelivered(transport).await;
            }

            #[$test_attr]
            async fn [<acknowledged_message_is_gone_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_acknowledged_message_is_gone(transport).await;
            }

            #[$test_attr]
            async fn [<extended_deadline_postpones_redelivery_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_extended_deadline_postpones_redelivery(transport).await;
            }

            #[$test_attr]
            async fn [<zero_deadline_releases_message_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_zero_deadline_releases_message(transport).await;
            }

            #[$test_attr]
            async fn [<blocking_pull_waits_for_publish_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_blocking_pull_waits_for_publish(transport).await;
            }

            #[$test_attr]
            async fn [<pull_from_missing_subscription_fails_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_pull_from_missing_subscription_fails(transport).await;
            }

            // Queue maintenance
            #[$test_attr]
            async fn [<clear_drains_without_executing_ $backend>]() {
                let transport = $setup_expr;
                $crate::transport_spec::test_clear_drains_without_executing(transport).await;
            }
        }
    };
}

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::core::client::{Client, ClientConfig};
use crate::core::job_descriptor::JobDescriptor;
use crate::core::job_engine::{EngineError, JobEngine};
use crate::core::transport::{Attributes, Subscription, Topic, Transport, TransportError};
use crate::core::{Bytes, SCHEDULED_AT_ATTRIBUTE};

/// Engine that only counts how often it was asked to run something.
#[derive(Default)]
pub struct CountingEngine {
    runs: AtomicU32,
}

impl CountingEngine {
    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobEngine for CountingEngine {
    async fn run(&self, _descriptor: &JobDescriptor) -> Result<(), EngineError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn client<T: Transport>(transport: T) -> Client<T> {
    Client::new(transport, ClientConfig::default())
}

fn descriptor(job_id: &str) -> JobDescriptor {
    JobDescriptor::new(job_id, "default")
        .with_field("job_class", json!("MockJob"))
        .with_field("arguments", json!([]))
}

async fn short_lived_subscription<T: Transport>(client: &Client<T>, name: &str) -> Subscription {
    let topic = client.topic(name).await.unwrap();
    client
        .subscription_with(name, &topic, Duration::from_secs(1))
        .await
        .unwrap()
}

async fn publish_raw<T: Transport>(client: &Client<T>, topic: &Topic, body: &'static [u8]) {
    client
        .publish(topic, Bytes::from_static(body), Attributes::new())
        .await
        .unwrap();
}

/// Enqueue a job and pull it back; `scheduled_at` survives the trip.
#[cfg(feature = "runner")]
pub async fn test_enqueue_then_pull_preserves_scheduled_at<T: Transport>(transport: T) {
    use crate::runner::enqueue::{Enqueue, EnqueueOptions, PublishMode};

    let client = client(transport);
    let subscription = client.subscription("default").await.unwrap();
    let enqueue = Enqueue::new(client.clone()).with_mode(PublishMode::Sync);
    let scheduled_at = 1_700_000_123.456_789;

    enqueue
        .enqueue(
            &descriptor("job-1"),
            EnqueueOptions::new().at_timestamp(scheduled_at),
        )
        .await
        .unwrap();

    let messages = client.pull(&subscription, true).await.unwrap();
    assert_eq!(messages.len(), 1);
    let received: f64 = messages[0].attributes[SCHEDULED_AT_ATTRIBUTE].parse().unwrap();
    assert!((received - scheduled_at).abs() < 1e-6);
    assert_eq!(messages[0].delivery_attempt, 1);
    assert_eq!(messages[0].subscription, subscription.path());
    let parsed = JobDescriptor::from_slice(&messages[0].data).unwrap();
    assert_eq!(parsed, descriptor("job-1"));
}

#[cfg(not(feature = "runner"))]
pub async fn test_enqueue_then_pull_preserves_scheduled_at<T: Transport>(_transport: T) {}

/// Every subscription bound to a topic receives its own copy.
pub async fn test_publish_fans_out_to_every_subscription<T: Transport>(transport: T) {
    let client = client(transport);
    let topic = client.topic("default").await.unwrap();
    let first = client
        .subscription_with("first", &topic, Duration::from_secs(600))
        .await
        .unwrap();
    let second = client
        .subscription_with("second", &topic, Duration::from_secs(600))
        .await
        .unwrap();

    publish_raw(&client, &topic, b"{\"job_id\":\"job-1\"}").await;

    let from_first = client.pull(&first, true).await.unwrap();
    let from_second = client.pull(&second, true).await.unwrap();
    assert_eq!(from_first.len(), 1);
    assert_eq!(from_second.len(), 1);
    assert_eq!(from_first[0].id, from_second[0].id);
    assert_ne!(from_first[0].ack_id, from_second[0].ack_id);
}

/// A subscription only sees messages published after it was created.
pub async fn test_publish_before_subscription_is_not_retained<T: Transport>(transport: T) {
    let client = client(transport);
    let topic = client.topic("late").await.unwrap();
    publish_raw(&client, &topic, b"early").await;

    let subscription = client.subscription("late").await.unwrap();
    assert!(client.pull(&subscription, true).await.unwrap().is_empty());

    publish_raw(&client, &topic, b"on time").await;
    let messages = client.pull(&subscription, true).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data.as_ref(), b"on time");
}

pub async fn test_publish_to_missing_topic_fails<T: Transport>(transport: T) {
    let topic = Topic::new("job_queue", "nowhere");

    let result = transport
        .publish(&topic, Bytes::from_static(b"lost"), Attributes::new())
        .await;

    assert!(matches!(result, Err(TransportError::TopicNotFound(_))));
}

/// A delivery that is neither acknowledged nor extended comes back after the ack deadline.
pub async fn test_unacknowledged_message_is_redelivered<T: Transport>(transport: T) {
    let client = client(transport);
    let subscription = short_lived_subscription(&client, "default").await;
    publish_raw(&client, subscription.topic(), b"payload").await;

    let first = client.pull(&subscription, true).await.unwrap();
    assert_eq!(first.len(), 1);
    assert!(client.pull(&subscription, true).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let second = client.pull(&subscription, true).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, first[0].id);
    assert_eq!(second[0].data, first[0].data);
    assert_eq!(second[0].delivery_attempt, first[0].delivery_attempt + 1);
}

pub async fn test_acknowledged_message_is_gone<T: Transport>(transport: T) {
    let client = client(transport);
    let subscription = short_lived_subscription(&client, "default").await;
    publish_raw(&client, subscription.topic(), b"payload").await;

    let messages = client.pull(&subscription, true).await.unwrap();
    client.acknowledge(&subscription, &messages).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert!(client.pull(&subscription, true).await.unwrap().is_empty());
}

/// Extending the deadline keeps the message away until the new deadline passes.
pub async fn test_extended_deadline_postpones_redelivery<T: Transport>(transport: T) {
    let client = client(transport);
    let subscription = short_lived_subscription(&client, "default").await;
    publish_raw(&client, subscription.topic(), b"payload").await;

    let messages = client.pull(&subscription, true).await.unwrap();
    client.extend_ack_deadline(&messages[0], 3).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(client.pull(&subscription, true).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let redelivered = client.pull(&subscription, true).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, messages[0].id);
}

pub async fn test_zero_deadline_releases_message<T: Transport>(transport: T) {
    let client = client(transport);
    let subscription = client.subscription("default").await.unwrap();
    publish_raw(&client, subscription.topic(), b"payload").await;

    let messages = client.pull(&subscription, true).await.unwrap();
    client.extend_ack_deadline(&messages[0], 0).await.unwrap();

    let redelivered = client.pull(&subscription, true).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, messages[0].id);
}

/// A blocking pull on an empty subscription returns once something is published.
pub async fn test_blocking_pull_waits_for_publish<T: Transport>(transport: T) {
    let client = client(transport);
    let subscription = client.subscription("default").await.unwrap();

    let publisher = client.clone();
    let topic = subscription.topic().clone();
    let publish = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publish_raw(&publisher, &topic, b"late arrival").await;
    });

    let messages = client.pull(&subscription, false).await.unwrap();
    publish.await.unwrap();

    let messages = if messages.is_empty() {
        client.pull(&subscription, false).await.unwrap()
    } else {
        messages
    };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data.as_ref(), b"late arrival");
}

pub async fn test_pull_from_missing_subscription_fails<T: Transport>(transport: T) {
    let topic = Topic::new("job_queue", "default");
    let subscription = Subscription::new("job_queue", "ghost", topic, Duration::from_secs(600));

    let result = transport.pull(&subscription, true).await;

    assert!(matches!(result, Err(TransportError::SubscriptionNotFound(_))));
}

/// `clear` acknowledges everything on the queue and runs nothing.
#[cfg(feature = "runner")]
pub async fn test_clear_drains_without_executing<T: Transport>(transport: T) {
    use crate::runner::enqueue::Enqueue;
    use crate::runner::executor::{Executor, ExecutorOptions};
    use crate::runner::worker::{Worker, WorkerOptions};
    use std::sync::Arc;

    let client = client(transport);
    let subscription = short_lived_subscription(&client, "default").await;
    for _ in 0..5 {
        publish_raw(&client, subscription.topic(), b"{\"job_id\":\"job-1\"}").await;
    }

    let engine = Arc::new(CountingEngine::default());
    let executor = Executor::new(
        Enqueue::new(client.clone()),
        engine.clone(),
        ExecutorOptions::inline(),
    );
    let worker = Worker::new("default", client.clone(), executor, WorkerOptions::default());

    let cleared = worker.clear(true).await.unwrap();

    assert_eq!(cleared, 5);
    assert_eq!(engine.runs(), 0);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(client.pull(&subscription, true).await.unwrap().is_empty());
}

#[cfg(not(feature = "runner"))]
pub async fn test_clear_drains_without_executing<T: Transport>(_transport: T) {}
