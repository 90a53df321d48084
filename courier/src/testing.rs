//! In-crate test doubles.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::core::transport::{
    Attributes, PublishedMessage, ReceivedMessage, Subscription, Topic, Transport, TransportError,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn setup_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Transport that records every call and serves scripted pull batches.
#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
pub struct RecordingState {
    pub topic_lookups: usize,
    pub subscription_lookups: usize,
    pub published: Vec<(String, PublishedMessage)>,
    pub acknowledged: Vec<String>,
    pub deadline_changes: Vec<(String, u32)>,
    pub pulls: usize,
    pub immediate_pulls: usize,
    pub batches: VecDeque<Vec<ReceivedMessage>>,
    pub fail_publish: bool,
    pub failing_pulls: usize,
}

impl RecordingTransport {
    pub fn state(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap()
    }

    pub fn push_batch(&self, batch: Vec<ReceivedMessage>) {
        self.state().batches.push_back(batch);
    }

    /// A delivery on `projects/job_queue/subscriptions/default`.
    pub fn message(data: &[u8], attributes: &[(&str, &str)]) -> ReceivedMessage {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        ReceivedMessage {
            id: format!("msg-id-{id}"),
            data: Bytes::copy_from_slice(data),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ack_id: format!("ack-id-{id}"),
            subscription: "projects/job_queue/subscriptions/default".to_string(),
            delivery_attempt: 1,
        }
    }

    /// Messages published to the topic called `name`.
    pub fn published_to(&self, name: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|(topic, _)| topic == name)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn get_or_create_topic(&self, topic: &Topic) -> Result<Topic, TransportError> {
        self.state().topic_lookups += 1;
        Ok(topic.clone())
    }

    async fn get_or_create_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<Subscription, TransportError> {
        self.state().subscription_lookups += 1;
        Ok(subscription.clone())
    }

    async fn publish(
        &self,
        topic: &Topic,
        data: Bytes,
        attributes: Attributes,
    ) -> Result<PublishedMessage, TransportError> {
        let mut state = self.state();
        if state.fail_publish {
            return Err(TransportError::Backend(anyhow::anyhow!("broker unavailable")));
        }
        let message = PublishedMessage {
            id: format!("msg-id-{}", NEXT_ID.fetch_add(1, Ordering::SeqCst)),
            data,
            attributes,
        };
        state
            .published
            .push((topic.name().to_string(), message.clone()));
        Ok(message)
    }

    async fn pull(
        &self,
        _subscription: &Subscription,
        immediate: bool,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        let mut state = self.state();
        state.pulls += 1;
        if immediate {
            state.immediate_pulls += 1;
        }
        if state.failing_pulls > 0 {
            state.failing_pulls -= 1;
            return Err(TransportError::Backend(anyhow::anyhow!("pull failed")));
        }
        Ok(state.batches.pop_front().unwrap_or_default())
    }

    async fn acknowledge(
        &self,
        _subscription_path: &str,
        ack_ids: &[String],
    ) -> Result<(), TransportError> {
        self.state().acknowledged.extend(ack_ids.iter().cloned());
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        _subscription_path: &str,
        ack_id: &str,
        seconds: u32,
    ) -> Result<(), TransportError> {
        self.state()
            .deadline_changes
            .push((ack_id.to_string(), seconds));
        Ok(())
    }
}
