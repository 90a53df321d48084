use bytes::Bytes;
use courier::core::transport::{Attributes, ReceivedMessage, Subscription};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// A message as stored by a subscription.
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub id: String,
    pub data: Bytes,
    pub attributes: Attributes,
    /// Deliveries handed out so far.
    pub deliveries: u32,
}

#[derive(Debug)]
struct Outstanding {
    message: StoredMessage,
    deadline: Instant,
}

/// Per-subscription message store.
///
/// A message is either pending (ready for delivery) or outstanding (delivered, waiting for an
/// acknowledgement until its deadline). Expired outstanding messages are moved back to pending
/// lazily, whenever the queue is looked at.
#[derive(Debug)]
pub(crate) struct SubscriptionQueue {
    subscription: Subscription,
    pending: VecDeque<StoredMessage>,
    outstanding: HashMap<String, Outstanding>,
    notify: Arc<Notify>,
}

impl SubscriptionQueue {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            pending: VecDeque::new(),
            outstanding: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Wakes blocked pulls whenever a message becomes pending.
    pub fn notify(&self) -> &Arc<Notify> {
        &self.notify
    }

    pub fn push(&mut self, message: StoredMessage) {
        self.pending.push_back(message);
        self.notify.notify_waiters();
    }

    /// Deliver up to `max` pending messages, each with a fresh ack id and deadline.
    pub fn take(&mut self, now: Instant, max: usize) -> Vec<ReceivedMessage> {
        self.requeue_expired(now);
        let deadline = now + self.subscription.ack_deadline();
        let count = max.min(self.pending.len());
        let path = self.subscription.path();

        let mut batch = Vec::with_capacity(count);
        for mut message in self.pending.drain(..count) {
            message.deliveries = message.deliveries.saturating_add(1);
            let ack_id = Uuid::now_v7().to_string();
            batch.push(ReceivedMessage {
                id: message.id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
                ack_id: ack_id.clone(),
                subscription: path.to_string(),
                delivery_attempt: message.deliveries,
            });
            self.outstanding
                .insert(ack_id, Outstanding { message, deadline });
        }
        batch
    }

    /// Returns `false` for an unknown or expired ack id.
    pub fn acknowledge(&mut self, ack_id: &str) -> bool {
        self.outstanding.remove(ack_id).is_some()
    }

    /// Move the deadline of a delivery to `seconds` from `now`; zero releases it right away.
    /// Returns `false` for an unknown or expired ack id.
    pub fn modify_deadline(&mut self, ack_id: &str, seconds: u32, now: Instant) -> bool {
        if seconds == 0 {
            let Some(outstanding) = self.outstanding.remove(ack_id) else {
                return false;
            };
            self.push(outstanding.message);
            return true;
        }

        match self.outstanding.get_mut(ack_id) {
            Some(outstanding) => {
                outstanding.deadline = now + Duration::from_secs(u64::from(seconds));
                true
            }
            None => false,
        }
    }

    /// Earliest instant at which an outstanding message becomes pending again.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.outstanding.values().map(|o| o.deadline).min()
    }

    pub fn pending_count(&mut self, now: Instant) -> usize {
        self.requeue_expired(now);
        self.pending.len()
    }

    pub fn outstanding_count(&mut self, now: Instant) -> usize {
        self.requeue_expired(now);
        self.outstanding.len()
    }

    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        for ack_id in expired {
            if let Some(outstanding) = self.outstanding.remove(&ack_id) {
                tracing::debug!(
                    message_id = %outstanding.message.id,
                    subscription = %self.subscription.path(),
                    "Ack deadline expired, message will be redelivered"
                );
                self.pending.push_back(outstanding.message);
            }
        }
    }
}
