//! Push-style delivery loop on top of [`Transport::pull`].

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::transport::{ReceivedMessage, Subscription, Transport, TransportError};

/// Pause between pulls that came back empty.
const EMPTY_PULL_PAUSE: Duration = Duration::from_millis(100);

type MessageHandler =
    Arc<dyn Fn(ReceivedMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&SubscriberError) + Send + Sync>;

/// A controllable listener on one subscription.
///
/// Every delivery is handed to the message handler on its own task, so a handler that errors
/// or panics is reported to the error hook and the loop keeps going. Failed pulls are reported
/// the same way and retried after a backoff. Dropping a running subscriber cancels it.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    handler: MessageHandler,
    error_hook: ErrorHook,
    error_backoff: Duration,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscriber {
    pub fn new<F, Fut>(transport: Arc<dyn Transport>, subscription: Subscription, handler: F) -> Self
    where
        F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message| handler(message).boxed());
        Self {
            transport,
            subscription,
            handler,
            error_hook: Arc::new(|error| error!(%error, "Subscriber error")),
            error_backoff: Duration::from_secs(5),
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Replace the error hook. Takes effect on the next [`start`](Subscriber::start).
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&SubscriberError) + Send + Sync + 'static,
    {
        self.error_hook = Arc::new(hook);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Spawn the delivery loop. Calling it on a running subscriber does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            warn!(subscription = %self.subscription.path(), "Subscriber already running");
            return;
        }
        if self.token.is_cancelled() {
            self.token = CancellationToken::new();
        }

        info!(subscription = %self.subscription.path(), "Starting subscriber");
        let listener = Listener {
            transport: self.transport.clone(),
            subscription: self.subscription.clone(),
            handler: self.handler.clone(),
            error_hook: self.error_hook.clone(),
            error_backoff: self.error_backoff,
            token: self.token.clone(),
        };
        self.handle = Some(tokio::spawn(listener.run()));
    }

    /// Stop pulling new messages and wait up to `timeout` for the loop to exit.
    ///
    /// Handlers that already dispatched work elsewhere are not waited for. When the loop does
    /// not exit in time it is aborted and [`SubscriberError::StopTimeout`] is returned.
    pub async fn stop(&mut self, timeout: Duration) -> Result<(), SubscriberError> {
        self.token.cancel();
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => {
                info!(subscription = %self.subscription.path(), "Subscriber stopped");
                Ok(())
            }
            Err(_) => {
                handle.abort();
                Err(SubscriberError::StopTimeout(timeout))
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Listener {
    transport: Arc<dyn Transport>,
    subscription: Subscription,
    handler: MessageHandler,
    error_hook: ErrorHook,
    error_backoff: Duration,
    token: CancellationToken,
}

impl Listener {
    async fn run(self) {
        'listen: loop {
            let pulled = tokio::select! {
                _ = self.token.cancelled() => break,
                pulled = self.transport.pull(&self.subscription, false) => pulled,
            };

            match pulled {
                Ok(messages) if messages.is_empty() => {
                    if self.pause(EMPTY_PULL_PAUSE).await {
                        break;
                    }
                }
                Ok(messages) => {
                    for message in messages {
                        // Whatever is left unhandled gets redelivered after its deadline.
                        if self.token.is_cancelled() {
                            break 'listen;
                        }
                        self.dispatch(message).await;
                    }
                }
                Err(error) => {
                    (self.error_hook)(&SubscriberError::Transport(error));
                    if self.pause(self.error_backoff).await {
                        break;
                    }
                }
            }
        }
        debug!(subscription = %self.subscription.path(), "Listener loop exited");
    }

    async fn dispatch(&self, message: ReceivedMessage) {
        let message_id = message.id.clone();
        match tokio::spawn((self.handler)(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => (self.error_hook)(&SubscriberError::Handler { message_id, source }),
            Err(join_error) => (self.error_hook)(&SubscriberError::HandlerPanicked {
                message_id,
                reason: join_error.to_string(),
            }),
        }
    }

    /// Sleep for `duration`; returns `true` when cancelled meanwhile.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Errors surfaced by a subscriber, mostly through its error hook.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SubscriberError {
    #[error("Pull failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler failed for message {message_id}: {source}")]
    Handler {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Handler panicked for message {message_id}: {reason}")]
    HandlerPanicked { message_id: String, reason: String },

    #[error("Subscriber did not stop within {0:?}")]
    StopTimeout(Duration),
}
