use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument};

use crate::core::client::Client;
use crate::core::config::CourierConfig;
use crate::core::subscriber::{Subscriber, SubscriberError};
use crate::core::transport::{Subscription, Transport, TransportError};
use crate::runner::executor::Executor;

/// Options for configuring a worker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WorkerOptions {
    /// How long to wait for the listener to stop (default: 10 seconds)
    pub shutdown_timeout: Duration,

    /// Pause after a failed pull before trying again (default: 5 seconds)
    pub error_backoff: Duration,
}

impl WorkerOptions {
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl From<&CourierConfig> for WorkerOptions {
    fn from(config: &CourierConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout(),
            error_backoff: config.error_backoff(),
        }
    }
}

/// Binds one [`Executor`] to the subscription of one queue.
///
/// # Example
///
/// ```rust,no_run
/// use courier::core::client::Client;
/// use courier::core::transport::Transport;
/// use courier::runner::executor::Executor;
/// use courier::runner::shutdown::shutdown_signal;
/// use courier::runner::worker::{Worker, WorkerOptions};
///
/// # async fn example<T: Transport>(client: Client<T>, executor: Executor<T>) {
/// let worker = Worker::new("default", client, executor, WorkerOptions::default());
///
/// // Process messages until SIGTERM/SIGINT
/// worker.run_with_shutdown(shutdown_signal()).await.unwrap();
/// # }
/// ```
pub struct Worker<T: Transport> {
    queue_name: String,
    client: Client<T>,
    executor: Executor<T>,
    options: WorkerOptions,
}

impl<T: Transport> Worker<T> {
    pub fn new(
        queue_name: impl Into<String>,
        client: Client<T>,
        executor: Executor<T>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            client,
            executor,
            options,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn executor(&self) -> &Executor<T> {
        &self.executor
    }

    /// The queue's subscription, created on first use.
    pub async fn subscription(&self) -> Result<Subscription, WorkerError> {
        Ok(self.client.subscription(&self.queue_name).await?)
    }

    /// Start listening. Every delivery goes to [`Executor::process`]; listener-level errors
    /// are logged and never stop the subscriber.
    pub async fn listen(&self) -> Result<Subscriber, WorkerError> {
        let subscription = self.subscription().await?;
        let executor = self.executor.clone();
        let queue = self.queue_name.clone();

        let mut subscriber = self
            .client
            .listen(&subscription, move |message| {
                let executor = executor.clone();
                async move {
                    executor.process(message).await;
                    Ok(())
                }
            })
            .with_error_backoff(self.options.error_backoff)
            .on_error(move |error| {
                error!(queue = %queue, %error, "Worker error");
            });
        subscriber.start();

        info!(
            "Worker sub initialized, listening on the \"{}\" queue..",
            self.queue_name
        );
        Ok(subscriber)
    }

    /// Stop `subscriber`, waiting at most `shutdown_timeout`.
    pub async fn stop(&self, mut subscriber: Subscriber) -> Result<(), WorkerError> {
        info!("Stopping worker on the \"{}\" queue..", self.queue_name);
        subscriber.stop(self.options.shutdown_timeout).await?;
        Ok(())
    }

    /// Listen until `shutdown` completes, then stop gracefully.
    ///
    /// Pending async publishes (morgue republishes) are given the same `shutdown_timeout` to
    /// drain.
    pub async fn run_with_shutdown<F>(&self, shutdown: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()>,
    {
        let subscriber = self.listen().await?;
        shutdown.await;
        info!("Shutdown signal received, stopping worker");

        let stopped = self.stop(subscriber).await;
        let drain = self.client.shutdown_publishers(true);
        if tokio::time::timeout(self.options.shutdown_timeout, drain)
            .await
            .is_err()
        {
            error!("Pending publishes did not finish within {:?}", self.options.shutdown_timeout);
        }
        stopped
    }

    /// Pull and acknowledge everything on the queue without executing it, until a pull comes
    /// back empty. Returns the number of messages removed.
    ///
    /// Do not run this while a listener is active on the same queue.
    #[instrument(skip(self), fields(queue = %self.queue_name))]
    pub async fn clear(&self, immediate: bool) -> Result<usize, WorkerError> {
        let subscription = self.subscription().await?;
        Ok(drain(&self.client, &subscription, immediate).await?)
    }
}

/// Pull and acknowledge batches from `subscription` until a pull returns nothing.
pub(crate) async fn drain<T: Transport>(
    client: &Client<T>,
    subscription: &Subscription,
    immediate: bool,
) -> Result<usize, TransportError> {
    let mut cleared = 0;
    loop {
        let messages = client.pull(subscription, immediate).await?;
        if messages.is_empty() {
            break;
        }
        client.acknowledge(subscription, &messages).await?;
        cleared += messages.len();
    }
    info!(cleared, subscription = %subscription.path(), "The queue has been cleared.");
    Ok(cleared)
}

/// Errors returned by the worker.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::ClientConfig;
    use crate::core::config::PublishMode;
    use crate::core::job_descriptor::JobDescriptor;
    use crate::core::job_engine::{EngineError, JobEngine};
    use crate::core::{epoch_seconds, Utc};
    use crate::runner::enqueue::Enqueue;
    use crate::runner::executor::ExecutorOptions;
    use crate::testing::{setup_logger, RecordingTransport};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingEngine {
        runs: AtomicU32,
    }

    #[async_trait]
    impl JobEngine for CountingEngine {
        async fn run(&self, _descriptor: &JobDescriptor) -> Result<(), EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn worker(engine: Arc<CountingEngine>) -> Worker<RecordingTransport> {
        let client = Client::new(RecordingTransport::default(), ClientConfig::default());
        let enqueue = Enqueue::new(client.clone()).with_mode(PublishMode::Sync);
        let executor = Executor::new(enqueue, engine, ExecutorOptions::inline());
        Worker::new("default", client, executor, WorkerOptions::default())
    }

    fn job_message(job_id: &str) -> crate::core::transport::ReceivedMessage {
        let body = serde_json::to_vec(&json!({ "job_id": job_id, "job_class": "MockJob" })).unwrap();
        let scheduled_at = epoch_seconds(Utc::now()).to_string();
        RecordingTransport::message(&body, &[("scheduled_at", &scheduled_at)])
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_processes_deliveries() {
        setup_logger();
        let engine = Arc::new(CountingEngine::default());
        let worker = worker(engine.clone());
        let transport = worker.client.transport().clone();
        transport.push_batch(vec![job_message("job-1"), job_message("job-2")]);

        let subscriber = worker.listen().await.unwrap();
        assert!(subscriber.is_running());
        assert_eq!(subscriber.subscription().name(), "default");
        tokio::time::sleep(Duration::from_secs(1)).await;
        worker.stop(subscriber).await.unwrap();

        assert_eq!(engine.runs.load(Ordering::SeqCst), 2);
        assert_eq!(transport.state().acknowledged.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_survives_pull_errors() {
        let engine = Arc::new(CountingEngine::default());
        let worker = worker(engine.clone());
        let transport = worker.client.transport().clone();
        transport.state().failing_pulls = 1;
        transport.push_batch(vec![job_message("job-1")]);

        let subscriber = worker.listen().await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(subscriber.is_running());
        worker.stop(subscriber).await.unwrap();

        assert_eq!(engine.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_waits_error_backoff_from_options() {
        let engine = Arc::new(CountingEngine::default());
        let mut worker = worker(engine.clone());
        worker.options = WorkerOptions::default().with_error_backoff(Duration::from_secs(1));
        let transport = worker.client.transport().clone();
        transport.state().failing_pulls = 1;
        transport.push_batch(vec![job_message("job-1")]);

        let subscriber = worker.listen().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
        assert_eq!(transport.state().pulls, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        worker.stop(subscriber).await.unwrap();

        assert_eq!(engine.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_shutdown_stops_listener() {
        let engine = Arc::new(CountingEngine::default());
        let worker = worker(engine.clone());
        let transport = worker.client.transport().clone();
        transport.push_batch(vec![job_message("job-1")]);

        worker
            .run_with_shutdown(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(engine.runs.load(Ordering::SeqCst), 1);
        let pulls = transport.state().pulls;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.state().pulls, pulls);
    }

    #[tokio::test]
    async fn test_clear_drains_without_executing() {
        let engine = Arc::new(CountingEngine::default());
        let worker = worker(engine.clone());
        let transport = worker.client.transport().clone();
        transport.push_batch(vec![job_message("job-1"), job_message("job-2")]);
        transport.push_batch(vec![job_message("job-3")]);

        let cleared = worker.clear(true).await.unwrap();

        assert_eq!(cleared, 3);
        assert_eq!(engine.runs.load(Ordering::SeqCst), 0);
        let state = transport.state();
        assert_eq!(state.acknowledged.len(), 3);
        assert_eq!(state.pulls, 3);
        assert_eq!(state.immediate_pulls, 3);
    }

    #[tokio::test]
    async fn test_clear_empty_queue() {
        let worker = worker(Arc::new(CountingEngine::default()));

        assert_eq!(worker.clear(true).await.unwrap(), 0);
        assert_eq!(worker.client.transport().state().pulls, 1);
    }

    #[test]
    fn test_options_from_config() {
        let config = CourierConfig::from_lookup(|key| match key {
            "COURIER_SHUTDOWN_TIMEOUT_SECONDS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();

        let options = WorkerOptions::from(&config);

        assert_eq!(options.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(options.error_backoff, Duration::from_secs(5));
    }
}
