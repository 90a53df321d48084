#![doc = include_str!("../README.md")]

pub mod core;

/// Shared test specifications for backend implementations.
///
/// These test functions ensure consistent behavior across all Transport implementations.
/// Backend tests should generate wrappers with [`generate_transport_spec_tests!`].
#[doc(hidden)]
pub mod transport_spec;

/// Producer and consumer machinery on top of [`core::client::Client`].
#[cfg(feature = "runner")]
pub mod runner {
    pub mod enqueue;
    pub mod executor;
    pub mod in_flight;
    pub mod job_processor;
    pub mod job_queue;
    pub mod job_router;
    pub mod shutdown;
    pub mod worker;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        client::{Client, ClientConfig},
        config::{CourierConfig, PublishMode},
        job_descriptor::JobDescriptor,
        job_engine::{EngineError, JobEngine},
        subscriber::{Subscriber, SubscriberError},
        transport::{
            Attributes, PublishedMessage, ReceivedMessage, Subscription, Topic, Transport,
            TransportError,
        },
        Bytes, DateTime, Duration, Utc, MORGUE_QUEUE,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::{
        enqueue::{Enqueue, EnqueueOptions},
        executor::{Disposition, Executor, ExecutorOptions},
        job_processor::{JobError, JobProcessor},
        job_queue::JobQueue,
        job_router::JobRouter,
        shutdown::shutdown_signal,
        worker::{Worker, WorkerOptions},
    };
    pub use serde::{Deserialize, Serialize};
}

#[cfg(test)]
mod testing;
