//! Transport-agnostic types and traits, plus re-exports of 3rd party types used in the public interface.

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use bytes::Bytes;
pub use chrono::{Duration, Utc};
pub use serde_json;

pub mod client;
pub mod config;
pub mod job_descriptor;
pub mod job_engine;
pub mod subscriber;
pub mod transport;

/// Queue name reserved for jobs that exhausted their retry budget.
pub const MORGUE_QUEUE: &str = "morgue";

/// Queue used when the caller does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Message attribute carrying the earliest execution time as float epoch seconds.
pub const SCHEDULED_AT_ATTRIBUTE: &str = "scheduled_at";

/// Converts a timestamp to float epoch seconds, the representation used on the wire.
pub fn epoch_seconds(at: DateTime) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}
