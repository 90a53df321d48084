use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::DEFAULT_QUEUE;

/// Serialized unit of work as produced by the job framework.
///
/// The core only ever looks at `job_id` and `queue_name`. Everything else (job class,
/// arguments, attempt counters, locale, ...) belongs to the framework and is carried along
/// untouched, so republishing a descriptor reproduces the original document.
///
/// # Examples
///
/// ```rust
/// use courier::core::job_descriptor::JobDescriptor;
/// use serde_json::json;
///
/// let descriptor = JobDescriptor::new("3f0c", "mailers")
///     .with_field("job_class", json!("WelcomeMail"))
///     .with_field("arguments", json!([42]));
///
/// assert_eq!(descriptor.job_class(), Some("WelcomeMail"));
/// assert_eq!(descriptor.executions(), 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn default_queue_name() -> String {
    DEFAULT_QUEUE.to_string()
}

impl JobDescriptor {
    pub fn new(job_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            queue_name: queue_name.into(),
            fields: Map::new(),
        }
    }

    /// Attach a framework-owned field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Decode a message body. Fails when the body is not a JSON object with a string `job_id`.
    pub fn from_slice(data: &[u8]) -> Result<Self, DescriptorError> {
        serde_json::from_slice(data).map_err(|error| DescriptorError::new(error, data))
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn job_class(&self) -> Option<&str> {
        self.fields.get("job_class").and_then(Value::as_str)
    }

    pub fn arguments(&self) -> Value {
        self.fields
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
    }

    /// Number of executions recorded by the framework so far.
    pub fn executions(&self) -> u32 {
        self.fields
            .get("executions")
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// Number of failed executions recorded under `key` (the framework keys these by exception list).
    pub fn exception_executions(&self, key: &str) -> u32 {
        self.fields
            .get("exception_executions")
            .and_then(|map| map.get(key))
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    pub fn set_executions(&mut self, executions: u32) {
        self.fields
            .insert("executions".to_string(), Value::from(executions));
    }

    pub fn set_exception_executions(&mut self, key: &str, count: u32) {
        let entry = self
            .fields
            .entry("exception_executions".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), Value::from(count));
        }
    }
}

/// A message body that could not be decoded into a [`JobDescriptor`].
#[derive(Error, Debug)]
#[error("Failed to parse job descriptor: {error}\nPayload sample (first {payload_size} bytes): {payload_sample}")]
pub struct DescriptorError {
    #[source]
    pub error: serde_json::Error,
    pub payload_sample: String,
    pub payload_size: usize,
}

impl DescriptorError {
    /// Includes a sample of the payload (first 500 chars) for debugging.
    pub fn new(error: serde_json::Error, payload: &[u8]) -> Self {
        Self {
            error,
            payload_sample: String::from_utf8_lossy(payload).chars().take(500).collect(),
            payload_size: payload.len(),
        }
    }
}
