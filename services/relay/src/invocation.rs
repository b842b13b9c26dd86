//! Queue-event envelope handed to the relay.
//!
//! Mirrors the shape queue event sources deliver to functions:
//!
//! ```json
//! {"Records": [{"messageId": "...", "receiptHandle": "...", "body": "{...}", ...}]}
//! ```
//!
//! Only `Records[0].body` is needed by the relay. The remaining fields are
//! carried for logging and for the queue consumer's acknowledgement.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Why an invocation record could not be used
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationFault {
    #[error("record is not a valid envelope: {0}")]
    NotJson(String),

    #[error("record contains no messages")]
    NoRecords,

    #[error("record contains {0} messages, expected exactly one")]
    TooManyRecords(usize),

    #[error("message has no body")]
    MissingBody,
}

/// One invocation: the batch of queued messages delivered together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationRecord {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueRecord>,
}

/// A single queued message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub message_attributes: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_of_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_source: Option<String>,
    #[serde(rename = "eventSourceARN", default, skip_serializing_if = "Option::is_none")]
    pub event_source_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_region: Option<String>,
}

impl InvocationRecord {
    /// Wrap one queued message
    pub fn single(record: QueueRecord) -> Self {
        Self {
            records: vec![record],
        }
    }

    /// Parse an envelope from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvocationFault> {
        serde_json::from_slice(bytes).map_err(|e| InvocationFault::NotJson(e.to_string()))
    }

    /// The single message this invocation carries
    pub fn message(&self) -> Result<&QueueRecord, InvocationFault> {
        match self.records.as_slice() {
            [] => Err(InvocationFault::NoRecords),
            [record] => Ok(record),
            records => Err(InvocationFault::TooManyRecords(records.len())),
        }
    }

    /// Raw body of the single message
    pub fn body(&self) -> Result<&str, InvocationFault> {
        self.message()?
            .body
            .as_deref()
            .ok_or(InvocationFault::MissingBody)
    }
}

impl QueueRecord {
    /// A record carrying only a body
    pub fn with_body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Default::default()
        }
    }

    /// Approximate number of times the queue has delivered this message
    pub fn receive_count(&self) -> Option<u32> {
        self.attributes
            .get("ApproximateReceiveCount")
            .and_then(|count| count.parse().ok())
    }
}
