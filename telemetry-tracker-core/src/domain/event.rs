use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// A telemetry event submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Event {
    #[serde(default)]
    #[validate(length(min = 1, max = 255, message = "event_type is required and must be at most 255 characters"))]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: None,
            data,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Decode a request body and validate it.
    ///
    /// Malformed JSON and unknown fields are serialization errors; a bad
    /// `event_type` is a validation error.
    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        let event: Event = serde_json::from_slice(bytes)?;
        event.validate()?;
        Ok(event)
    }

    /// The timestamp to persist: the client's value, or now when absent.
    pub fn normalized_timestamp(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_else(Utc::now)
    }
}
