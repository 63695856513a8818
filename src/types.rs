//! Core event types for the lending broker
//!
//! All types use camelCase JSON serialization so audit dumps and dead-letter
//! listings read the same as the rest of the A3S event tooling.

use crate::error::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Schema-less event payload: string keys mapped to tagged JSON values
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Event type names emitted by the lending services
pub mod event_types {
    pub const BOOK_ADDED: &str = "BookAdded";
    pub const BOOK_BORROWED: &str = "BookBorrowed";
    pub const BOOK_RETURNED: &str = "BookReturned";
    pub const USER_REGISTERED: &str = "UserRegistered";
    pub const USER_SUSPENDED: &str = "UserSuspended";
    pub const USER_REACTIVATED: &str = "UserReactivated";
    pub const NOTIFICATION_SENT: &str = "NotificationSent";

    /// Every event type the lending system knows about
    pub const ALL: [&str; 7] = [
        BOOK_ADDED,
        BOOK_BORROWED,
        BOOK_RETURNED,
        USER_REGISTERED,
        USER_SUSPENDED,
        USER_REACTIVATED,
        NOTIFICATION_SENT,
    ];
}

/// A single event flowing through the broker
///
/// Everything except `retry_count` is fixed at creation. The retry counter
/// is only advanced by the broker when it schedules a redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: String,
    event_type: String,
    payload: Payload,
    correlation_id: String,
    retry_count: u32,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with auto-generated id and timestamp
    ///
    /// A fresh correlation id (`corr-<uuid>`) is assigned when none is given.
    pub fn new(
        event_type: impl Into<String>,
        payload: Payload,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type: event_type.into(),
            payload,
            correlation_id: correlation_id.unwrap_or_else(new_correlation_id),
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Backdate the event (replay and test fixtures)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Number of failed delivery attempts so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Required string field, as a handler error when absent
    pub fn str_field(&self, field: &str) -> Result<&str, HandlerError> {
        match self.payload.get(field) {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(_) => Err(self.wrong_type(field, "string")),
            None => Err(self.missing(field)),
        }
    }

    /// Optional string field; absent and null both yield `None`
    pub fn opt_str_field(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }

    /// Required integer field
    pub fn i64_field(&self, field: &str) -> Result<i64, HandlerError> {
        match self.payload.get(field) {
            Some(v) => v.as_i64().ok_or_else(|| self.wrong_type(field, "integer")),
            None => Err(self.missing(field)),
        }
    }

    fn missing(&self, field: &str) -> HandlerError {
        HandlerError::MissingField {
            event_type: self.event_type.clone(),
            field: field.to_string(),
        }
    }

    fn wrong_type(&self, field: &str, expected: &'static str) -> HandlerError {
        HandlerError::WrongType {
            event_type: self.event_type.clone(),
            field: field.to_string(),
            expected,
        }
    }
}

/// Generate a fresh correlation id for the start of a workflow
pub fn new_correlation_id() -> String {
    format!("corr-{}", uuid::Uuid::new_v4())
}

/// One failed handler invocation, kept in the broker's failure log
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    /// The event as it was when the handler failed
    pub event: Event,

    /// Service that registered the failing handler
    pub service: String,

    /// Rendered handler error
    pub error: String,

    pub failed_at: DateTime<Utc>,
}

/// Outcome counters for one `process_*` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Events whose handlers all succeeded
    pub delivered: usize,

    /// Failed deliveries that were requeued
    pub retried: usize,

    /// Events moved to the dead-letter sequence
    pub dead_lettered: usize,

    /// Wall time spent draining
    pub elapsed: Duration,
}

impl ProcessReport {
    /// Total delivery attempts made
    pub fn attempts(&self) -> usize {
        self.delivered + self.retried + self.dead_lettered
    }
}

/// Build a `Payload` from a `json!` object literal
///
/// Returns `None` for anything other than a JSON object.
pub fn payload_from(value: serde_json::Value) -> Option<Payload> {
    match value {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}
