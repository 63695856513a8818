//! Dead Letter Queue: terminal store for events that exhausted their retries
//!
//! The broker decides when an event is dead-lettered; a `DeadLetterQueue`
//! only decides how the dead letters are kept. Nothing here alerts anyone:
//! dead letters are surfaced by listing them.

use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// A failed event with context about why it ended up in the DLQ
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEvent {
    /// The original event, with its final retry count
    pub event: Event,

    /// Service whose handler failed last
    pub service: String,

    /// Reason the event was sent to DLQ
    pub reason: String,

    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    /// Create a new dead letter event
    pub fn new(event: Event, service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event,
            service: service.into(),
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Storage for dead-lettered events
///
/// Called with the broker's state lock held, so implementations need no
/// locking of their own and must not call back into the broker.
pub trait DeadLetterQueue: Send {
    /// Store a dead-lettered event
    fn push(&mut self, event: DeadLetterEvent);

    /// All stored events, oldest first
    fn snapshot(&self) -> Vec<DeadLetterEvent>;

    /// Most recent `limit` events, newest first
    fn list(&self, limit: usize) -> Vec<DeadLetterEvent>;

    fn count(&self) -> usize;

    fn clear(&mut self);
}

/// In-memory DLQ with a configurable max capacity
///
/// Oldest entries are dropped once capacity is exceeded, with a warning
/// and a running count in `evicted()`; `0` means unbounded.
pub struct MemoryDeadLetterQueue {
    events: Vec<DeadLetterEvent>,
    max_events: usize,
    evicted: u64,
}

impl MemoryDeadLetterQueue {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Vec::new(),
            max_events,
            evicted: 0,
        }
    }

    /// Entries dropped for capacity since creation or the last `clear`
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

impl Default for MemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl DeadLetterQueue for MemoryDeadLetterQueue {
    fn push(&mut self, event: DeadLetterEvent) {
        tracing::warn!(
            event_id = %event.event.id(),
            event_type = %event.event.event_type(),
            correlation_id = %event.event.correlation_id(),
            retry_count = event.event.retry_count(),
            service = %event.service,
            reason = %event.reason,
            "Event dead-lettered"
        );

        self.events.push(event);

        if self.max_events > 0 && self.events.len() > self.max_events {
            let drain_count = self.events.len() - self.max_events;
            self.events.drain(..drain_count);
            self.evicted += drain_count as u64;
            tracing::warn!(
                dropped = drain_count,
                capacity = self.max_events,
                total_evicted = self.evicted,
                "Dead-letter queue full, oldest entries dropped"
            );
        }
    }

    fn snapshot(&self) -> Vec<DeadLetterEvent> {
        self.events.clone()
    }

    fn list(&self, limit: usize) -> Vec<DeadLetterEvent> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    fn count(&self) -> usize {
        self.events.len()
    }

    fn clear(&mut self) {
        self.events.clear();
        self.evicted = 0;
    }
}

/// Whether a failed event has used up its redelivery budget
pub fn should_dead_letter(event: &Event, max_retries: u32) -> bool {
    event.retry_count() >= max_retries
}
