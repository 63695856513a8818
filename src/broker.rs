//! In-process event broker
//!
//! `Broker` owns the handler registry, the pending queue, the failure log
//! and the dead-letter sequence. Emission only enqueues; delivery happens
//! when a caller (or the pump) drains the queue with `process_once`.
//!
//! Delivery is at-least-once: every handler runs once per attempt, and a
//! failed event is redelivered to every handler of its type, including
//! those that already succeeded. Only the final attempt stops at the first
//! failure, since the event is dead-lettered there.

use crate::config::BrokerConfig;
use crate::dlq::{should_dead_letter, DeadLetterEvent, DeadLetterQueue, MemoryDeadLetterQueue};
use crate::error::{EventError, HandlerResult, Result};
use crate::registry::{EventHandler, HandlerRegistry, Registration};
use crate::schema::SchemaRegistry;
use crate::types::{DeliveryFailure, Event, Payload, ProcessReport};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

struct BrokerState {
    queue: VecDeque<Event>,
    failures: VecDeque<DeliveryFailure>,
    dead_letters: Box<dyn DeadLetterQueue>,
}

/// Event broker with retry and dead-letter routing
///
/// Thread-safe via internal locks. No lock is held while a handler runs,
/// so handlers may call `emit` on the broker they are given.
pub struct Broker {
    registry: HandlerRegistry,
    schemas: SchemaRegistry,
    state: Mutex<BrokerState>,
    max_retries: u32,
    /// Failure log entries kept; 0 = unbounded
    failure_capacity: usize,
    draining: AtomicBool,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            registry: HandlerRegistry::new(),
            schemas: SchemaRegistry::new(),
            state: Mutex::new(BrokerState {
                queue: VecDeque::new(),
                failures: VecDeque::new(),
                dead_letters: Box::new(MemoryDeadLetterQueue::new(config.dead_letter_capacity)),
            }),
            max_retries: config.max_retries,
            failure_capacity: config.failure_log_capacity,
            draining: AtomicBool::new(false),
        }
    }

    /// Broker with default settings apart from the retry budget
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(&BrokerConfig::with_max_retries(max_retries))
    }

    /// Validate emitted payloads against these schemas
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Replace the dead-letter store
    pub fn with_dead_letter_queue(mut self, dlq: impl DeadLetterQueue + 'static) -> Self {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        state.dead_letters = Box::new(dlq);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Register a closure handler for `event_type`
    pub fn register<F>(&self, event_type: &str, service: &str, handler: F) -> Result<()>
    where
        F: Fn(&Event, &Broker) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry.register(event_type, service, Arc::new(handler))
    }

    /// Register a shared handler object for `event_type`
    pub fn register_handler(
        &self,
        event_type: &str,
        service: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        self.registry.register(event_type, service, handler)
    }

    pub fn handlers_for(&self, event_type: &str) -> Result<Vec<Registration>> {
        self.registry.handlers_for(event_type)
    }

    /// Enqueue a new event; handlers are not invoked
    ///
    /// `payload` must be a JSON object. Without a `correlation_id` the event
    /// starts a new causal chain.
    pub fn emit(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<Event> {
        match payload {
            serde_json::Value::Object(map) => self.emit_payload(event_type, map, correlation_id),
            _ => Err(EventError::InvalidPayload {
                event_type: event_type.to_string(),
            }),
        }
    }

    /// Enqueue a new event from an already-built payload map
    pub fn emit_payload(
        &self,
        event_type: &str,
        payload: Payload,
        correlation_id: Option<&str>,
    ) -> Result<Event> {
        if event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }
        self.schemas.validate(event_type, &payload)?;

        let event = Event::new(event_type, payload, correlation_id.map(str::to_string));
        self.lock_state()?.queue.push_back(event.clone());

        tracing::debug!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            correlation_id = %event.correlation_id(),
            "Event emitted"
        );
        Ok(event)
    }

    /// Deliver until the queue is empty, including events enqueued
    /// (emitted or retried) while draining
    pub fn process_once(&self) -> Result<ProcessReport> {
        self.drain(None)
    }

    /// Deliver at most `max_events` queued events; the rest stay queued
    pub fn process_batch(&self, max_events: usize) -> Result<ProcessReport> {
        self.drain(Some(max_events))
    }

    fn drain(&self, limit: Option<usize>) -> Result<ProcessReport> {
        let _guard = match DrainGuard::acquire(&self.draining) {
            Some(guard) => guard,
            None => {
                tracing::debug!("Broker already draining, skipping nested process call");
                return Ok(ProcessReport::default());
            }
        };

        let started = Instant::now();
        let mut report = ProcessReport::default();

        loop {
            // Two-phase drain: detach the current queue, deliver it, then pick
            // up whatever handlers and retries appended in the meantime.
            let mut batch: VecDeque<Event> = {
                let mut state = self.lock_state()?;
                match limit {
                    None => std::mem::take(&mut state.queue),
                    Some(max) => {
                        let take = max.saturating_sub(report.attempts()).min(state.queue.len());
                        state.queue.drain(..take).collect()
                    }
                }
            };
            if batch.is_empty() {
                break;
            }

            while let Some(event) = batch.pop_front() {
                if let Err(e) = self.deliver(event, &mut report) {
                    self.requeue_front(batch);
                    return Err(e);
                }
            }
        }

        report.elapsed = started.elapsed();
        if report.attempts() > 0 {
            tracing::debug!(
                delivered = report.delivered,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Queue drained"
            );
        }
        Ok(report)
    }

    /// One delivery attempt: every handler in order
    ///
    /// With retries left, a failure is logged and the remaining handlers
    /// still run; the event is requeued once after the pass. On the last
    /// attempt the first failure dead-letters the event and ends the pass.
    fn deliver(&self, mut event: Event, report: &mut ProcessReport) -> Result<()> {
        let handlers = self.registry.handlers_for(event.event_type())?;
        let last_attempt = should_dead_letter(&event, self.max_retries);

        tracing::debug!(
            event_id = %event.id(),
            event_type = %event.event_type(),
            retry_count = event.retry_count(),
            handlers = handlers.len(),
            "Delivering event"
        );

        let mut failed = 0;
        for registration in &handlers {
            let err = match registration.invoke(&event, self) {
                Ok(()) => continue,
                Err(err) => err,
            };
            failed += 1;

            tracing::warn!(
                event_id = %event.id(),
                event_type = %event.event_type(),
                service = %registration.service(),
                retry_count = event.retry_count(),
                error = %err,
                "Handler failed"
            );

            let mut state = self.lock_state()?;
            self.record_failure(&mut state, &event, registration.service(), &err.to_string());

            if last_attempt {
                let reason = format!("Max retries ({}) exceeded: {}", self.max_retries, err);
                state
                    .dead_letters
                    .push(DeadLetterEvent::new(event, registration.service(), reason));
                report.dead_lettered += 1;
                return Ok(());
            }
        }

        if failed == 0 {
            report.delivered += 1;
            return Ok(());
        }

        event.record_retry();
        tracing::debug!(
            event_id = %event.id(),
            failed_handlers = failed,
            retry_count = event.retry_count(),
            "Event requeued"
        );
        self.lock_state()?.queue.push_back(event);
        report.retried += 1;
        Ok(())
    }

    fn record_failure(&self, state: &mut BrokerState, event: &Event, service: &str, error: &str) {
        state.failures.push_back(DeliveryFailure {
            event: event.clone(),
            service: service.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        if self.failure_capacity > 0 && state.failures.len() > self.failure_capacity {
            let excess = state.failures.len() - self.failure_capacity;
            state.failures.drain(..excess);
        }
    }

    fn requeue_front(&self, batch: VecDeque<Event>) {
        if let Ok(mut state) = self.lock_state() {
            for event in batch.into_iter().rev() {
                state.queue.push_front(event);
            }
        }
    }

    /// Snapshot of the dead-letter sequence, oldest first
    pub fn failed_events(&self) -> Result<Vec<DeadLetterEvent>> {
        Ok(self.lock_state()?.dead_letters.snapshot())
    }

    /// Most recent `limit` dead letters, newest first
    pub fn recent_failed_events(&self, limit: usize) -> Result<Vec<DeadLetterEvent>> {
        Ok(self.lock_state()?.dead_letters.list(limit))
    }

    /// Snapshot of recorded handler failures, oldest first
    ///
    /// Bounded by `failure_log_capacity`; the oldest entries are dropped first.
    pub fn failures(&self) -> Result<Vec<DeliveryFailure>> {
        Ok(self.lock_state()?.failures.iter().cloned().collect())
    }

    /// Snapshot of queued events in delivery order
    pub fn pending(&self) -> Result<Vec<Event>> {
        Ok(self.lock_state()?.queue.iter().cloned().collect())
    }

    pub fn queue_len(&self) -> Result<usize> {
        Ok(self.lock_state()?.queue.len())
    }

    /// Clear queue, failure log and dead letters; registrations stay
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        let dropped = state.queue.len();
        state.queue.clear();
        state.failures.clear();
        state.dead_letters.clear();

        tracing::debug!(dropped, "Broker reset");
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|e| EventError::LockPoisoned(format!("Broker state lock poisoned: {}", e)))
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(&BrokerConfig::default())
    }
}

/// Marks the broker as draining for the lifetime of one process call
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
