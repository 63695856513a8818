//! Handler registry: event type to ordered subscriber list
//!
//! Registration order is delivery order. There is no duplicate detection:
//! registering the same handler twice means it runs twice per delivery.

use crate::broker::Broker;
use crate::error::{EventError, HandlerResult, Result};
use crate::types::Event;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A consumer of delivered events
///
/// Handlers receive the broker so they can chain follow-up events that
/// carry the same correlation id. Redelivery re-invokes every handler of
/// an event, so implementations should be idempotent.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event, broker: &Broker) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&Event, &Broker) -> HandlerResult + Send + Sync,
{
    fn handle(&self, event: &Event, broker: &Broker) -> HandlerResult {
        self(event, broker)
    }
}

/// A handler together with the service that registered it
#[derive(Clone)]
pub struct Registration {
    service: String,
    handler: Arc<dyn EventHandler>,
}

impl Registration {
    /// Name of the owning service, used to identify failures
    pub fn service(&self) -> &str {
        &self.service
    }

    pub(crate) fn invoke(&self, event: &Event, broker: &Broker) -> HandlerResult {
        self.handler.handle(event, broker)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Process-wide map of event type → ordered handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `event_type`, creating the list if absent
    pub fn register(
        &self,
        event_type: &str,
        service: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        if event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }

        let mut handlers = self.handlers.write().map_err(|e| {
            EventError::LockPoisoned(format!("Handler registry lock poisoned: {}", e))
        })?;
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push(Registration {
                service: service.to_string(),
                handler,
            });

        tracing::debug!(event_type, service, "Handler registered");
        Ok(())
    }

    /// Snapshot of handlers for `event_type` in registration order
    ///
    /// Empty when nothing is registered; that is not an error.
    pub fn handlers_for(&self, event_type: &str) -> Result<Vec<Registration>> {
        let handlers = self.handlers.read().map_err(|e| {
            EventError::LockPoisoned(format!("Handler registry lock poisoned: {}", e))
        })?;
        Ok(handlers.get(event_type).cloned().unwrap_or_default())
    }

    pub fn handler_count(&self, event_type: &str) -> Result<usize> {
        Ok(self.handlers_for(event_type)?.len())
    }

    /// Event types with at least one handler, sorted
    pub fn registered_types(&self) -> Result<Vec<String>> {
        let handlers = self.handlers.read().map_err(|e| {
            EventError::LockPoisoned(format!("Handler registry lock poisoned: {}", e))
        })?;
        let mut types: Vec<String> = handlers
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        Ok(types)
    }
}
