//! Payload schema registry: documented required keys per event type
//!
//! Payloads stay schema-less maps; a registered schema only lists the
//! top-level keys consumers rely on. The broker checks them at emission so
//! a malformed event is rejected before it reaches any handler.

use crate::error::{EventError, Result};
use crate::types::{event_types, Payload};
use std::collections::HashMap;
use std::sync::RwLock;

/// Required payload keys for one event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSchema {
    pub event_type: String,

    /// Required top-level fields in the payload
    pub required_fields: Vec<String>,

    pub description: String,
}

impl PayloadSchema {
    pub fn new(event_type: impl Into<String>, required_fields: &[&str]) -> Self {
        Self {
            event_type: event_type.into(),
            required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// In-memory schema registry
///
/// Event types without a schema pass validation untouched.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, PayloadSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the lending system's payload contracts
    pub fn lending() -> Self {
        let registry = Self::new();
        let schemas = [
            PayloadSchema::new(event_types::BOOK_ADDED, &["book_id", "isbn", "title", "author", "copies"])
                .with_description("A title entered the catalogue"),
            PayloadSchema::new(event_types::USER_REGISTERED, &["user_id", "email", "name"])
                .with_description("A patron account was created"),
            PayloadSchema::new(event_types::BOOK_BORROWED, &["user_id", "book_id", "book_title", "due_date"])
                .with_description("A copy left the library"),
            PayloadSchema::new(event_types::BOOK_RETURNED, &["user_id", "book_id", "book_title", "late_fee"])
                .with_description("A copy came back"),
            PayloadSchema::new(event_types::USER_SUSPENDED, &["user_id", "reason"]),
            PayloadSchema::new(event_types::USER_REACTIVATED, &["user_id"]),
            PayloadSchema::new(event_types::NOTIFICATION_SENT, &["user_id", "notification_type"]),
        ];
        {
            let mut map = registry.schemas.write().unwrap_or_else(|e| e.into_inner());
            for schema in schemas {
                map.insert(schema.event_type.clone(), schema);
            }
        }
        registry
    }

    /// Register or replace the schema for an event type
    pub fn register(&self, schema: PayloadSchema) -> Result<()> {
        if schema.event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }

        let mut schemas = self.schemas.write().map_err(|e| {
            EventError::LockPoisoned(format!("Schema registry lock poisoned: {}", e))
        })?;
        schemas.insert(schema.event_type.clone(), schema);
        Ok(())
    }

    pub fn get(&self, event_type: &str) -> Result<Option<PayloadSchema>> {
        let schemas = self.schemas.read().map_err(|e| {
            EventError::LockPoisoned(format!("Schema registry lock poisoned: {}", e))
        })?;
        Ok(schemas.get(event_type).cloned())
    }

    /// Check a payload against the schema for its event type
    pub fn validate(&self, event_type: &str, payload: &Payload) -> Result<()> {
        let schemas = self.schemas.read().map_err(|e| {
            EventError::LockPoisoned(format!("Schema registry lock poisoned: {}", e))
        })?;

        let schema = match schemas.get(event_type) {
            Some(s) => s,
            None => return Ok(()),
        };

        for field in &schema.required_fields {
            if !payload.contains_key(field) {
                return Err(EventError::SchemaValidation {
                    event_type: event_type.to_string(),
                    reason: format!("Missing required field '{}'", field),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::payload_from;
    use serde_json::json;

    #[test]
    fn test_unregistered_type_passes() {
        let registry = SchemaRegistry::new();
        let payload = payload_from(json!({})).unwrap();
        assert!(registry.validate("Anything", &payload).is_ok());
    }

    #[test]
    fn test_missing_field_rejected() {
        let registry = SchemaRegistry::new();
        registry
            .register(PayloadSchema::new("UserRegistered", &["user_id", "email"]))
            .unwrap();

        let ok = payload_from(json!({"user_id": "u1", "email": "a@b.io"})).unwrap();
        assert!(registry.validate("UserRegistered", &ok).is_ok());

        let bad = payload_from(json!({"user_id": "u1"})).unwrap();
        let err = registry.validate("UserRegistered", &bad).unwrap_err();
        match err {
            EventError::SchemaValidation { event_type, reason } => {
                assert_eq!(event_type, "UserRegistered");
                assert!(reason.contains("email"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_register_replaces() {
        let registry = SchemaRegistry::new();
        registry.register(PayloadSchema::new("E", &["a"])).unwrap();
        registry.register(PayloadSchema::new("E", &["b"])).unwrap();
        assert_eq!(registry.get("E").unwrap().unwrap().required_fields, vec!["b"]);
    }

    #[test]
    fn test_register_empty_type_rejected() {
        let registry = SchemaRegistry::new();
        assert!(registry.register(PayloadSchema::new("", &[])).is_err());
    }

    #[test]
    fn test_lending_schemas_cover_known_types() {
        let registry = SchemaRegistry::lending();
        for event_type in event_types::ALL {
            assert!(registry.get(event_type).unwrap().is_some(), "{event_type}");
        }
    }
}
