//! # a3s-lending
//!
//! In-process event broker with retry and dead-letter routing, plus the
//! library-lending services that run on top of it.
//!
//! ## Overview
//!
//! Domain workflows change state and then `emit` an event. Emission only
//! enqueues; `process_once` delivers queued events to every handler
//! registered for their type, in registration order. A failing handler sends
//! the event back to the tail of the queue until the retry budget runs out,
//! after which it lands in the dead-letter queue.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_lending::{Broker, Event};
//! use serde_json::json;
//!
//! # fn example() -> a3s_lending::Result<()> {
//! let broker = Broker::with_max_retries(3);
//!
//! broker.register("UserRegistered", "welcome", |event: &Event, _: &Broker| {
//!     println!("welcome {}", event.payload()["user_id"]);
//!     Ok(())
//! })?;
//!
//! broker.emit("UserRegistered", json!({"user_id": "u1"}), None)?;
//! let report = broker.process_once()?;
//! assert_eq!(report.delivered, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Broker**: queue, delivery, retry and dead-letter routing
//! - **HandlerRegistry**: event type to ordered handlers
//! - **SchemaRegistry**: required payload keys per event type
//! - **DeadLetterQueue** trait: storage for events that exhausted retries
//! - **BrokerPump**: optional tokio task draining the broker on an interval
//! - **LendingSystem**: broker with library, notification, analytics and
//!   audit services wired together

pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod pump;
pub mod registry;
pub mod schema;
pub mod services;
pub mod system;
pub mod types;

// Re-export core types
pub use broker::Broker;
pub use config::{AuditConfig, BrokerConfig, LibraryConfig, SystemConfig};
pub use dlq::{DeadLetterEvent, DeadLetterQueue, MemoryDeadLetterQueue};
pub use error::{EventError, HandlerError, HandlerResult, LibraryError, Result};
pub use pump::BrokerPump;
pub use registry::{EventHandler, HandlerRegistry, Registration};
pub use schema::{PayloadSchema, SchemaRegistry};
pub use system::LendingSystem;
pub use types::{event_types, DeliveryFailure, Event, Payload, ProcessReport};
