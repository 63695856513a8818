//! Error types for a3s-lending

use thiserror::Error;

/// Errors raised by the broker and its supporting registries
#[derive(Debug, Error)]
pub enum EventError {
    /// Event type was empty
    #[error("Event type cannot be empty")]
    EmptyEventType,

    /// Payload was not a JSON object
    #[error("Payload for event type '{event_type}' must be a JSON object")]
    InvalidPayload { event_type: String },

    /// Payload is missing keys documented for its event type
    #[error("Schema validation failed for event type '{event_type}': {reason}")]
    SchemaValidation { event_type: String, reason: String },

    /// Shared state lock was poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Background pump failure
    #[error("Pump error: {0}")]
    Pump(String),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, EventError>;

/// Failure signalled by an event handler during delivery
///
/// Never propagates to the emitter: the broker records it and applies the
/// retry / dead-letter policy.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload lacked a key the handler needs
    #[error("Missing payload field '{field}' in {event_type}")]
    MissingField { event_type: String, field: String },

    /// Payload field had an unexpected JSON type
    #[error("Payload field '{field}' in {event_type} has wrong type (expected {expected})")]
    WrongType {
        event_type: String,
        field: String,
        expected: &'static str,
    },

    /// Follow-up emission from inside the handler failed
    #[error("Follow-up emission failed: {0}")]
    Emit(#[from] EventError),

    /// Any other handler-specific failure
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Build a free-form handler failure
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Result type returned by event handlers
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Validation errors from the library domain
///
/// Reported synchronously before any event is emitted and never retried.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid email format: {0}")]
    InvalidEmail(String),

    #[error("A user with email {0} is already registered")]
    DuplicateEmail(String),

    #[error("A book with ISBN {0} already exists")]
    DuplicateIsbn(String),

    #[error("Book not found: {0}")]
    BookNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User {0} is suspended")]
    UserSuspended(String),

    #[error("User {0} is not suspended")]
    UserNotSuspended(String),

    #[error("Book {0} is not available")]
    NotAvailable(String),

    #[error("User {user_id} has reached the borrowing limit of {limit}")]
    BorrowLimitReached { user_id: String, limit: usize },

    #[error("Book {book_id} is not borrowed by user {user_id}")]
    NotBorrowed { user_id: String, book_id: String },

    /// State changed but the follow-up event could not be emitted
    #[error(transparent)]
    Event(#[from] EventError),
}
