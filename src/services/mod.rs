//! Lending domain services
//!
//! `library` emits events; `notification`, `analytics` and `audit` consume
//! them through handlers registered on the broker.

pub mod analytics;
pub mod audit;
pub mod library;
pub mod notification;

pub use analytics::AnalyticsService;
pub use audit::AuditService;
pub use library::LibraryService;
pub use notification::NotificationService;
