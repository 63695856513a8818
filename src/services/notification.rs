//! Notification service: user communications driven by lending events
//!
//! Each notification remembers the event that caused it, so a redelivered
//! event does not notify the user twice.

use crate::broker::Broker;
use crate::error::{EventError, HandlerError, HandlerResult};
use crate::types::{event_types, Event};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

pub const SERVICE_NAME: &str = "notification";

/// Notification kinds, also the keys used by preferences
pub mod kinds {
    pub const WELCOME: &str = "welcome";
    pub const BORROW_CONFIRMATION: &str = "borrow_confirmation";
    pub const RETURN_CONFIRMATION: &str = "return_confirmation";
    pub const LATE_FEE: &str = "late_fee";
    pub const ACCOUNT_SUSPENDED: &str = "account_suspended";
    pub const ACCOUNT_REACTIVATED: &str = "account_reactivated";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub message: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub correlation_id: Option<String>,
    /// Event that triggered this notification, if any
    pub source_event_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub email: String,
    pub name: String,
}

#[derive(Default)]
struct NotificationDb {
    contacts: HashMap<String, Contact>,
    notifications: Vec<Notification>,
    preferences: HashMap<String, HashMap<String, bool>>,
}

#[derive(Default)]
pub struct NotificationService {
    db: Mutex<NotificationDb>,
}

impl NotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `UserRegistered`: remember the contact and send a welcome message
    pub fn handle_user_registered(&self, event: &Event, broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let name = event.opt_str_field("name").unwrap_or("reader");
        let email = event.opt_str_field("email").unwrap_or_default();

        self.db()?.contacts.insert(
            user_id.to_string(),
            Contact {
                email: email.to_string(),
                name: name.to_string(),
            },
        );

        self.notify_for(
            event,
            broker,
            user_id,
            format!("Welcome to the library, {}!", name),
            kinds::WELCOME,
        )
    }

    /// `BookBorrowed`: confirmation with the due date
    pub fn handle_book_borrowed(&self, event: &Event, broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let title = event.str_field("book_title")?;
        let due = event.str_field("due_date")?;

        self.notify_for(
            event,
            broker,
            user_id,
            format!("You borrowed \"{}\". Please return it by {}.", title, display_date(due)),
            kinds::BORROW_CONFIRMATION,
        )
    }

    /// `BookReturned`: confirmation, plus a late-fee notice when one applies
    pub fn handle_book_returned(&self, event: &Event, broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let title = event.str_field("book_title")?;
        let late_fee = event.i64_field("late_fee")?;

        self.notify_for(
            event,
            broker,
            user_id,
            format!("Thanks for returning \"{}\".", title),
            kinds::RETURN_CONFIRMATION,
        )?;

        if late_fee > 0 {
            self.notify_for(
                event,
                broker,
                user_id,
                format!(
                    "\"{}\" was returned late. A fee of ${}.{:02} has been charged.",
                    title,
                    late_fee / 100,
                    late_fee % 100
                ),
                kinds::LATE_FEE,
            )?;
        }
        Ok(())
    }

    pub fn handle_user_suspended(&self, event: &Event, broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let reason = event.opt_str_field("reason").unwrap_or("no reason given");

        self.notify_for(
            event,
            broker,
            user_id,
            format!("Your account has been suspended: {}.", reason),
            kinds::ACCOUNT_SUSPENDED,
        )
    }

    pub fn handle_user_reactivated(&self, event: &Event, broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        self.notify_for(
            event,
            broker,
            user_id,
            "Your account is active again.".to_string(),
            kinds::ACCOUNT_REACTIVATED,
        )
    }

    fn notify_for(
        &self,
        event: &Event,
        broker: &Broker,
        user_id: &str,
        message: String,
        kind: &str,
    ) -> HandlerResult {
        let already_sent = self.db()?.notifications.iter().any(|n| {
            n.source_event_id.as_deref() == Some(event.id()) && n.notification_type == kind
        });
        if already_sent {
            tracing::debug!(event_id = %event.id(), kind, "Notification already sent for event");
            return Ok(());
        }

        self.deliver(
            broker,
            user_id,
            message,
            kind,
            Some(event.correlation_id()),
            Some(event.id()),
        )?;
        Ok(())
    }

    /// Store a notification and announce it with `NotificationSent`
    ///
    /// Returns `None` when the user opted out of this kind.
    pub fn send_notification(
        &self,
        broker: &Broker,
        user_id: &str,
        message: &str,
        kind: &str,
        correlation_id: Option<&str>,
    ) -> Result<Option<Notification>, EventError> {
        self.deliver(broker, user_id, message.to_string(), kind, correlation_id, None)
    }

    fn deliver(
        &self,
        broker: &Broker,
        user_id: &str,
        message: String,
        kind: &str,
        correlation_id: Option<&str>,
        source_event_id: Option<&str>,
    ) -> Result<Option<Notification>, EventError> {
        let notification = {
            let mut db = self.lock_db()?;
            let opted_out = db
                .preferences
                .get(user_id)
                .and_then(|prefs| prefs.get(kind))
                .is_some_and(|enabled| !enabled);
            if opted_out {
                tracing::debug!(user_id, kind, "Notification suppressed by preferences");
                return Ok(None);
            }

            let notification = Notification {
                id: format!("ntf-{}", uuid::Uuid::new_v4()),
                user_id: user_id.to_string(),
                message,
                notification_type: kind.to_string(),
                correlation_id: correlation_id.map(str::to_string),
                source_event_id: source_event_id.map(str::to_string),
                sent_at: Utc::now(),
            };
            db.notifications.push(notification.clone());
            notification
        };

        broker.emit(
            event_types::NOTIFICATION_SENT,
            json!({
                "notification_id": notification.id,
                "user_id": notification.user_id,
                "notification_type": notification.notification_type,
            }),
            correlation_id,
        )?;
        tracing::info!(user_id, kind, "Notification sent");
        Ok(Some(notification))
    }

    /// All notifications for a user, in send order
    pub fn user_notifications(&self, user_id: &str) -> Result<Vec<Notification>, EventError> {
        Ok(self
            .lock_db()?
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    pub fn contact(&self, user_id: &str) -> Result<Option<Contact>, EventError> {
        Ok(self.lock_db()?.contacts.get(user_id).cloned())
    }

    /// Merge per-kind opt-in flags for a user; unspecified kinds stay enabled
    pub fn set_preferences(
        &self,
        user_id: &str,
        preferences: HashMap<String, bool>,
    ) -> Result<(), EventError> {
        self.lock_db()?
            .preferences
            .entry(user_id.to_string())
            .or_default()
            .extend(preferences);
        Ok(())
    }

    pub fn preferences(&self, user_id: &str) -> Result<HashMap<String, bool>, EventError> {
        Ok(self
            .lock_db()?
            .preferences
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn clear(&self) -> Result<(), EventError> {
        *self.lock_db()? = NotificationDb::default();
        Ok(())
    }

    fn db(&self) -> Result<MutexGuard<'_, NotificationDb>, HandlerError> {
        Ok(self.lock_db()?)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, NotificationDb>, EventError> {
        self.db.lock().map_err(|e| {
            EventError::LockPoisoned(format!("Notification state lock poisoned: {}", e))
        })
    }
}

/// `2024-02-01T00:00:00+00:00` → `2024-02-01`; anything unparsable is shown as-is
fn display_date(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|_| raw.to_string())
}
