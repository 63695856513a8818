//! Audit service: append-only event log, trails, replay and anomaly checks
//!
//! Registered for every known event type. The log is the only state; trails,
//! snapshots and reconstructed state are all derived from it.

use crate::broker::Broker;
use crate::config::AuditConfig;
use crate::error::{EventError, HandlerError, HandlerResult};
use crate::types::{event_types, Event, Payload};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub const SERVICE_NAME: &str = "audit";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub event_id: String,
    pub event_type: String,
    pub payload: Payload,
    pub correlation_id: String,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// When the audit service saw it
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayedBook {
    pub title: String,
    pub total_copies: i64,
    pub available_copies: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayedUser {
    pub name: String,
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveLoan {
    pub user_id: String,
    pub book_id: String,
}

/// Lending state rebuilt purely from the audit log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayedState {
    pub books: BTreeMap<String, ReplayedBook>,
    pub users: BTreeMap<String, ReplayedUser>,
    pub active_loans: Vec<ActiveLoan>,
    pub events_applied: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total_events: usize,
    pub events_by_type: BTreeMap<String, usize>,
    pub state: ReplayedState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A user borrowed at least the configured threshold of books
    ExcessiveBorrowing { user_id: String, borrow_count: usize },
    /// A return arrived with no matching open borrow in the log
    ReturnWithoutBorrow {
        user_id: String,
        book_id: String,
        event_id: String,
    },
}

#[derive(Default)]
struct AuditDb {
    entries: Vec<AuditEntry>,
    seen: HashSet<String>,
}

pub struct AuditService {
    config: AuditConfig,
    db: Mutex<AuditDb>,
}

impl AuditService {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            db: Mutex::new(AuditDb::default()),
        }
    }

    /// Universal handler: record any event once, keyed by event id
    pub fn handle_event(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let mut db = self.db()?;
        if !db.seen.insert(event.id().to_string()) {
            return Ok(());
        }

        db.entries.push(AuditEntry {
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            payload: event.payload().clone(),
            correlation_id: event.correlation_id().to_string(),
            timestamp: event.timestamp(),
            recorded_at: Utc::now(),
        });
        tracing::debug!(event_id = %event.id(), event_type = %event.event_type(), "Event audited");
        Ok(())
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>, EventError> {
        Ok(self.lock_db()?.entries.clone())
    }

    /// Chronological history of one entity, matched on the `<entity>_id`
    /// payload key (`audit_trail("user", "user-1")` matches `user_id`)
    pub fn audit_trail(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditEntry>, EventError> {
        let key = format!("{}_id", entity_type);
        let mut trail: Vec<AuditEntry> = self
            .lock_db()?
            .entries
            .iter()
            .filter(|e| e.payload.get(&key).and_then(|v| v.as_str()) == Some(entity_id))
            .cloned()
            .collect();
        trail.sort_by_key(|e| e.timestamp);
        Ok(trail)
    }

    /// Every audited event of one causal chain, in log order
    pub fn correlation_trail(&self, correlation_id: &str) -> Result<Vec<AuditEntry>, EventError> {
        Ok(self
            .lock_db()?
            .entries
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect())
    }

    pub fn snapshot(&self) -> Result<AuditSnapshot, EventError> {
        let entries = self.sorted_entries()?;
        let mut events_by_type = BTreeMap::new();
        for entry in &entries {
            *events_by_type.entry(entry.event_type.clone()).or_insert(0) += 1;
        }

        Ok(AuditSnapshot {
            taken_at: Utc::now(),
            total_events: entries.len(),
            events_by_type,
            state: replay(&entries).0,
        })
    }

    /// Replay every event emitted at or before `until`
    pub fn reconstruct_until(&self, until: DateTime<Utc>) -> Result<ReplayedState, EventError> {
        let entries: Vec<AuditEntry> = self
            .sorted_entries()?
            .into_iter()
            .filter(|e| e.timestamp <= until)
            .collect();
        Ok(replay(&entries).0)
    }

    pub fn detect_anomalies(&self) -> Result<Vec<Anomaly>, EventError> {
        let entries = self.sorted_entries()?;
        let (_, mut anomalies) = replay(&entries);

        let mut borrows: HashMap<&str, usize> = HashMap::new();
        for entry in entries.iter().filter(|e| e.event_type == event_types::BOOK_BORROWED) {
            if let Some(user_id) = entry.payload.get("user_id").and_then(|v| v.as_str()) {
                *borrows.entry(user_id).or_insert(0) += 1;
            }
        }

        let threshold = self.config.anomaly_borrow_threshold;
        let mut heavy: Vec<(&str, usize)> = borrows
            .into_iter()
            .filter(|(_, count)| threshold > 0 && *count >= threshold)
            .collect();
        heavy.sort();
        anomalies.extend(heavy.into_iter().map(|(user_id, borrow_count)| {
            Anomaly::ExcessiveBorrowing {
                user_id: user_id.to_string(),
                borrow_count,
            }
        }));

        for anomaly in &anomalies {
            tracing::warn!(?anomaly, "Audit anomaly detected");
        }
        Ok(anomalies)
    }

    pub fn clear(&self) -> Result<(), EventError> {
        *self.lock_db()? = AuditDb::default();
        Ok(())
    }

    fn sorted_entries(&self) -> Result<Vec<AuditEntry>, EventError> {
        let mut entries = self.entries()?;
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    fn db(&self) -> Result<MutexGuard<'_, AuditDb>, HandlerError> {
        Ok(self.lock_db()?)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, AuditDb>, EventError> {
        self.db
            .lock()
            .map_err(|e| EventError::LockPoisoned(format!("Audit state lock poisoned: {}", e)))
    }
}

/// Fold entries (already in time order) into lending state, collecting
/// returns that match no open loan
fn replay(entries: &[AuditEntry]) -> (ReplayedState, Vec<Anomaly>) {
    let mut state = ReplayedState::default();
    let mut anomalies = Vec::new();

    for entry in entries {
        let field = |key: &str| {
            entry
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        match entry.event_type.as_str() {
            event_types::BOOK_ADDED => {
                let copies = entry.payload.get("copies").and_then(|v| v.as_i64()).unwrap_or(0);
                state.books.insert(
                    field("book_id"),
                    ReplayedBook {
                        title: field("title"),
                        total_copies: copies,
                        available_copies: copies,
                    },
                );
            }
            event_types::USER_REGISTERED => {
                state.users.insert(
                    field("user_id"),
                    ReplayedUser {
                        name: field("name"),
                        suspended: false,
                    },
                );
            }
            event_types::USER_SUSPENDED | event_types::USER_REACTIVATED => {
                if let Some(user) = state.users.get_mut(&field("user_id")) {
                    user.suspended = entry.event_type == event_types::USER_SUSPENDED;
                }
            }
            event_types::BOOK_BORROWED => {
                let (user_id, book_id) = (field("user_id"), field("book_id"));
                if let Some(book) = state.books.get_mut(&book_id) {
                    book.available_copies -= 1;
                }
                state.active_loans.push(ActiveLoan { user_id, book_id });
            }
            event_types::BOOK_RETURNED => {
                let (user_id, book_id) = (field("user_id"), field("book_id"));
                let open = state
                    .active_loans
                    .iter()
                    .position(|l| l.user_id == user_id && l.book_id == book_id);
                match open {
                    Some(index) => {
                        state.active_loans.remove(index);
                        if let Some(book) = state.books.get_mut(&book_id) {
                            book.available_copies += 1;
                        }
                    }
                    None => anomalies.push(Anomaly::ReturnWithoutBorrow {
                        user_id,
                        book_id,
                        event_id: entry.event_id.clone(),
                    }),
                }
            }
            _ => {}
        }
        state.events_applied += 1;
    }

    (state, anomalies)
}
