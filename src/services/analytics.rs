//! Analytics service: usage tracking and reports
//!
//! Consumes lending events into a flat list of tracked events plus a few
//! running counters. Reports are computed from the tracked list on demand.

use crate::broker::Broker;
use crate::error::{EventError, HandlerError, HandlerResult};
use crate::types::{event_types, Event};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub const SERVICE_NAME: &str = "analytics";

/// Counter names kept in `metrics()`
pub mod metrics {
    pub const TOTAL_BORROWS: &str = "total_borrows";
    pub const TOTAL_RETURNS: &str = "total_returns";
    pub const TOTAL_USERS: &str = "total_users";
    pub const TOTAL_BOOKS: &str = "total_books";
    pub const NOTIFICATIONS_SENT: &str = "notifications_sent";
    pub const LATE_RETURNS: &str = "late_returns";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedKind {
    UserRegistered,
    BookAdded,
    BookBorrowed,
    BookReturned,
    NotificationSent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedEvent {
    pub kind: TrackedKind,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub book_id: Option<String>,
    pub book_title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookPopularity {
    pub book_id: String,
    pub title: Option<String>,
    pub borrow_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_borrows: usize,
    pub total_returns: usize,
    pub new_users: usize,
    /// Distinct users who borrowed or returned in the period
    pub active_users: usize,
    pub popular_books: Vec<BookPopularity>,
}

/// Processing time statistics for one event type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerformanceStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl PerformanceStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count as u32
    }
}

#[derive(Default)]
struct AnalyticsDb {
    events: Vec<TrackedEvent>,
    metrics: BTreeMap<String, i64>,
    processed: HashSet<(String, TrackedKind)>,
    performance: HashMap<String, PerformanceStats>,
}

#[derive(Default)]
pub struct AnalyticsService {
    db: Mutex<AnalyticsDb>,
}

impl AnalyticsService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_user_registered(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        self.track(event, TrackedKind::UserRegistered, Some(user_id), None, None, &[metrics::TOTAL_USERS])
    }

    pub fn handle_book_added(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let book_id = event.str_field("book_id")?;
        let title = event.opt_str_field("title");
        self.track(event, TrackedKind::BookAdded, None, Some(book_id), title, &[metrics::TOTAL_BOOKS])
    }

    pub fn handle_book_borrowed(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let book_id = event.str_field("book_id")?;
        let title = event.opt_str_field("book_title");
        self.track(
            event,
            TrackedKind::BookBorrowed,
            Some(user_id),
            Some(book_id),
            title,
            &[metrics::TOTAL_BORROWS],
        )
    }

    pub fn handle_book_returned(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let user_id = event.str_field("user_id")?;
        let book_id = event.str_field("book_id")?;
        let title = event.opt_str_field("book_title");
        let late = event.payload().get("days_late").and_then(|v| v.as_i64()).unwrap_or(0) > 0;

        let counters: &[&str] = if late {
            &[metrics::TOTAL_RETURNS, metrics::LATE_RETURNS]
        } else {
            &[metrics::TOTAL_RETURNS]
        };
        self.track(event, TrackedKind::BookReturned, Some(user_id), Some(book_id), title, counters)
    }

    pub fn handle_notification_sent(&self, event: &Event, _broker: &Broker) -> HandlerResult {
        let user_id = event.opt_str_field("user_id");
        self.track(event, TrackedKind::NotificationSent, user_id, None, None, &[metrics::NOTIFICATIONS_SENT])
    }

    fn track(
        &self,
        event: &Event,
        kind: TrackedKind,
        user_id: Option<&str>,
        book_id: Option<&str>,
        book_title: Option<&str>,
        counters: &[&str],
    ) -> HandlerResult {
        let mut db = self.db()?;
        if !db.processed.insert((event.id().to_string(), kind)) {
            return Ok(());
        }

        db.events.push(TrackedEvent {
            kind,
            timestamp: occurred_at(event),
            user_id: user_id.map(str::to_string),
            book_id: book_id.map(str::to_string),
            book_title: book_title.map(str::to_string),
        });
        for counter in counters {
            *db.metrics.entry(counter.to_string()).or_insert(0) += 1;
        }
        Ok(())
    }

    pub fn events(&self) -> Result<Vec<TrackedEvent>, EventError> {
        Ok(self.lock_db()?.events.clone())
    }

    pub fn metrics(&self) -> Result<BTreeMap<String, i64>, EventError> {
        Ok(self.lock_db()?.metrics.clone())
    }

    /// Current value of a counter, zero when never incremented
    pub fn metric(&self, name: &str) -> Result<i64, EventError> {
        Ok(self.lock_db()?.metrics.get(name).copied().unwrap_or(0))
    }

    /// Usage between two dates, both inclusive
    pub fn usage_report(&self, start: NaiveDate, end: NaiveDate) -> Result<UsageReport, EventError> {
        let db = self.lock_db()?;
        let in_range: Vec<&TrackedEvent> = db
            .events
            .iter()
            .filter(|e| {
                let day = e.timestamp.date_naive();
                day >= start && day <= end
            })
            .collect();

        let count = |kind: TrackedKind| in_range.iter().filter(|e| e.kind == kind).count();
        let active_users: HashSet<&str> = in_range
            .iter()
            .filter(|e| matches!(e.kind, TrackedKind::BookBorrowed | TrackedKind::BookReturned))
            .filter_map(|e| e.user_id.as_deref())
            .collect();

        Ok(UsageReport {
            start,
            end,
            total_borrows: count(TrackedKind::BookBorrowed),
            total_returns: count(TrackedKind::BookReturned),
            new_users: count(TrackedKind::UserRegistered),
            active_users: active_users.len(),
            popular_books: popularity(in_range.into_iter()),
        })
    }

    /// Books ranked by borrow count, most borrowed first
    pub fn book_popularity(&self) -> Result<Vec<BookPopularity>, EventError> {
        let db = self.lock_db()?;
        Ok(popularity(db.events.iter()))
    }

    /// Record how long processing an event type took
    pub fn track_processing_time(&self, event_type: &str, elapsed: Duration) -> Result<(), EventError> {
        let mut db = self.lock_db()?;
        let stats = db.performance.entry(event_type.to_string()).or_default();
        stats.count += 1;
        stats.total += elapsed;
        stats.max = stats.max.max(elapsed);
        Ok(())
    }

    pub fn performance(&self, event_type: &str) -> Result<Option<PerformanceStats>, EventError> {
        Ok(self.lock_db()?.performance.get(event_type).cloned())
    }

    pub fn clear(&self) -> Result<(), EventError> {
        *self.lock_db()? = AnalyticsDb::default();
        Ok(())
    }

    fn db(&self) -> Result<MutexGuard<'_, AnalyticsDb>, HandlerError> {
        Ok(self.lock_db()?)
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, AnalyticsDb>, EventError> {
        self.db
            .lock()
            .map_err(|e| EventError::LockPoisoned(format!("Analytics state lock poisoned: {}", e)))
    }
}

/// Business time of an event: the borrow/return date when present,
/// otherwise the emission timestamp
fn occurred_at(event: &Event) -> DateTime<Utc> {
    let key = match event.event_type() {
        event_types::BOOK_BORROWED => "borrowed_date",
        event_types::BOOK_RETURNED => "returned_date",
        event_types::USER_REGISTERED => "registered_at",
        _ => return event.timestamp(),
    };
    event
        .opt_str_field(key)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|| event.timestamp())
}

fn popularity<'a>(events: impl Iterator<Item = &'a TrackedEvent>) -> Vec<BookPopularity> {
    let mut counts: HashMap<&str, (Option<&str>, usize)> = HashMap::new();
    for e in events.filter(|e| e.kind == TrackedKind::BookBorrowed) {
        if let Some(book_id) = e.book_id.as_deref() {
            let entry = counts.entry(book_id).or_insert((None, 0));
            entry.0 = entry.0.or(e.book_title.as_deref());
            entry.1 += 1;
        }
    }

    let mut ranked: Vec<BookPopularity> = counts
        .into_iter()
        .map(|(book_id, (title, borrow_count))| BookPopularity {
            book_id: book_id.to_string(),
            title: title.map(str::to_string),
            borrow_count,
        })
        .collect();
    ranked.sort_by(|a, b| b.borrow_count.cmp(&a.borrow_count).then_with(|| a.book_id.cmp(&b.book_id)));
    ranked
}
