//! Library service: books, users and borrowings
//!
//! Every workflow validates and mutates state first, then emits exactly one
//! event. Validation failures return a `LibraryError` and emit nothing.

use crate::broker::Broker;
use crate::config::LibraryConfig;
use crate::error::{EventError, LibraryError};
use crate::types::{event_types, Event};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const SERVICE_NAME: &str = "library";

type Result<T> = std::result::Result<T, LibraryError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Book {
    pub id: String,
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub total_copies: u32,
    pub available_copies: u32,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    #[default]
    Standard,
    Premium,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Standard => "standard",
            UserType::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub user_type: UserType,
    pub status: UserStatus,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Borrowing {
    pub id: String,
    pub user_id: String,
    pub book_id: String,
    pub borrowed_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub returned_date: Option<DateTime<Utc>>,
    /// Late fee charged on return, in cents
    pub late_fee: i64,
}

#[derive(Default)]
struct LibraryDb {
    books: HashMap<String, Book>,
    users: HashMap<String, User>,
    borrowings: Vec<Borrowing>,
}

/// Core lending domain; emits events through the shared broker
pub struct LibraryService {
    broker: Arc<Broker>,
    config: LibraryConfig,
    db: Mutex<LibraryDb>,
}

impl LibraryService {
    pub fn new(broker: Arc<Broker>, config: LibraryConfig) -> Self {
        Self {
            broker,
            config,
            db: Mutex::new(LibraryDb::default()),
        }
    }

    /// Catalogue a new title with `copies` copies
    pub fn add_book(&self, isbn: &str, title: &str, author: &str, copies: u32) -> Result<Book> {
        let (isbn, title, author) = (isbn.trim(), title.trim(), author.trim());
        if isbn.is_empty() || title.is_empty() || author.is_empty() {
            return Err(LibraryError::InvalidInput(
                "ISBN, title and author are required".to_string(),
            ));
        }
        if copies == 0 {
            return Err(LibraryError::InvalidInput(
                "A book needs at least one copy".to_string(),
            ));
        }

        let book = {
            let mut db = self.db()?;
            if db.books.values().any(|b| b.isbn == isbn) {
                return Err(LibraryError::DuplicateIsbn(isbn.to_string()));
            }
            let book = Book {
                id: format!("book-{}", uuid::Uuid::new_v4()),
                isbn: isbn.to_string(),
                title: title.to_string(),
                author: author.to_string(),
                total_copies: copies,
                available_copies: copies,
                added_at: Utc::now(),
            };
            db.books.insert(book.id.clone(), book.clone());
            book
        };

        self.emit(
            event_types::BOOK_ADDED,
            json!({
                "book_id": book.id,
                "isbn": book.isbn,
                "title": book.title,
                "author": book.author,
                "copies": book.total_copies,
            }),
        )?;
        tracing::info!(book_id = %book.id, isbn = %book.isbn, "Book added");
        Ok(book)
    }

    pub fn register_user(&self, email: &str, name: &str, user_type: UserType) -> Result<User> {
        let (email, name) = (email.trim(), name.trim());
        if name.is_empty() {
            return Err(LibraryError::InvalidInput("Name is required".to_string()));
        }
        if !is_valid_email(email) {
            return Err(LibraryError::InvalidEmail(email.to_string()));
        }

        let user = {
            let mut db = self.db()?;
            if db.users.values().any(|u| u.email.eq_ignore_ascii_case(email)) {
                return Err(LibraryError::DuplicateEmail(email.to_string()));
            }
            let user = User {
                id: format!("user-{}", uuid::Uuid::new_v4()),
                email: email.to_string(),
                name: name.to_string(),
                user_type,
                status: UserStatus::Active,
                registered_at: Utc::now(),
            };
            db.users.insert(user.id.clone(), user.clone());
            user
        };

        self.emit(
            event_types::USER_REGISTERED,
            json!({
                "user_id": user.id,
                "email": user.email,
                "name": user.name,
                "user_type": user.user_type.as_str(),
                "registered_at": user.registered_at.to_rfc3339(),
            }),
        )?;
        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    pub fn borrow_book(&self, user_id: &str, book_id: &str) -> Result<Borrowing> {
        self.borrow_book_at(user_id, book_id, Utc::now())
    }

    /// Borrow with an explicit clock reading
    pub fn borrow_book_at(
        &self,
        user_id: &str,
        book_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Borrowing> {
        let due_date = self.due_date(now)?;
        let (borrowing, payload) = {
            let mut db = self.db()?;
            let user = db
                .users
                .get(user_id)
                .cloned()
                .ok_or_else(|| LibraryError::UserNotFound(user_id.to_string()))?;
            if user.status == UserStatus::Suspended {
                return Err(LibraryError::UserSuspended(user_id.to_string()));
            }

            let limit = match user.user_type {
                UserType::Standard => self.config.max_borrowings,
                UserType::Premium => self.config.premium_max_borrowings,
            };
            let open = db
                .borrowings
                .iter()
                .filter(|b| b.user_id == user_id && b.returned_date.is_none())
                .count();
            if open >= limit {
                return Err(LibraryError::BorrowLimitReached {
                    user_id: user_id.to_string(),
                    limit,
                });
            }

            let book = db
                .books
                .get_mut(book_id)
                .ok_or_else(|| LibraryError::BookNotFound(book_id.to_string()))?;
            if book.available_copies == 0 {
                return Err(LibraryError::NotAvailable(book_id.to_string()));
            }
            book.available_copies -= 1;
            let book = book.clone();

            let borrowing = Borrowing {
                id: format!("loan-{}", uuid::Uuid::new_v4()),
                user_id: user.id.clone(),
                book_id: book.id.clone(),
                borrowed_date: now,
                due_date,
                returned_date: None,
                late_fee: 0,
            };
            db.borrowings.push(borrowing.clone());

            let payload = json!({
                "borrowing_id": borrowing.id,
                "user_id": user.id,
                "user_name": user.name,
                "user_email": user.email,
                "book_id": book.id,
                "book_title": book.title,
                "isbn": book.isbn,
                "borrowed_date": borrowing.borrowed_date.to_rfc3339(),
                "due_date": borrowing.due_date.to_rfc3339(),
                "available_copies": book.available_copies,
            });
            (borrowing, payload)
        };

        self.emit(event_types::BOOK_BORROWED, payload)?;
        tracing::info!(
            user_id = %borrowing.user_id,
            book_id = %borrowing.book_id,
            due_date = %borrowing.due_date,
            "Book borrowed"
        );
        Ok(borrowing)
    }

    pub fn return_book(&self, user_id: &str, book_id: &str) -> Result<Borrowing> {
        self.return_book_at(user_id, book_id, Utc::now())
    }

    /// Return with an explicit clock reading; late fees accrue per started
    /// day past the due date
    pub fn return_book_at(
        &self,
        user_id: &str,
        book_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Borrowing> {
        let (borrowing, payload) = {
            let mut db = self.db()?;
            let late_fee_per_day = self.config.late_fee_per_day_cents;

            let borrowing = db
                .borrowings
                .iter_mut()
                .find(|b| b.user_id == user_id && b.book_id == book_id && b.returned_date.is_none())
                .ok_or_else(|| LibraryError::NotBorrowed {
                    user_id: user_id.to_string(),
                    book_id: book_id.to_string(),
                })?;

            let late_days = days_late(borrowing.due_date, now);
            let late_fee = late_days
                .checked_mul(late_fee_per_day)
                .filter(|fee| *fee >= 0)
                .ok_or_else(|| {
                    LibraryError::InvalidInput(format!(
                        "Late fee for {} days at {} cents per day is out of range",
                        late_days, late_fee_per_day
                    ))
                })?;
            borrowing.returned_date = Some(now);
            borrowing.late_fee = late_fee;
            let borrowing = borrowing.clone();

            let book = db
                .books
                .get_mut(book_id)
                .ok_or_else(|| LibraryError::BookNotFound(book_id.to_string()))?;
            book.available_copies = (book.available_copies + 1).min(book.total_copies);

            let payload = json!({
                "borrowing_id": borrowing.id,
                "user_id": borrowing.user_id,
                "book_id": borrowing.book_id,
                "book_title": book.title,
                "borrowed_date": borrowing.borrowed_date.to_rfc3339(),
                "returned_date": now.to_rfc3339(),
                "days_late": late_days,
                "late_fee": borrowing.late_fee,
                "available_copies": book.available_copies,
            });
            (borrowing, payload)
        };

        self.emit(event_types::BOOK_RETURNED, payload)?;
        tracing::info!(
            user_id = %borrowing.user_id,
            book_id = %borrowing.book_id,
            late_fee = borrowing.late_fee,
            "Book returned"
        );
        Ok(borrowing)
    }

    /// Open borrowings for a user, oldest first
    pub fn user_borrowings(&self, user_id: &str) -> Result<Vec<Borrowing>> {
        let db = self.db()?;
        if !db.users.contains_key(user_id) {
            return Err(LibraryError::UserNotFound(user_id.to_string()));
        }
        Ok(db
            .borrowings
            .iter()
            .filter(|b| b.user_id == user_id && b.returned_date.is_none())
            .cloned()
            .collect())
    }

    pub fn suspend_user(&self, user_id: &str, reason: &str) -> Result<User> {
        let user = {
            let mut db = self.db()?;
            let user = db
                .users
                .get_mut(user_id)
                .ok_or_else(|| LibraryError::UserNotFound(user_id.to_string()))?;
            if user.status == UserStatus::Suspended {
                return Err(LibraryError::UserSuspended(user_id.to_string()));
            }
            user.status = UserStatus::Suspended;
            user.clone()
        };

        self.emit(
            event_types::USER_SUSPENDED,
            json!({
                "user_id": user.id,
                "email": user.email,
                "name": user.name,
                "reason": reason,
            }),
        )?;
        tracing::info!(user_id = %user.id, reason, "User suspended");
        Ok(user)
    }

    pub fn reactivate_user(&self, user_id: &str) -> Result<User> {
        let user = {
            let mut db = self.db()?;
            let user = db
                .users
                .get_mut(user_id)
                .ok_or_else(|| LibraryError::UserNotFound(user_id.to_string()))?;
            if user.status == UserStatus::Active {
                return Err(LibraryError::UserNotSuspended(user_id.to_string()));
            }
            user.status = UserStatus::Active;
            user.clone()
        };

        self.emit(
            event_types::USER_REACTIVATED,
            json!({ "user_id": user.id, "email": user.email, "name": user.name }),
        )?;
        tracing::info!(user_id = %user.id, "User reactivated");
        Ok(user)
    }

    pub fn book(&self, book_id: &str) -> Result<Option<Book>> {
        Ok(self.db()?.books.get(book_id).cloned())
    }

    pub fn user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.db()?.users.get(user_id).cloned())
    }

    /// Every borrowing ever recorded, returned or not
    pub fn borrowings(&self) -> Result<Vec<Borrowing>> {
        Ok(self.db()?.borrowings.clone())
    }

    pub fn clear(&self) -> std::result::Result<(), EventError> {
        *self.lock_db()? = LibraryDb::default();
        Ok(())
    }

    /// Due date for a loan starting at `borrowed`
    fn due_date(&self, borrowed: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let days = self.config.loan_period_days;
        Duration::try_days(days)
            .filter(|period| *period >= Duration::zero())
            .and_then(|period| borrowed.checked_add_signed(period))
            .ok_or_else(|| {
                LibraryError::InvalidInput(format!("Loan period of {} days is out of range", days))
            })
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<Event> {
        Ok(self.broker.emit(event_type, payload, None)?)
    }

    fn db(&self) -> Result<MutexGuard<'_, LibraryDb>> {
        Ok(self.lock_db()?)
    }

    fn lock_db(&self) -> std::result::Result<MutexGuard<'_, LibraryDb>, EventError> {
        self.db
            .lock()
            .map_err(|e| EventError::LockPoisoned(format!("Library state lock poisoned: {}", e)))
    }
}

/// Whole or partial days past due, zero when on time
fn days_late(due: DateTime<Utc>, returned: DateTime<Utc>) -> i64 {
    let overdue = returned - due;
    if overdue <= Duration::zero() {
        return 0;
    }
    let days = overdue.num_days();
    if overdue > Duration::days(days) {
        days + 1
    } else {
        days
    }
}

fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = email.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => return false,
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn service() -> (Arc<Broker>, LibraryService) {
        let broker = Arc::new(Broker::default());
        let library = LibraryService::new(broker.clone(), LibraryConfig::default());
        (broker, library)
    }

    fn jan(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_add_book() {
        let (broker, library) = service();
        let book = library
            .add_book("978-0-123456-78-9", "Test Book", "Test Author", 2)
            .unwrap();

        assert!(book.id.starts_with("book-"));
        assert_eq!(book.total_copies, 2);
        assert_eq!(book.available_copies, 2);

        let pending = broker.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type(), "BookAdded");
        assert_eq!(pending[0].payload()["book_id"], book.id.as_str());
    }

    #[test]
    fn test_add_book_validation() {
        let (broker, library) = service();
        assert!(matches!(
            library.add_book("", "T", "A", 1),
            Err(LibraryError::InvalidInput(_))
        ));
        assert!(matches!(
            library.add_book("isbn", "T", "A", 0),
            Err(LibraryError::InvalidInput(_))
        ));

        library.add_book("isbn", "T", "A", 1).unwrap();
        assert!(matches!(
            library.add_book("isbn", "Other", "B", 1),
            Err(LibraryError::DuplicateIsbn(_))
        ));
        assert_eq!(broker.queue_len().unwrap(), 1);
    }

    #[test]
    fn test_register_user() {
        let (broker, library) = service();
        let user = library
            .register_user("test@example.com", "Test User", UserType::Premium)
            .unwrap();

        assert_eq!(user.status, UserStatus::Active);
        assert_eq!(user.user_type, UserType::Premium);
        assert_eq!(broker.pending().unwrap()[0].payload()["user_type"], "premium");

        let err = library
            .register_user("TEST@example.com", "Another User", UserType::Standard)
            .unwrap_err();
        assert!(matches!(err, LibraryError::DuplicateEmail(_)));
        assert!(err.to_string().to_lowercase().contains("email"));
    }

    #[test]
    fn test_register_user_rejects_bad_email() {
        let (_, library) = service();
        for email in ["plain", "a@b", "@example.com", "a@@example.com", "a b@example.com", "a@.com"] {
            assert!(
                matches!(
                    library.register_user(email, "X", UserType::Standard),
                    Err(LibraryError::InvalidEmail(_))
                ),
                "{email}"
            );
        }
    }

    #[test]
    fn test_borrow_book() {
        let (broker, library) = service();
        let book = library.add_book("isbn-1", "Borrowable Book", "Author", 1).unwrap();
        let user = library
            .register_user("borrower@example.com", "Borrower", UserType::Standard)
            .unwrap();

        let borrowing = library.borrow_book_at(&user.id, &book.id, jan(15)).unwrap();
        assert_eq!(borrowing.due_date, jan(29));
        assert!(borrowing.returned_date.is_none());
        assert_eq!(library.book(&book.id).unwrap().unwrap().available_copies, 0);

        let event = broker.pending().unwrap().pop().unwrap();
        assert_eq!(event.event_type(), "BookBorrowed");
        assert_eq!(event.payload()["book_title"], "Borrowable Book");
        assert_eq!(event.payload()["user_name"], "Borrower");

        let err = library.borrow_book(&user.id, &book.id).unwrap_err();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn test_borrow_limits() {
        let broker = Arc::new(Broker::default());
        let config = LibraryConfig {
            max_borrowings: 1,
            premium_max_borrowings: 2,
            ..LibraryConfig::default()
        };
        let library = LibraryService::new(broker, config);
        let a = library.add_book("a", "A", "X", 5).unwrap();
        let standard = library.register_user("s@example.com", "S", UserType::Standard).unwrap();
        let premium = library.register_user("p@example.com", "P", UserType::Premium).unwrap();

        library.borrow_book(&standard.id, &a.id).unwrap();
        assert!(matches!(
            library.borrow_book(&standard.id, &a.id),
            Err(LibraryError::BorrowLimitReached { limit: 1, .. })
        ));

        library.borrow_book(&premium.id, &a.id).unwrap();
        library.borrow_book(&premium.id, &a.id).unwrap();
        assert!(library.borrow_book(&premium.id, &a.id).is_err());
    }

    #[test]
    fn test_suspended_user_cannot_borrow() {
        let (_, library) = service();
        let book = library.add_book("isbn", "T", "A", 1).unwrap();
        let user = library.register_user("u@example.com", "U", UserType::Standard).unwrap();

        library.suspend_user(&user.id, "overdue books").unwrap();
        assert!(matches!(
            library.borrow_book(&user.id, &book.id),
            Err(LibraryError::UserSuspended(_))
        ));
        assert!(matches!(
            library.suspend_user(&user.id, "again"),
            Err(LibraryError::UserSuspended(_))
        ));

        library.reactivate_user(&user.id).unwrap();
        assert!(library.borrow_book(&user.id, &book.id).is_ok());
        assert!(matches!(
            library.reactivate_user(&user.id),
            Err(LibraryError::UserNotSuspended(_))
        ));
    }

    #[test]
    fn test_return_book_on_time() {
        let (broker, library) = service();
        let book = library.add_book("isbn", "Returnable", "A", 1).unwrap();
        let user = library.register_user("r@example.com", "R", UserType::Standard).unwrap();
        library.borrow_book_at(&user.id, &book.id, jan(1)).unwrap();

        let returned = library.return_book_at(&user.id, &book.id, jan(10)).unwrap();
        assert_eq!(returned.returned_date, Some(jan(10)));
        assert_eq!(returned.late_fee, 0);
        assert_eq!(library.book(&book.id).unwrap().unwrap().available_copies, 1);
        assert!(library.user_borrowings(&user.id).unwrap().is_empty());

        let event = broker.pending().unwrap().pop().unwrap();
        assert_eq!(event.event_type(), "BookReturned");
        assert_eq!(event.payload()["late_fee"], 0);

        let err = library.return_book(&user.id, &book.id).unwrap_err();
        assert!(err.to_string().contains("not borrowed"));
    }

    #[test]
    fn test_return_book_late_fee() {
        let (_, library) = service();
        let book = library.add_book("isbn", "Late", "A", 1).unwrap();
        let user = library.register_user("l@example.com", "L", UserType::Standard).unwrap();
        library.borrow_book_at(&user.id, &book.id, jan(1)).unwrap();

        // Due Jan 15 10:00; returned Jan 17 11:00 -> 3 started days late
        let at = Utc.with_ymd_and_hms(2024, 1, 17, 11, 0, 0).unwrap();
        let returned = library.return_book_at(&user.id, &book.id, at).unwrap();
        assert_eq!(returned.late_fee, 3 * 25);
    }

    #[test]
    fn test_user_borrowings_lists_open_loans() {
        let (_, library) = service();
        let a = library.add_book("a", "A", "X", 1).unwrap();
        let b = library.add_book("b", "B", "X", 1).unwrap();
        let user = library.register_user("u@example.com", "U", UserType::Standard).unwrap();
        library.borrow_book(&user.id, &a.id).unwrap();
        library.borrow_book(&user.id, &b.id).unwrap();
        library.return_book(&user.id, &a.id).unwrap();

        let open = library.user_borrowings(&user.id).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].book_id, b.id);
        assert_eq!(library.borrowings().unwrap().len(), 2);

        assert!(matches!(
            library.user_borrowings("user-missing"),
            Err(LibraryError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_out_of_range_loan_period_rejected_without_side_effects() {
        let broker = Arc::new(Broker::default());
        let config = LibraryConfig {
            loan_period_days: i64::MAX,
            ..LibraryConfig::default()
        };
        let library = LibraryService::new(broker.clone(), config);
        let book = library.add_book("isbn", "Forever", "A", 1).unwrap();
        let user = library.register_user("f@example.com", "F", UserType::Standard).unwrap();
        let queued = broker.queue_len().unwrap();

        let err = library.borrow_book_at(&user.id, &book.id, jan(1)).unwrap_err();
        assert!(matches!(err, LibraryError::InvalidInput(_)));
        assert_eq!(library.book(&book.id).unwrap().unwrap().available_copies, 1);
        assert!(library.borrowings().unwrap().is_empty());
        assert_eq!(broker.queue_len().unwrap(), queued);

        let negative = LibraryService::new(
            broker,
            LibraryConfig {
                loan_period_days: -1,
                ..LibraryConfig::default()
            },
        );
        let book = negative.add_book("isbn-2", "Past", "A", 1).unwrap();
        let user = negative.register_user("n@example.com", "N", UserType::Standard).unwrap();
        assert!(matches!(
            negative.borrow_book_at(&user.id, &book.id, jan(1)),
            Err(LibraryError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_overflowing_late_fee_keeps_loan_open() {
        let broker = Arc::new(Broker::default());
        let config = LibraryConfig {
            late_fee_per_day_cents: i64::MAX,
            ..LibraryConfig::default()
        };
        let library = LibraryService::new(broker, config);
        let book = library.add_book("isbn", "Costly", "A", 1).unwrap();
        let user = library.register_user("c@example.com", "C", UserType::Standard).unwrap();
        library.borrow_book_at(&user.id, &book.id, jan(1)).unwrap();

        let err = library.return_book_at(&user.id, &book.id, jan(20)).unwrap_err();
        assert!(matches!(err, LibraryError::InvalidInput(_)));
        assert_eq!(library.user_borrowings(&user.id).unwrap().len(), 1);
        assert_eq!(library.book(&book.id).unwrap().unwrap().available_copies, 0);
    }

    #[test]
    fn test_days_late() {
        assert_eq!(days_late(jan(10), jan(9)), 0);
        assert_eq!(days_late(jan(10), jan(10)), 0);
        assert_eq!(days_late(jan(10), jan(12)), 2);
    }
}
