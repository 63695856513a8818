//! Lending system integration tests
//!
//! Full workflows through `LendingSystem`: library operations emit events,
//! a drain delivers them, and every consumer's view is checked afterwards.

use a3s_lending::services::audit::Anomaly;
use a3s_lending::services::library::UserType;
use a3s_lending::services::notification::kinds;
use a3s_lending::{
    event_types, Broker, BrokerPump, Event, HandlerError, LendingSystem, LibraryError,
    SystemConfig,
};
use chrono::{Duration, TimeZone, Utc};
use std::collections::HashMap;

fn system() -> LendingSystem {
    LendingSystem::new(&SystemConfig::default()).unwrap()
}

fn config(json: &str) -> SystemConfig {
    SystemConfig::from_json(json).unwrap()
}

// ─── Validation ──────────────────────────────────────────────────

#[test]
fn test_validation_errors_emit_nothing() {
    let system = system();
    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    let book = library.add_book("111", "Only Copy", "Author", 1).unwrap();
    let other = library
        .register_user("other@example.com", "Other", UserType::Standard)
        .unwrap();
    library.borrow_book(&other.id, &book.id).unwrap();
    let queued = system.broker().queue_len().unwrap();

    assert!(matches!(
        library.register_user("not-an-email", "X", UserType::Standard),
        Err(LibraryError::InvalidEmail(_))
    ));
    assert!(matches!(
        library.register_user("READER@example.com", "Dup", UserType::Standard),
        Err(LibraryError::DuplicateEmail(_))
    ));
    assert!(matches!(
        library.add_book("111", "Again", "Author", 1),
        Err(LibraryError::DuplicateIsbn(_))
    ));
    assert!(matches!(
        library.borrow_book(&user.id, &book.id),
        Err(LibraryError::NotAvailable(_))
    ));
    assert!(matches!(
        library.return_book(&user.id, &book.id),
        Err(LibraryError::NotBorrowed { .. })
    ));
    assert!(matches!(
        library.borrow_book("user-missing", &book.id),
        Err(LibraryError::UserNotFound(_))
    ));

    assert_eq!(system.broker().queue_len().unwrap(), queued);
}

#[test]
fn test_borrow_limit_follows_user_type() {
    let system = LendingSystem::new(&config(
        r#"{"library": {"max_borrowings": 1, "premium_max_borrowings": 2}}"#,
    ))
    .unwrap();
    let library = system.library();
    let standard = library
        .register_user("s@example.com", "Standard", UserType::Standard)
        .unwrap();
    let premium = library
        .register_user("p@example.com", "Premium", UserType::Premium)
        .unwrap();
    let books: Vec<_> = (0..3)
        .map(|i| library.add_book(&format!("isbn-{i}"), "Title", "Author", 5).unwrap())
        .collect();

    library.borrow_book(&standard.id, &books[0].id).unwrap();
    assert!(matches!(
        library.borrow_book(&standard.id, &books[1].id),
        Err(LibraryError::BorrowLimitReached { limit: 1, .. })
    ));

    library.borrow_book(&premium.id, &books[0].id).unwrap();
    library.borrow_book(&premium.id, &books[1].id).unwrap();
    assert!(library.borrow_book(&premium.id, &books[2].id).is_err());
    assert_eq!(library.user_borrowings(&premium.id).unwrap().len(), 2);
}

// ─── Workflows ───────────────────────────────────────────────────

#[test]
fn test_suspension_blocks_borrowing_and_notifies() {
    let system = system();
    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    let book = library.add_book("222", "Dune", "Herbert", 1).unwrap();

    library.suspend_user(&user.id, "unpaid fees").unwrap();
    assert!(matches!(
        library.borrow_book(&user.id, &book.id),
        Err(LibraryError::UserSuspended(_))
    ));
    library.reactivate_user(&user.id).unwrap();
    library.borrow_book(&user.id, &book.id).unwrap();
    system.process_events().unwrap();

    let messages: Vec<_> = system
        .notifications()
        .user_notifications(&user.id)
        .unwrap()
        .into_iter()
        .map(|n| (n.notification_type, n.message))
        .collect();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].0, kinds::ACCOUNT_SUSPENDED);
    assert!(messages[1].1.contains("unpaid fees"));
    assert_eq!(messages[2].0, kinds::ACCOUNT_REACTIVATED);
    assert_eq!(messages[3].0, kinds::BORROW_CONFIRMATION);
}

#[test]
fn test_notifications_share_the_source_correlation_id() {
    let system = system();
    let user = system
        .library()
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    system.process_events().unwrap();

    let registered = system
        .audit()
        .audit_trail("user", &user.id)
        .unwrap()
        .into_iter()
        .find(|e| e.event_type == event_types::USER_REGISTERED)
        .unwrap();
    let chain = system.audit().correlation_trail(&registered.correlation_id).unwrap();
    let types: Vec<_> = chain.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec![event_types::USER_REGISTERED, event_types::NOTIFICATION_SENT]);
}

#[test]
fn test_preferences_suppress_notifications() {
    let system = system();
    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    system.process_events().unwrap();
    system
        .notifications()
        .set_preferences(
            &user.id,
            HashMap::from([(kinds::BORROW_CONFIRMATION.to_string(), false)]),
        )
        .unwrap();

    let book = library.add_book("333", "Quiet", "Author", 1).unwrap();
    library.borrow_book(&user.id, &book.id).unwrap();
    system.process_events().unwrap();

    let sent: Vec<_> = system
        .notifications()
        .user_notifications(&user.id)
        .unwrap()
        .into_iter()
        .map(|n| n.notification_type)
        .collect();
    assert_eq!(sent, vec![kinds::WELCOME]);
    assert_eq!(system.analytics().metric("notifications_sent").unwrap(), 1);
}

#[test]
fn test_audit_reconstructs_past_state() {
    let system = system();
    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    let book = library.add_book("444", "Replay", "Author", 3).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    library.borrow_book_at(&user.id, &book.id, t0).unwrap();
    system.process_events().unwrap();
    let before_return = Utc::now();
    std::thread::sleep(std::time::Duration::from_millis(2));

    library.return_book(&user.id, &book.id).unwrap();
    system.process_events().unwrap();

    let past = system.audit().reconstruct_until(before_return).unwrap();
    assert_eq!(past.books[&book.id].available_copies, 2);
    assert_eq!(past.active_loans.len(), 1);

    let now = system.audit().snapshot().unwrap();
    assert_eq!(now.state.books[&book.id].available_copies, 3);
    assert!(now.state.active_loans.is_empty());
    assert_eq!(now.events_by_type[event_types::BOOK_RETURNED], 1);
}

#[test]
fn test_heavy_borrower_flagged() {
    let system = LendingSystem::new(&config(r#"{"audit": {"anomaly_borrow_threshold": 3}}"#)).unwrap();
    let library = system.library();
    let user = library
        .register_user("heavy@example.com", "Heavy", UserType::Premium)
        .unwrap();
    for i in 0..3 {
        let book = library.add_book(&format!("h-{i}"), "Book", "Author", 1).unwrap();
        library.borrow_book(&user.id, &book.id).unwrap();
    }
    system.process_events().unwrap();

    let anomalies = system.audit().detect_anomalies().unwrap();
    assert_eq!(
        anomalies,
        vec![Anomaly::ExcessiveBorrowing {
            user_id: user.id.clone(),
            borrow_count: 3
        }]
    );
}

// ─── Redelivery ──────────────────────────────────────────────────

#[test]
fn test_consumers_stay_idempotent_under_redelivery() {
    let system = LendingSystem::new(&config(r#"{"broker": {"max_retries": 2}}"#)).unwrap();
    system
        .broker()
        .register(event_types::BOOK_BORROWED, "billing", |_: &Event, _: &Broker| {
            Err(HandlerError::failed("billing offline"))
        })
        .unwrap();

    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    let book = library.add_book("555", "Retry", "Author", 1).unwrap();
    library.borrow_book(&user.id, &book.id).unwrap();
    let report = system.process_events().unwrap();

    assert_eq!(report.retried, 2);
    assert_eq!(report.dead_lettered, 1);
    let dead = system.broker().failed_events().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].service, "billing");
    assert_eq!(dead[0].event.event_type(), event_types::BOOK_BORROWED);

    // Three deliveries of BookBorrowed, but each consumer acted once
    let borrow_confirmations = system
        .notifications()
        .user_notifications(&user.id)
        .unwrap()
        .into_iter()
        .filter(|n| n.notification_type == kinds::BORROW_CONFIRMATION)
        .count();
    assert_eq!(borrow_confirmations, 1);
    assert_eq!(system.analytics().metric("total_borrows").unwrap(), 1);
    let borrowed_entries = system
        .audit()
        .entries()
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == event_types::BOOK_BORROWED)
        .count();
    assert_eq!(borrowed_entries, 1);

    // The domain change stands regardless of consumer failures
    assert_eq!(library.book(&book.id).unwrap().unwrap().available_copies, 0);
}

// ─── Pump ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pump_drives_the_system() {
    let system = system();
    let pump = BrokerPump::spawn(system.broker().clone(), std::time::Duration::from_millis(5));

    let library = system.library();
    let user = library
        .register_user("reader@example.com", "Reader", UserType::Standard)
        .unwrap();
    let book = library.add_book("666", "Async", "Author", 1).unwrap();
    let t0 = Utc::now() - Duration::days(20);
    library.borrow_book_at(&user.id, &book.id, t0).unwrap();
    library.return_book(&user.id, &book.id).unwrap();

    let report = pump.shutdown().await.unwrap();
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(system.broker().queue_len().unwrap(), 0);

    let kinds_sent: Vec<_> = system
        .notifications()
        .user_notifications(&user.id)
        .unwrap()
        .into_iter()
        .map(|n| n.notification_type)
        .collect();
    assert!(kinds_sent.contains(&kinds::LATE_FEE.to_string()));
    assert_eq!(system.analytics().metric("late_returns").unwrap(), 1);
}
