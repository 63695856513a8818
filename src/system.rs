//! Wiring of the broker and the lending services

use crate::broker::Broker;
use crate::config::SystemConfig;
use crate::error::{HandlerResult, Result};
use crate::schema::SchemaRegistry;
use crate::services::{analytics, audit, notification};
use crate::services::{AnalyticsService, AuditService, LibraryService, NotificationService};
use crate::types::{event_types, Event, ProcessReport};
use std::sync::Arc;

/// Performance key under which drain timings are recorded in analytics
pub const DRAIN_METRIC: &str = "broker.drain";

/// A broker with every lending service subscribed
pub struct LendingSystem {
    broker: Arc<Broker>,
    library: LibraryService,
    notifications: Arc<NotificationService>,
    analytics: Arc<AnalyticsService>,
    audit: Arc<AuditService>,
}

impl LendingSystem {
    pub fn new(config: &SystemConfig) -> Result<Self> {
        let broker = Arc::new(Broker::new(&config.broker).with_schemas(SchemaRegistry::lending()));
        let system = Self {
            library: LibraryService::new(broker.clone(), config.library.clone()),
            notifications: Arc::new(NotificationService::new()),
            analytics: Arc::new(AnalyticsService::new()),
            audit: Arc::new(AuditService::new(config.audit.clone())),
            broker,
        };
        system.subscribe()?;

        tracing::info!(
            max_retries = system.broker.max_retries(),
            event_types = event_types::ALL.len(),
            "Lending system ready"
        );
        Ok(system)
    }

    fn subscribe(&self) -> Result<()> {
        use event_types::*;

        let n = &self.notifications;
        let name = notification::SERVICE_NAME;
        wire(&self.broker, USER_REGISTERED, name, n, NotificationService::handle_user_registered)?;
        wire(&self.broker, BOOK_BORROWED, name, n, NotificationService::handle_book_borrowed)?;
        wire(&self.broker, BOOK_RETURNED, name, n, NotificationService::handle_book_returned)?;
        wire(&self.broker, USER_SUSPENDED, name, n, NotificationService::handle_user_suspended)?;
        wire(&self.broker, USER_REACTIVATED, name, n, NotificationService::handle_user_reactivated)?;

        let a = &self.analytics;
        let name = analytics::SERVICE_NAME;
        wire(&self.broker, USER_REGISTERED, name, a, AnalyticsService::handle_user_registered)?;
        wire(&self.broker, BOOK_ADDED, name, a, AnalyticsService::handle_book_added)?;
        wire(&self.broker, BOOK_BORROWED, name, a, AnalyticsService::handle_book_borrowed)?;
        wire(&self.broker, BOOK_RETURNED, name, a, AnalyticsService::handle_book_returned)?;
        wire(&self.broker, NOTIFICATION_SENT, name, a, AnalyticsService::handle_notification_sent)?;

        // Audit last, so it records what the other consumers already accepted
        for event_type in ALL {
            wire(&self.broker, event_type, audit::SERVICE_NAME, &self.audit, AuditService::handle_event)?;
        }
        Ok(())
    }

    /// Drain the broker, recording the drain time in analytics
    pub fn process_events(&self) -> Result<ProcessReport> {
        let report = self.broker.process_once()?;
        if report.attempts() > 0 {
            self.analytics.track_processing_time(DRAIN_METRIC, report.elapsed)?;
        }
        Ok(report)
    }

    /// Clear every service and the broker; subscriptions stay in place
    pub fn reset(&self) -> Result<()> {
        self.broker.reset()?;
        self.library.clear()?;
        self.notifications.clear()?;
        self.analytics.clear()?;
        self.audit.clear()?;
        tracing::info!("Lending system reset");
        Ok(())
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn library(&self) -> &LibraryService {
        &self.library
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub fn analytics(&self) -> &AnalyticsService {
        &self.analytics
    }

    pub fn audit(&self) -> &AuditService {
        &self.audit
    }
}

fn wire<S>(
    broker: &Broker,
    event_type: &str,
    service_name: &str,
    service: &Arc<S>,
    handler: fn(&S, &Event, &Broker) -> HandlerResult,
) -> Result<()>
where
    S: Send + Sync + 'static,
{
    let service = service.clone();
    broker.register(event_type, service_name, move |event: &Event, broker: &Broker| {
        handler(&service, event, broker)
    })
}
