//! Background pump: drains the broker on an interval
//!
//! Emitters stay fire-and-forget while a tokio task delivers queued events.
//! Draining is still serialized by the broker itself, so a manual
//! `process_once` racing the pump simply returns an empty report. On
//! shutdown the pump keeps retrying its final drain until the queue is
//! empty, so a concurrent manual drain cannot leave events behind.

use crate::broker::Broker;
use crate::error::{EventError, Result};
use crate::types::ProcessReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FINAL_DRAIN_BACKOFF: Duration = Duration::from_millis(1);

/// Handle to a running pump task
pub struct BrokerPump {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ProcessReport>,
}

impl BrokerPump {
    /// Spawn a pump on the current tokio runtime
    pub fn spawn(broker: Arc<Broker>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut total = ProcessReport::default();

            loop {
                tokio::select! {
                    _ = ticker.tick() => drain_into(&broker, &mut total),
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            // Deliver whatever was emitted before shutdown was requested.
            // Another drain may hold the broker, so wait for the queue to empty.
            loop {
                drain_into(&broker, &mut total);
                match broker.queue_len() {
                    Ok(0) | Err(_) => break,
                    Ok(_) => tokio::time::sleep(FINAL_DRAIN_BACKOFF).await,
                }
            }
            tracing::debug!(
                delivered = total.delivered,
                retried = total.retried,
                dead_lettered = total.dead_lettered,
                "Broker pump stopped"
            );
            total
        });

        tracing::debug!(interval_ms = interval.as_millis() as u64, "Broker pump started");
        Self { shutdown, handle }
    }

    /// Stop the pump once the queue is empty and return the accumulated counters
    ///
    /// Events a concurrent `process_once` delivers are counted in that
    /// call's report, not in the pump's.
    pub async fn shutdown(self) -> Result<ProcessReport> {
        // The receiver only disappears if the task already ended
        let _ = self.shutdown.send(true);
        self.handle
            .await
            .map_err(|e| EventError::Pump(format!("Pump task failed: {}", e)))
    }
}

fn drain_into(broker: &Broker, total: &mut ProcessReport) {
    match broker.process_once() {
        Ok(report) => {
            total.delivered += report.delivered;
            total.retried += report.retried;
            total.dead_lettered += report.dead_lettered;
            total.elapsed += report.elapsed;
        }
        Err(e) => tracing::warn!(error = %e, "Broker pump drain failed"),
    }
}
