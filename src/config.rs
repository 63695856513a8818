//! Configuration for the broker and the lending services
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working system.

use crate::error::{EventError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            broker: BrokerConfig::default(),
            library: LibraryConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl SystemConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EventError::Config(format!("Failed to parse config: {}", e)))?;
        config.library.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EventError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_json(&json)?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }
}

/// Retry and dead-letter policy
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Redeliveries allowed before an event is dead-lettered
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Dead letters kept before the oldest are dropped (0 = unbounded)
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    /// Handler failures kept in the failure log (0 = unbounded)
    #[serde(default = "default_failure_log_capacity")]
    pub failure_log_capacity: usize,
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dead_letter_capacity: default_dead_letter_capacity(),
            failure_log_capacity: default_failure_log_capacity(),
            pump_interval_ms: default_pump_interval_ms(),
        }
    }
}

impl BrokerConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms.max(1))
    }
}

/// Lending rules
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryConfig {
    #[serde(default = "default_max_borrowings")]
    pub max_borrowings: usize,
    #[serde(default = "default_premium_max_borrowings")]
    pub premium_max_borrowings: usize,
    #[serde(default = "default_loan_period_days")]
    pub loan_period_days: i64,
    #[serde(default = "default_late_fee_per_day_cents")]
    pub late_fee_per_day_cents: i64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            max_borrowings: default_max_borrowings(),
            premium_max_borrowings: default_premium_max_borrowings(),
            loan_period_days: default_loan_period_days(),
            late_fee_per_day_cents: default_late_fee_per_day_cents(),
        }
    }
}

impl LibraryConfig {
    /// Reject negative loan periods and fees
    pub fn validate(&self) -> Result<()> {
        if self.loan_period_days < 0 {
            return Err(EventError::Config(format!(
                "library.loan_period_days must not be negative, got {}",
                self.loan_period_days
            )));
        }
        if self.late_fee_per_day_cents < 0 {
            return Err(EventError::Config(format!(
                "library.late_fee_per_day_cents must not be negative, got {}",
                self.late_fee_per_day_cents
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Borrows by one user at which the audit flags an anomaly
    #[serde(default = "default_anomaly_borrow_threshold")]
    pub anomaly_borrow_threshold: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            anomaly_borrow_threshold: default_anomaly_borrow_threshold(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_dead_letter_capacity() -> usize {
    10_000
}
fn default_failure_log_capacity() -> usize {
    10_000
}
fn default_pump_interval_ms() -> u64 {
    50
}
fn default_max_borrowings() -> usize {
    5
}
fn default_premium_max_borrowings() -> usize {
    10
}
fn default_loan_period_days() -> i64 {
    14
}
fn default_late_fee_per_day_cents() -> i64 {
    25
}
fn default_anomaly_borrow_threshold() -> usize {
    5
}
