//! Runtime configuration for the monitor core.
//!
//! Values come from environment variables; anything missing or unparsable
//! falls back to the default with a warning so a typo never stops the plant
//! feed from starting.

use crate::errors::{Error, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Which notification sink the alert manager talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    #[default]
    Log,
    Email,
    Webhook,
}

impl FromStr for NotificationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(NotificationKind::Log),
            "email" => Ok(NotificationKind::Email),
            "webhook" => Ok(NotificationKind::Webhook),
            other => Err(Error::Validation(format!(
                "unknown notification type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_devices: usize,
    pub max_sensors_per_device: usize,
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub store_timeout_ms: u64,
    pub alert_check_interval_secs: u64,
    pub notification_type: NotificationKind,
    pub webhook_url: Option<String>,
    pub alert_queue_capacity: usize,
    pub analytics_enabled: bool,
    pub prediction_enabled: bool,
    pub aggregation_window: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_devices: 1000,
            max_sensors_per_device: 20,
            scan_interval_secs: 60,
            batch_size: 100,
            flush_interval_ms: 1000,
            store_timeout_ms: 5000,
            alert_check_interval_secs: 30,
            notification_type: NotificationKind::Log,
            webhook_url: None,
            alert_queue_capacity: 1024,
            analytics_enabled: true,
            prediction_enabled: false,
            aggregation_window: "5m".to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid value {:?} for {}, using default", raw, key);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            max_devices: env_or("MAX_DEVICES", defaults.max_devices),
            max_sensors_per_device: env_or(
                "MAX_SENSORS_PER_DEVICE",
                defaults.max_sensors_per_device,
            ),
            scan_interval_secs: env_or("SCAN_INTERVAL_SECS", defaults.scan_interval_secs),
            batch_size: env_or("BATCH_SIZE", defaults.batch_size),
            flush_interval_ms: env_or("FLUSH_INTERVAL_MS", defaults.flush_interval_ms),
            store_timeout_ms: env_or("STORE_TIMEOUT_MS", defaults.store_timeout_ms),
            alert_check_interval_secs: env_or(
                "ALERT_CHECK_INTERVAL_SECS",
                defaults.alert_check_interval_secs,
            ),
            notification_type: env_or("NOTIFICATION_TYPE", defaults.notification_type),
            webhook_url: env::var("WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
            alert_queue_capacity: env_or("ALERT_QUEUE_CAPACITY", defaults.alert_queue_capacity),
            analytics_enabled: env_or("ANALYTICS_ENABLED", defaults.analytics_enabled),
            prediction_enabled: env_or("PREDICTION_ENABLED", defaults.prediction_enabled),
            aggregation_window: env::var("AGGREGATION_WINDOW")
                .unwrap_or(defaults.aggregation_window),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 {
            return Err(Error::Validation(
                "max devices must be greater than 0".to_string(),
            ));
        }
        if self.max_sensors_per_device == 0 {
            return Err(Error::Validation(
                "max sensors per device must be greater than 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 || self.scan_interval_secs == 0 || self.store_timeout_ms == 0 {
            return Err(Error::Validation("intervals must be non-zero".to_string()));
        }
        if self.notification_type == NotificationKind::Webhook && self.webhook_url.is_none() {
            return Err(Error::Validation(
                "WEBHOOK_URL is required when NOTIFICATION_TYPE=webhook".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn alert_check_interval(&self) -> Duration {
        Duration::from_secs(self.alert_check_interval_secs.max(1))
    }

    pub fn log_config(&self) {
        info!("Configuration loaded:");
        info!("  MAX_DEVICES            : {}", self.max_devices);
        info!("  MAX_SENSORS_PER_DEVICE : {}", self.max_sensors_per_device);
        info!("  SCAN_INTERVAL_SECS     : {}", self.scan_interval_secs);
        info!("  BATCH_SIZE             : {}", self.batch_size);
        info!("  FLUSH_INTERVAL_MS      : {}", self.flush_interval_ms);
        info!("  STORE_TIMEOUT_MS       : {}", self.store_timeout_ms);
        info!("  NOTIFICATION_TYPE      : {:?}", self.notification_type);
        info!("  ANALYTICS_ENABLED      : {}", self.analytics_enabled);
        info!("  PREDICTION_ENABLED     : {}", self.prediction_enabled);
    }
}
