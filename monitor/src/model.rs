use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness state of a device as seen by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
            DeviceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A piece of plant equipment and the sensors mounted on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub firmware_version: String,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
}

/// A measurement channel on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub sensor_type: String,
    #[serde(default)]
    pub unit: String,
    pub min_value: f64,
    pub max_value: f64,
    pub threshold: f64,
    #[serde(default)]
    pub last_value: f64,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Sensor {
    pub fn range_width(&self) -> f64 {
        self.max_value - self.min_value
    }

    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min_value && value <= self.max_value
    }
}

/// A single reading submitted for ingestion.
///
/// `timestamp` left at the Unix epoch means "not set"; the pipeline stamps it
/// with the processing time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SensorSample {
    #[serde(default)]
    pub id: String,
    pub device_id: String,
    pub sensor_id: String,
    pub value: f64,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_quality")]
    pub quality: i32,
    #[serde(default)]
    pub raw_data: String,
}

fn default_quality() -> i32 {
    100
}

impl SensorSample {
    pub fn new(device_id: impl Into<String>, sensor_id: impl Into<String>, value: f64) -> Self {
        Self {
            id: format!("sample_{}", uuid::Uuid::new_v4()),
            device_id: device_id.into(),
            sensor_id: sensor_id.into(),
            value,
            timestamp: Utc::now(),
            quality: 100,
            raw_data: format!("{{\"value\":{}}}", value),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Returns true when a timestamp was never filled in.
pub fn is_unset(ts: &DateTime<Utc>) -> bool {
    *ts == DateTime::<Utc>::UNIX_EPOCH
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    Active,
    Resolved,
    Suppressed,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertStatus::Active => "active",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Suppressed => "suppressed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AlertStatus {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(AlertStatus::Active),
            "resolved" => Ok(AlertStatus::Resolved),
            "suppressed" => Ok(AlertStatus::Suppressed),
            other => Err(crate::errors::Error::Validation(format!(
                "unknown alert status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default, rename = "type")]
    pub alert_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: AlertSeverity,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: AlertStatus,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Alert {
    pub fn threshold_breach(
        device_id: &str,
        device_name: &str,
        sensor: &Sensor,
        value: f64,
    ) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("value".to_string(), serde_json::json!(value));
        metadata.insert("threshold".to_string(), serde_json::json!(sensor.threshold));
        if !sensor.unit.is_empty() {
            metadata.insert("unit".to_string(), serde_json::json!(sensor.unit));
        }

        Self {
            id: format!("alert_{}", uuid::Uuid::new_v4()),
            device_id: device_id.to_string(),
            sensor_id: sensor.id.clone(),
            alert_type: "threshold".to_string(),
            message: format!(
                "Sensor {} on device {} exceeded threshold: {} > {}",
                sensor.name, device_name, value, sensor.threshold
            ),
            severity: AlertSeverity::Warning,
            timestamp: Utc::now(),
            status: AlertStatus::Active,
            resolved_at: None,
            metadata,
        }
    }
}
