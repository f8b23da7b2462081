use crate::errors::{Error, Result};
use crate::model::{is_unset, SensorSample, Sensor};
use crate::registry::Registry;
use chrono::{DateTime, Duration, Utc};

const MAX_QUALITY: i32 = 100;
const OUT_OF_RANGE_PENALTY: i32 = 50;
const NEAR_THRESHOLD_PENALTY: i32 = 20;
const STALE_PENALTY: i32 = 30;
/// Fraction of the sensor's range width that counts as "near" the threshold.
const NEAR_THRESHOLD_FRACTION: f64 = 0.1;
const STALE_AFTER_MINUTES: i64 = 5;

/// Checks a sample against the registry and fills in missing id/timestamp.
/// Returns a snapshot of the sensor the sample belongs to.
pub fn validate(sample: &mut SensorSample, registry: &Registry, now: DateTime<Utc>) -> Result<Sensor> {
    if sample.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }
    if sample.sensor_id.is_empty() {
        return Err(Error::Validation("Sensor ID cannot be empty".to_string()));
    }

    if is_unset(&sample.timestamp) {
        sample.timestamp = now;
    }
    if sample.id.is_empty() {
        sample.id = format!("sample_{}", uuid::Uuid::new_v4());
    }

    registry.get_sensor(&sample.device_id, &sample.sensor_id)
}

/// Clamps a value into the sensor's valid range.
pub fn normalize(value: f64, sensor: &Sensor) -> f64 {
    value.max(sensor.min_value).min(sensor.max_value)
}

/// Confidence score in `[0, 100]` for one reading.
///
/// `original` is the value as submitted, `normalized` the clamped one.
pub fn quality_score(
    original: f64,
    normalized: f64,
    sensor: &Sensor,
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i32 {
    let mut quality = MAX_QUALITY;

    if !sensor.in_range(original) {
        quality -= OUT_OF_RANGE_PENALTY;
    }

    if (normalized - sensor.threshold).abs() < sensor.range_width() * NEAR_THRESHOLD_FRACTION {
        quality -= NEAR_THRESHOLD_PENALTY;
    }

    if now - timestamp > Duration::minutes(STALE_AFTER_MINUTES) {
        quality -= STALE_PENALTY;
    }

    quality.clamp(0, MAX_QUALITY)
}
