//! Storage collaborator contract and the in-memory implementation.
//!
//! `query` returns samples in chronological order (oldest first), which is
//! what the analytics engine relies on when it uses positional indices.

use crate::errors::{Error, Result};
use crate::model::SensorSample;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Name understood by PostgreSQL `date_trunc`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Second => "second",
            Granularity::Minute => "minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }

    /// Start of the bucket containing `ts`. Weeks start on Monday.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let floor = |width: i64| {
            DateTime::from_timestamp(secs - secs.rem_euclid(width), 0).unwrap_or(ts)
        };
        match self {
            Granularity::Second => floor(1),
            Granularity::Minute => floor(60),
            Granularity::Hour => floor(3_600),
            Granularity::Day => floor(86_400),
            Granularity::Week => {
                let date = ts.date_naive();
                let monday = date
                    - chrono::Duration::days(date.weekday().num_days_from_monday() as i64);
                midnight(monday).unwrap_or(ts)
            }
            Granularity::Month => NaiveDate::from_ymd_opt(ts.year(), ts.month(), 1)
                .and_then(midnight)
                .unwrap_or(ts),
        }
    }
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

impl FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "second" => Ok(Granularity::Second),
            "minute" => Ok(Granularity::Minute),
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(Error::Validation(format!("unknown granularity: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFn {
    Avg,
    Max,
    Min,
    Sum,
    Count,
}

impl AggregationFn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregationFn::Avg => "AVG(value)",
            AggregationFn::Max => "MAX(value)",
            AggregationFn::Min => "MIN(value)",
            AggregationFn::Sum => "SUM(value)",
            AggregationFn::Count => "COUNT(value)::float8",
        }
    }

    pub fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggregationFn::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregationFn::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationFn::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationFn::Sum => values.iter().sum(),
            AggregationFn::Count => values.len() as f64,
        }
    }
}

impl FromStr for AggregationFn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avg" => Ok(AggregationFn::Avg),
            "max" => Ok(AggregationFn::Max),
            "min" => Ok(AggregationFn::Min),
            "sum" => Ok(AggregationFn::Sum),
            "count" => Ok(AggregationFn::Count),
            other => Err(Error::Validation(format!(
                "unknown aggregation function: {}",
                other
            ))),
        }
    }
}

/// One aggregated time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bucket {
    pub start: DateTime<Utc>,
    pub value: f64,
    pub count: i64,
}

/// Time-series storage used by the pipeline and the analytics engine.
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Persist one flushed batch. Callers do not retry.
    async fn store_batch(&self, samples: &[SensorSample]) -> Result<()>;

    /// Samples in `[start, end]`, oldest first, at most `limit` (0 = unbounded).
    /// Empty ids match every device or sensor.
    async fn query(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorSample>>;

    async fn query_aggregated(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        aggregation: AggregationFn,
    ) -> Result<Vec<Bucket>>;
}

fn matches(sample: &SensorSample, device_id: &str, sensor_id: &str) -> bool {
    (device_id.is_empty() || sample.device_id == device_id)
        && (sensor_id.is_empty() || sample.sensor_id == sensor_id)
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    samples: RwLock<Vec<SensorSample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn store_batch(&self, samples: &[SensorSample]) -> Result<()> {
        self.samples.write().extend_from_slice(samples);
        Ok(())
    }

    async fn query(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SensorSample>> {
        let mut result: Vec<SensorSample> = self
            .samples
            .read()
            .iter()
            .filter(|s| matches(s, device_id, sensor_id))
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();

        result.sort_by_key(|s| s.timestamp);
        if limit > 0 {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn query_aggregated(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        aggregation: AggregationFn,
    ) -> Result<Vec<Bucket>> {
        let mut groups: BTreeMap<DateTime<Utc>, Vec<f64>> = BTreeMap::new();
        for sample in self.samples.read().iter() {
            if matches(sample, device_id, sensor_id)
                && sample.timestamp >= start
                && sample.timestamp <= end
            {
                groups
                    .entry(granularity.truncate(sample.timestamp))
                    .or_default()
                    .push(sample.value);
            }
        }

        Ok(groups
            .into_iter()
            .map(|(start, values)| Bucket {
                start,
                value: aggregation.apply(&values),
                count: values.len() as i64,
            })
            .collect())
    }
}
