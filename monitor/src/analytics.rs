//! Descriptive and predictive statistics over stored sensor samples.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::model::SensorSample;
use crate::store::{AggregationFn, Bucket, Granularity, SampleStore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Upper bound on samples pulled for one analysis.
const QUERY_LIMIT: usize = 10_000;
const FORECAST_STEPS: usize = 10;
const MIN_FORECAST_SAMPLES: usize = 5;
const MIN_ANOMALY_SAMPLES: usize = 3;
const ANOMALY_SIGMAS: f64 = 3.0;
/// Relative slack so rounding noise in near-constant series is never flagged.
const ANOMALY_TOLERANCE: f64 = 1e-9;
/// Slopes within this band (per sample) count as stable.
const TREND_DEADBAND: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicStats {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub variance: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Trend {
    pub slope: f64,
    pub intercept: f64,
    pub direction: TrendDirection,
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub step: usize,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub method: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub device_id: String,
    pub sensor_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub data_points: usize,
    pub statistics: BasicStats,
    pub trend: Trend,
    pub anomalies: Vec<SensorSample>,
    pub prediction: Option<Vec<ForecastPoint>>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorRef {
    pub device_id: String,
    pub sensor_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrelationReport {
    pub sensor1: SensorRef,
    pub sensor2: SensorRef,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub data_points: usize,
    pub correlation: f64,
    pub covariance: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsStats {
    pub enabled: bool,
    pub prediction_enabled: bool,
    pub aggregation_window: String,
}

fn values(samples: &[SensorSample]) -> Vec<f64> {
    samples.iter().map(|s| s.value).collect()
}

/// Population statistics. Fails on an empty series.
pub fn basic_stats(values: &[f64]) -> Result<BasicStats> {
    if values.is_empty() {
        return Err(Error::InsufficientData(
            "statistics need at least one sample".to_string(),
        ));
    }

    let count = values.len();
    let n = count as f64;
    let mut sum = 0.0;
    let mut sum_squares = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in values {
        sum += v;
        sum_squares += v * v;
        min = min.min(v);
        max = max.max(v);
    }

    let mean = sum / n;
    // E[x²] - E[x]² can dip below zero from rounding
    let variance = (sum_squares / n - mean * mean).max(0.0);

    Ok(BasicStats {
        count,
        sum,
        mean,
        median: median(values),
        min,
        max,
        variance,
        std_dev: variance.sqrt(),
    })
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Least-squares line through `(index, value)` pairs.
fn fit_line(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, &y) in values.iter().enumerate() {
        let x = i as f64;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return (0.0, if n > 0.0 { sum_y / n } else { 0.0 });
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    (slope, intercept)
}

/// Linear trend over sample position, not elapsed time.
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < 2 {
        return Trend {
            slope: 0.0,
            intercept: values.first().copied().unwrap_or(0.0),
            direction: TrendDirection::Stable,
            strength: 0.0,
        };
    }

    let (slope, intercept) = fit_line(values);
    let direction = if slope > TREND_DEADBAND {
        TrendDirection::Increasing
    } else if slope < -TREND_DEADBAND {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };

    Trend {
        slope,
        intercept,
        direction,
        strength: slope.abs() / slope.max(1.0),
    }
}

/// Samples further than three standard deviations from the mean of the
/// remaining samples.
///
/// Each candidate is left out of the mean and deviation it is measured
/// against, so a single spike in a short series still stands out.
pub fn detect_anomalies(samples: &[SensorSample]) -> Vec<SensorSample> {
    if samples.len() < MIN_ANOMALY_SAMPLES {
        return Vec::new();
    }

    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| s.value).sum::<f64>() / n;
    // centered first so the per-candidate sums below stay well conditioned
    let deviations: Vec<f64> = samples.iter().map(|s| s.value - mean).collect();
    let dev_sum: f64 = deviations.iter().sum();
    let dev_squares: f64 = deviations.iter().map(|d| d * d).sum();
    let others = n - 1.0;
    let tolerance = ANOMALY_TOLERANCE * mean.abs().max(1.0);

    samples
        .iter()
        .zip(&deviations)
        .filter(|&(_, &d)| {
            // offset of the other samples' mean from the overall mean
            let shift = (dev_sum - d) / others;
            let variance = ((dev_squares - d * d) / others - shift * shift).max(0.0);
            (d - shift).abs() - ANOMALY_SIGMAS * variance.sqrt() > tolerance
        })
        .map(|(s, _)| s.clone())
        .collect()
}

/// Extends the positional trend line `steps` samples ahead, stamping each
/// point one minute after the previous one.
pub fn forecast(samples: &[SensorSample], steps: usize) -> Result<Vec<ForecastPoint>> {
    if samples.len() < MIN_FORECAST_SAMPLES {
        return Err(Error::InsufficientData(format!(
            "forecast needs at least {} samples, got {}",
            MIN_FORECAST_SAMPLES,
            samples.len()
        )));
    }

    let (slope, intercept) = fit_line(&values(samples));
    let n = samples.len();
    let last = samples[n - 1].timestamp;

    Ok((0..steps)
        .map(|i| ForecastPoint {
            step: i + 1,
            value: slope * (n + i) as f64 + intercept,
            timestamp: last + Duration::minutes(i as i64 + 1),
            method: "linear_regression",
        })
        .collect())
}

/// Pearson correlation of positionally paired values; the longer series is
/// cut to the shorter one. Returns 0 when either side has no variance.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let (mut numerator, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        numerator += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Sample covariance (n - 1) of positionally paired values.
pub fn covariance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let total: f64 = a
        .iter()
        .zip(b)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum();
    total / (n - 1) as f64
}

pub struct AnalyticsEngine {
    store: Arc<dyn SampleStore>,
    enabled: bool,
    prediction_enabled: bool,
    aggregation_window: String,
}

impl AnalyticsEngine {
    pub fn new(config: &Config, store: Arc<dyn SampleStore>) -> Self {
        Self {
            store,
            enabled: config.analytics_enabled,
            prediction_enabled: config.prediction_enabled,
            aggregation_window: config.aggregation_window.clone(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Error::Disabled("analytics"))
        }
    }

    async fn fetch(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SensorSample>> {
        let samples = self
            .store
            .query(device_id, sensor_id, start, end, QUERY_LIMIT)
            .await?;
        if samples.is_empty() {
            return Err(Error::InsufficientData(format!(
                "no samples for {}/{} in range",
                device_id, sensor_id
            )));
        }
        Ok(samples)
    }

    pub async fn analyze_sensor_data(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AnalysisReport> {
        self.ensure_enabled()?;
        let samples = self.fetch(device_id, sensor_id, start, end).await?;
        let series = values(&samples);

        let prediction = if self.prediction_enabled {
            match forecast(&samples, FORECAST_STEPS) {
                Ok(points) => Some(points),
                Err(e) => {
                    warn!(device_id, sensor_id, "Prediction skipped: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let report = AnalysisReport {
            device_id: device_id.to_string(),
            sensor_id: sensor_id.to_string(),
            start_time: start,
            end_time: end,
            data_points: samples.len(),
            statistics: basic_stats(&series)?,
            trend: trend(&series),
            anomalies: detect_anomalies(&samples),
            prediction,
            timestamp: Utc::now(),
        };
        debug!(
            device_id,
            sensor_id,
            points = report.data_points,
            anomalies = report.anomalies.len(),
            "Sensor analysis complete"
        );
        Ok(report)
    }

    pub async fn aggregate_sensor_data(
        &self,
        device_id: &str,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        aggregation: AggregationFn,
    ) -> Result<Vec<Bucket>> {
        self.ensure_enabled()?;
        self.store
            .query_aggregated(device_id, sensor_id, start, end, granularity, aggregation)
            .await
    }

    /// Pairs samples by position within the window, not by timestamp.
    pub async fn correlation(
        &self,
        first: SensorRef,
        second: SensorRef,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CorrelationReport> {
        self.ensure_enabled()?;
        let a = values(&self.fetch(&first.device_id, &first.sensor_id, start, end).await?);
        let b = values(&self.fetch(&second.device_id, &second.sensor_id, start, end).await?);

        Ok(CorrelationReport {
            data_points: a.len().min(b.len()),
            correlation: correlation(&a, &b),
            covariance: covariance(&a, &b),
            sensor1: first,
            sensor2: second,
            start_time: start,
            end_time: end,
            timestamp: Utc::now(),
        })
    }

    pub fn analytics_stats(&self) -> AnalyticsStats {
        AnalyticsStats {
            enabled: self.enabled,
            prediction_enabled: self.prediction_enabled,
            aggregation_window: self.aggregation_window.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn series(values: &[f64]) -> Vec<SensorSample> {
        let base = Utc::now() - Duration::hours(1);
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| SensorSample::new("d1", "s1", v).at(base + Duration::seconds(i as i64)))
            .collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_basic_stats() {
        let stats = basic_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(stats.count, 5);
        assert!(approx(stats.sum, 15.0));
        assert!(approx(stats.mean, 3.0));
        assert!(approx(stats.median, 3.0));
        assert_eq!((stats.min, stats.max), (1.0, 5.0));
        assert!(approx(stats.variance, 2.0));
        assert!(approx(stats.std_dev, 2f64.sqrt()));

        assert!(matches!(basic_stats(&[]), Err(Error::InsufficientData(_))));
    }

    #[test]
    fn test_median_even_and_constant_variance() {
        assert!(approx(median(&[4.0, 1.0, 3.0, 2.0]), 2.5));
        let stats = basic_stats(&[0.1; 7]).unwrap();
        assert!(stats.variance >= 0.0);
        assert!(stats.std_dev.is_finite());
    }

    #[test]
    fn test_trend_directions() {
        let up = trend(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(up.direction, TrendDirection::Increasing);
        assert!(approx(up.slope, 1.0));
        assert!(approx(up.intercept, 1.0));
        assert!(approx(up.strength, 1.0));

        let down = trend(&[10.0, 8.0, 6.0]);
        assert_eq!(down.direction, TrendDirection::Decreasing);
        assert!(approx(down.strength, 2.0));

        assert_eq!(trend(&[5.0, 5.05, 5.0]).direction, TrendDirection::Stable);
        let single = trend(&[7.0]);
        assert_eq!(single.direction, TrendDirection::Stable);
        assert_eq!(single.slope, 0.0);
    }

    #[test]
    fn test_anomalies() {
        let flagged = detect_anomalies(&series(&[10.0, 11.0, 9.0, 10.0, 95.0]));
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 95.0);

        assert!(detect_anomalies(&series(&[10.0, 11.0, 9.0, 10.0, 9.0])).is_empty());
        assert!(detect_anomalies(&series(&[1.0, 500.0])).is_empty());
    }

    #[test]
    fn test_constant_series_has_no_anomalies() {
        for value in [0.1, 98.6, -42.7, 1e6 + 0.3, 0.0] {
            for n in 3..=10 {
                let flagged = detect_anomalies(&series(&vec![value; n]));
                assert!(
                    flagged.is_empty(),
                    "value={} n={} flagged {} samples",
                    value,
                    n,
                    flagged.len()
                );
            }
        }
        // a real step out of a flat series is still caught
        let flagged = detect_anomalies(&series(&[98.6, 98.6, 98.6, 98.6, 120.0]));
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].value, 120.0);
    }

    #[test]
    fn test_forecast() {
        let samples = series(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let points = forecast(&samples, 3).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].step, 1);
        assert!(approx(points[0].value, 6.0));
        assert!(approx(points[2].value, 8.0));
        assert_eq!(points[0].timestamp, samples[4].timestamp + Duration::minutes(1));
        assert_eq!(points[2].timestamp, samples[4].timestamp + Duration::minutes(3));

        assert!(matches!(
            forecast(&samples[..4], 3),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_correlation_and_covariance() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!(approx(correlation(&a, &a), 1.0));
        assert!(approx(correlation(&a, &[5.0, 4.0, 3.0, 2.0, 1.0]), -1.0));
        // truncated to the shorter series
        assert!(approx(correlation(&a, &[2.0, 4.0, 6.0]), 1.0));
        assert_eq!(correlation(&a, &[3.0; 5]), 0.0);
        assert_eq!(correlation(&[], &a), 0.0);

        assert!(approx(covariance(&a, &a), 2.5));
        assert_eq!(covariance(&[1.0], &[2.0]), 0.0);
    }

    fn engine(config: Config, store: Arc<MemoryStore>) -> AnalyticsEngine {
        AnalyticsEngine::new(&config, store)
    }

    #[tokio::test]
    async fn test_engine_reports() {
        let store = Arc::new(MemoryStore::new());
        let samples = series(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        store.store_batch(&samples).await.unwrap();

        let config = Config {
            prediction_enabled: true,
            ..Config::default()
        };
        let engine = engine(config, store);
        let start = Utc::now() - Duration::hours(2);
        let end = Utc::now();

        let report = engine.analyze_sensor_data("d1", "s1", start, end).await.unwrap();
        assert_eq!(report.data_points, 6);
        assert_eq!(report.trend.direction, TrendDirection::Increasing);
        assert_eq!(report.prediction.map(|p| p.len()), Some(FORECAST_STEPS));

        let sensor = SensorRef {
            device_id: "d1".to_string(),
            sensor_id: "s1".to_string(),
        };
        let corr = engine
            .correlation(sensor.clone(), sensor, start, end)
            .await
            .unwrap();
        assert!(approx(corr.correlation, 1.0));
        assert_eq!(corr.data_points, 6);

        assert!(matches!(
            engine.analyze_sensor_data("d1", "missing", start, end).await,
            Err(Error::InsufficientData(_))
        ));
    }

    #[tokio::test]
    async fn test_engine_disabled() {
        let config = Config {
            analytics_enabled: false,
            ..Config::default()
        };
        let engine = engine(config, Arc::new(MemoryStore::new()));
        let now = Utc::now();
        assert!(matches!(
            engine.analyze_sensor_data("d1", "s1", now, now).await,
            Err(Error::Disabled(_))
        ));
        assert!(matches!(
            engine
                .aggregate_sensor_data("d1", "s1", now, now, Granularity::Minute, AggregationFn::Avg)
                .await,
            Err(Error::Disabled(_))
        ));
        assert!(!engine.analytics_stats().enabled);
    }
}
