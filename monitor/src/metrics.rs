use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::sync::Once;
use tracing::error;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SAMPLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_samples_total",
        "Total samples submitted for ingestion"
    ))
    .unwrap();
    pub static ref SAMPLES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_samples_dropped_total",
        "Total samples dropped by validation"
    ))
    .unwrap();
    pub static ref BATCHES_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_batches_stored_total",
        "Total batches forwarded to storage successfully"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_store_failures_total",
        "Total batches discarded after a storage failure"
    ))
    .unwrap();
    pub static ref FLUSH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "monitor_flush_latency_seconds",
            "Time taken to process and store one flushed batch"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BUFFERED_SAMPLES: Gauge = Gauge::with_opts(Opts::new(
        "monitor_buffered_samples",
        "Samples currently waiting for the next flush"
    ))
    .unwrap();
    pub static ref ALERTS_RAISED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_alerts_raised_total",
        "Total alerts accepted by the alert manager"
    ))
    .unwrap();
    pub static ref ALERT_QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_alert_queue_full_total",
        "Threshold alerts dropped because the alert queue was full"
    ))
    .unwrap();
}

static INIT: Once = Once::new();

/// Registers every collector once; later calls are no-ops.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(SAMPLES_TOTAL.clone()),
            Box::new(SAMPLES_DROPPED_TOTAL.clone()),
            Box::new(BATCHES_STORED_TOTAL.clone()),
            Box::new(STORE_FAILURES_TOTAL.clone()),
            Box::new(FLUSH_LATENCY_SECONDS.clone()),
            Box::new(BUFFERED_SAMPLES.clone()),
            Box::new(ALERTS_RAISED_TOTAL.clone()),
            Box::new(ALERT_QUEUE_FULL_TOTAL.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                error!("Failed to register metric: {}", e);
            }
        }
    });
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
