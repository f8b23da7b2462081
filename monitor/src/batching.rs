use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{
    BATCHES_STORED_TOTAL, BUFFERED_SAMPLES, FLUSH_LATENCY_SECONDS, SAMPLES_DROPPED_TOTAL,
    SAMPLES_TOTAL, STORE_FAILURES_TOTAL,
};
use crate::model::{DeviceStatus, SensorSample};
use crate::registry::Registry;
use crate::store::SampleStore;
use crate::validate::{normalize, quality_score, validate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a single flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub drained: usize,
    pub dropped: usize,
    pub forwarded: usize,
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStats {
    pub batch_size: usize,
    pub buffered: usize,
    pub flush_interval_ms: u64,
    pub is_running: bool,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Buffers submitted samples and forwards them to storage in batches.
///
/// A batch is flushed when the buffer reaches `batch_size` (from the caller's
/// task) or when the flush interval elapses (from the background task). Both
/// paths go through `flush`, which holds `flush_lock` for the whole
/// drain-process-store sequence.
pub struct Pipeline {
    registry: Arc<Registry>,
    store: Arc<dyn SampleStore>,
    batch_size: usize,
    flush_interval: Duration,
    store_timeout: Duration,
    buffer: parking_lot::Mutex<Vec<SensorSample>>,
    flush_lock: tokio::sync::Mutex<()>,
    worker: parking_lot::Mutex<Option<Worker>>,
}

impl Pipeline {
    pub fn new(config: &Config, registry: Arc<Registry>, store: Arc<dyn SampleStore>) -> Self {
        Self {
            registry,
            store,
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            store_timeout: config.store_timeout(),
            buffer: parking_lot::Mutex::new(Vec::with_capacity(config.batch_size)),
            flush_lock: tokio::sync::Mutex::new(()),
            worker: parking_lot::Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::State("sensor data pipeline is already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let pipeline = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { pipeline.run_flusher(token).await });
        *worker = Some(Worker { cancel, handle });

        info!(
            "Starting pipeline with batch_size={}, flush_interval_ms={}",
            self.batch_size,
            self.flush_interval.as_millis()
        );
        Ok(())
    }

    /// Stops the periodic flush and drains whatever is still buffered.
    pub async fn stop(&self) -> Result<FlushReport> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| Error::State("sensor data pipeline is not running".to_string()))?;

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!("Pipeline flush task ended abnormally: {}", e);
        }

        info!("Pipeline stopping, flushing remaining samples");
        let report = self.flush().await;
        info!("Pipeline stopped");
        Ok(report)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Buffers one sample, flushing immediately when the batch is full.
    pub async fn process_sensor_data(&self, sample: SensorSample) -> Result<()> {
        SAMPLES_TOTAL.inc();

        let full = {
            let mut buffer = self.buffer.lock();
            buffer.push(sample);
            BUFFERED_SAMPLES.set(buffer.len() as f64);
            buffer.len() >= self.batch_size
        };

        if full {
            self.flush().await;
        }
        Ok(())
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        ProcessingStats {
            batch_size: self.batch_size,
            buffered: self.buffer.lock().len(),
            flush_interval_ms: self.flush_interval.as_millis() as u64,
            is_running: self.is_running(),
        }
    }

    async fn run_flusher(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    /// Drains the buffer and forwards the surviving samples as one batch.
    ///
    /// A storage failure is logged and the batch is discarded; it is never
    /// retried or put back into the buffer.
    pub async fn flush(&self) -> FlushReport {
        let _guard = self.flush_lock.lock().await;

        let batch = {
            let mut buffer = self.buffer.lock();
            let batch = std::mem::take(&mut *buffer);
            BUFFERED_SAMPLES.set(buffer.len() as f64);
            batch
        };
        if batch.is_empty() {
            return FlushReport::default();
        }

        let start = Instant::now();
        let drained = batch.len();
        debug!("Flushing batch of {} samples", drained);

        let processed = self.process_batch(batch, Utc::now());
        let dropped = drained - processed.len();
        let mut report = FlushReport {
            drained,
            dropped,
            forwarded: processed.len(),
            stored: false,
        };
        if processed.is_empty() {
            return report;
        }

        match timeout(self.store_timeout, self.store.store_batch(&processed)).await {
            Ok(Ok(())) => {
                report.stored = true;
                BATCHES_STORED_TOTAL.inc();
                debug!("Stored batch of {} samples", processed.len());
            }
            Ok(Err(e)) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Failed to store batch: {}", e);
                error!("{} samples dropped due to storage failure", processed.len());
            }
            Err(_) => {
                STORE_FAILURES_TOTAL.inc();
                error!(
                    "Storing batch timed out after {}ms, {} samples dropped",
                    self.store_timeout.as_millis(),
                    processed.len()
                );
            }
        }

        self.update_registry(&processed);
        FLUSH_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        report
    }

    fn process_batch(&self, batch: Vec<SensorSample>, now: DateTime<Utc>) -> Vec<SensorSample> {
        let mut processed = Vec::with_capacity(batch.len());

        for mut sample in batch {
            let sensor = match validate(&mut sample, &self.registry, now) {
                Ok(sensor) => sensor,
                Err(e) => {
                    SAMPLES_DROPPED_TOTAL.inc();
                    warn!(
                        device_id = %sample.device_id,
                        sensor_id = %sample.sensor_id,
                        "Invalid sensor sample dropped: {}", e
                    );
                    continue;
                }
            };

            let original = sample.value;
            sample.value = normalize(original, &sensor);
            sample.quality = quality_score(original, sample.value, &sensor, sample.timestamp, now);
            processed.push(sample);
        }

        processed
    }

    fn update_registry(&self, samples: &[SensorSample]) {
        for sample in samples {
            if let Err(e) =
                self.registry
                    .update_sensor_value(&sample.device_id, &sample.sensor_id, sample.value)
            {
                warn!("Error updating sensor value: {}", e);
            }
            if let Err(e) = self
                .registry
                .update_device_status(&sample.device_id, DeviceStatus::Online)
            {
                warn!("Error updating device status: {}", e);
            }
        }
    }
}
