use crate::alerts::{AlertManager, AlertStats};
use crate::analytics::{AnalyticsEngine, AnalyticsStats};
use crate::batching::{FlushReport, Pipeline, ProcessingStats};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::model::Alert;
use crate::notify::{notifier_for, Notifier};
use crate::registry::Registry;
use crate::store::SampleStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub devices: usize,
    pub sensors: usize,
    pub alerts: AlertStats,
    pub processing: ProcessingStats,
    pub analytics: AnalyticsStats,
}

/// Owns the registry, alert manager, ingestion pipeline and analytics engine
/// and the background tasks that tie them together.
pub struct Monitor {
    pub registry: Arc<Registry>,
    pub alerts: Arc<AlertManager>,
    pub pipeline: Arc<Pipeline>,
    pub analytics: AnalyticsEngine,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(config: &Config, store: Arc<dyn SampleStore>) -> Result<Self> {
        Self::with_notifier(config, store, notifier_for(config))
    }

    pub fn with_notifier(
        config: &Config,
        store: Arc<dyn SampleStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let (alert_tx, alert_rx) = mpsc::channel(config.alert_queue_capacity);
        let registry = Arc::new(Registry::new(config).with_alert_queue(alert_tx));
        let alerts = Arc::new(AlertManager::with_notifier(config, notifier));
        let pipeline = Arc::new(Pipeline::new(config, Arc::clone(&registry), Arc::clone(&store)));
        let analytics = AnalyticsEngine::new(config, store);

        Ok(Self {
            registry,
            alerts,
            pipeline,
            analytics,
            alert_rx: Mutex::new(Some(alert_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the flush timer, alert reconciliation, alert intake and liveness scan.
    /// A failed start leaves nothing running and can be retried.
    pub async fn start(&self) -> Result<()> {
        if self.alert_rx.lock().is_none() {
            return Err(already_started());
        }

        self.pipeline.start()?;
        if let Err(e) = self.alerts.start() {
            if let Err(stop_err) = self.pipeline.stop().await {
                warn!("Pipeline rollback failed: {}", stop_err);
            }
            return Err(e);
        }
        let Some(alert_rx) = self.alert_rx.lock().take() else {
            return Err(already_started());
        };

        let mut tasks = self.tasks.lock();
        tasks.push(self.alerts.spawn_intake(alert_rx, self.cancel.child_token()));
        let registry = Arc::clone(&self.registry);
        let token = self.cancel.child_token();
        tasks.push(tokio::spawn(registry.run_liveness_scan(token)));

        info!("Monitor started");
        Ok(())
    }

    /// Stops every background task. The pipeline drains its buffer first so
    /// alerts raised by that last flush still reach the alert manager.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let report = self.pipeline.stop().await?;
        if let Err(e) = self.alerts.stop().await {
            warn!("Alert manager stop: {}", e);
        }

        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        info!(
            flushed = report.forwarded,
            stored = report.stored,
            "Monitor stopped"
        );
        Ok(report)
    }

    pub fn system_stats(&self) -> SystemStats {
        SystemStats {
            devices: self.registry.device_count(),
            sensors: self.registry.sensor_count(),
            alerts: self.alerts.alert_stats(),
            processing: self.pipeline.processing_stats(),
            analytics: self.analytics.analytics_stats(),
        }
    }
}

fn already_started() -> Error {
    Error::State("monitor has already been started".to_string())
}
