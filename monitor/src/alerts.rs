//! Alert lifecycle: active → resolved | suppressed.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::ALERTS_RAISED_TOTAL;
use crate::model::{Alert, AlertSeverity, AlertStatus};
use crate::notify::{notifier_for, Notifier};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the reconciliation pass should do with an active alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Keep,
    Resolve,
    Suppress,
}

/// Hook for automatic alert transitions, run on every reconciliation tick.
pub trait Reconciler: Send + Sync {
    fn reconcile(&self, alert: &Alert) -> Reconciliation;
}

/// Leaves every alert as it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReconciler;

impl Reconciler for NoopReconciler {
    fn reconcile(&self, _alert: &Alert) -> Reconciliation {
        Reconciliation::Keep
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub total: usize,
    pub active: usize,
    pub resolved: usize,
    pub suppressed: usize,
    pub by_severity: HashMap<AlertSeverity, usize>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct AlertManager {
    alerts: RwLock<HashMap<String, Alert>>,
    notifier: Arc<dyn Notifier>,
    reconciler: Arc<dyn Reconciler>,
    check_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl AlertManager {
    pub fn new(config: &Config) -> Self {
        Self::with_notifier(config, notifier_for(config))
    }

    pub fn with_notifier(config: &Config, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            notifier,
            reconciler: Arc::new(NoopReconciler),
            check_interval: config.alert_check_interval(),
            worker: Mutex::new(None),
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn add_alert(&self, mut alert: Alert) -> Result<Alert> {
        if alert.id.is_empty() {
            alert.id = format!("alert_{}", uuid::Uuid::new_v4());
        }
        if crate::model::is_unset(&alert.timestamp) {
            alert.timestamp = Utc::now();
        }

        {
            let mut alerts = self.alerts.write();
            if alerts.contains_key(&alert.id) {
                return Err(Error::Duplicate(format!(
                    "alert with id {} already exists",
                    alert.id
                )));
            }
            alerts.insert(alert.id.clone(), alert.clone());
        }

        ALERTS_RAISED_TOTAL.inc();
        self.notifier.alert_raised(&alert);
        debug!(alert_id = %alert.id, severity = %alert.severity, "Alert added");
        Ok(alert)
    }

    pub fn resolve_alert(&self, alert_id: &str) -> Result<Alert> {
        let resolved = self.transition(alert_id, AlertStatus::Resolved)?;
        self.notifier.alert_resolved(&resolved);
        info!(alert_id, "Alert resolved");
        Ok(resolved)
    }

    pub fn suppress_alert(&self, alert_id: &str) -> Result<Alert> {
        let suppressed = self.transition(alert_id, AlertStatus::Suppressed)?;
        info!(alert_id, "Alert suppressed");
        Ok(suppressed)
    }

    fn transition(&self, alert_id: &str, to: AlertStatus) -> Result<Alert> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .get_mut(alert_id)
            .ok_or_else(|| Error::NotFound(format!("alert not found: {}", alert_id)))?;

        if alert.status != AlertStatus::Active {
            return Err(Error::State(format!(
                "alert {} is not active (status: {})",
                alert_id, alert.status
            )));
        }

        alert.status = to;
        if to == AlertStatus::Resolved {
            alert.resolved_at = Some(Utc::now());
        }
        Ok(alert.clone())
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Alert> {
        self.alerts
            .read()
            .get(alert_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("alert not found: {}", alert_id)))
    }

    /// All alerts, or only those whose status is in `statuses` when it is non-empty.
    pub fn get_alerts(&self, statuses: &[AlertStatus]) -> Vec<Alert> {
        self.alerts
            .read()
            .values()
            .filter(|a| statuses.is_empty() || statuses.contains(&a.status))
            .cloned()
            .collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.get_alerts(&[AlertStatus::Active])
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn alert_stats(&self) -> AlertStats {
        let alerts = self.alerts.read();
        let mut stats = AlertStats {
            total: alerts.len(),
            ..AlertStats::default()
        };
        for alert in alerts.values() {
            match alert.status {
                AlertStatus::Active => stats.active += 1,
                AlertStatus::Resolved => stats.resolved += 1,
                AlertStatus::Suppressed => stats.suppressed += 1,
            }
            *stats.by_severity.entry(alert.severity).or_insert(0) += 1;
        }
        stats
    }

    /// One reconciliation pass over the active alerts. Returns the number of
    /// alerts that changed state.
    pub fn reconcile_once(&self) -> usize {
        let mut changed = 0;
        for alert in self.active_alerts() {
            let outcome = match self.reconciler.reconcile(&alert) {
                Reconciliation::Keep => continue,
                Reconciliation::Resolve => self.resolve_alert(&alert.id),
                Reconciliation::Suppress => self.suppress_alert(&alert.id),
            };
            match outcome {
                Ok(_) => changed += 1,
                // a caller may have transitioned it since the snapshot
                Err(e) => debug!(alert_id = %alert.id, "Reconciliation skipped: {}", e),
            }
        }
        changed
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(Error::State("alert manager is already running".to_string()));
        }

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { manager.run_reconciliation(token).await });
        *worker = Some(Worker { cancel, handle });
        info!(interval_secs = self.check_interval.as_secs(), "Alert manager started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let worker = self
            .worker
            .lock()
            .take()
            .ok_or_else(|| Error::State("alert manager is not running".to_string()))?;

        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            warn!("Alert reconciliation task ended abnormally: {}", e);
        }
        info!("Alert manager stopped");
        Ok(())
    }

    async fn run_reconciliation(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let changed = self.reconcile_once();
                    if changed > 0 {
                        info!(changed, "Alert reconciliation applied transitions");
                    }
                }
            }
        }
    }

    /// Moves threshold alerts queued by the registry into the manager. On
    /// cancellation whatever is already queued is still taken in.
    pub fn spawn_intake(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<Alert>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(alert) => manager.take_queued(alert),
                        None => break,
                    },
                }
            }
            rx.close();
            while let Ok(alert) = rx.try_recv() {
                manager.take_queued(alert);
            }
            debug!("Alert intake closed");
        })
    }

    fn take_queued(&self, alert: Alert) {
        if let Err(e) = self.add_alert(alert) {
            warn!("Failed to add queued alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        raised: AtomicUsize,
        resolved: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn alert_raised(&self, _alert: &Alert) {
            self.raised.fetch_add(1, Ordering::SeqCst);
        }

        fn alert_resolved(&self, _alert: &Alert) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ResolveCritical;

    impl Reconciler for ResolveCritical {
        fn reconcile(&self, alert: &Alert) -> Reconciliation {
            if alert.severity == AlertSeverity::Critical {
                Reconciliation::Resolve
            } else {
                Reconciliation::Keep
            }
        }
    }

    fn alert(id: &str, severity: AlertSeverity) -> Alert {
        let mut alert: Alert = serde_json::from_value(serde_json::json!({
            "id": id,
            "device_id": "D1",
            "sensor_id": "S1",
            "type": "threshold",
            "message": "over limit",
        }))
        .unwrap();
        alert.severity = severity;
        alert
    }

    fn manager() -> (AlertManager, Arc<CountingNotifier>) {
        let notifier = Arc::new(CountingNotifier::default());
        let manager = AlertManager::with_notifier(&Config::default(), notifier.clone());
        (manager, notifier)
    }

    #[test]
    fn test_add_alert_defaults_and_notifies() {
        let (manager, notifier) = manager();
        let added = manager.add_alert(alert("a1", AlertSeverity::Warning)).unwrap();
        assert_eq!(added.status, AlertStatus::Active);
        assert!(!crate::model::is_unset(&added.timestamp));
        assert!(added.resolved_at.is_none());
        assert_eq!(notifier.raised.load(Ordering::SeqCst), 1);

        assert!(matches!(
            manager.add_alert(alert("a1", AlertSeverity::Warning)),
            Err(Error::Duplicate(_))
        ));
        assert_eq!(manager.alert_count(), 1);
    }

    #[test]
    fn test_resolve_twice() {
        let (manager, notifier) = manager();
        manager.add_alert(alert("a1", AlertSeverity::Error)).unwrap();

        let resolved = manager.resolve_alert("a1").unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());

        assert!(matches!(manager.resolve_alert("a1"), Err(Error::State(_))));
        assert_eq!(manager.get_alert("a1").unwrap().status, AlertStatus::Resolved);
        assert_eq!(notifier.resolved.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_suppress_transitions() {
        let (manager, notifier) = manager();
        manager.add_alert(alert("a1", AlertSeverity::Info)).unwrap();

        let suppressed = manager.suppress_alert("a1").unwrap();
        assert_eq!(suppressed.status, AlertStatus::Suppressed);
        assert!(suppressed.resolved_at.is_none());
        assert!(matches!(manager.resolve_alert("a1"), Err(Error::State(_))));
        assert!(matches!(manager.suppress_alert("a1"), Err(Error::State(_))));
        assert!(matches!(manager.suppress_alert("nope"), Err(Error::NotFound(_))));
        assert_eq!(notifier.resolved.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filters_and_stats() {
        let (manager, _) = manager();
        manager.add_alert(alert("a1", AlertSeverity::Warning)).unwrap();
        manager.add_alert(alert("a2", AlertSeverity::Warning)).unwrap();
        manager.add_alert(alert("a3", AlertSeverity::Critical)).unwrap();
        manager.resolve_alert("a1").unwrap();
        manager.suppress_alert("a3").unwrap();

        assert_eq!(manager.get_alerts(&[]).len(), 3);
        assert_eq!(manager.active_alerts().len(), 1);
        assert_eq!(
            manager
                .get_alerts(&[AlertStatus::Resolved, AlertStatus::Suppressed])
                .len(),
            2
        );

        let stats = manager.alert_stats();
        assert_eq!(stats.total, 3);
        assert_eq!((stats.active, stats.resolved, stats.suppressed), (1, 1, 1));
        assert_eq!(stats.by_severity[&AlertSeverity::Warning], 2);
        assert_eq!(stats.by_severity[&AlertSeverity::Critical], 1);
    }

    #[test]
    fn test_default_reconciliation_changes_nothing() {
        let (manager, _) = manager();
        manager.add_alert(alert("a1", AlertSeverity::Critical)).unwrap();
        assert_eq!(manager.reconcile_once(), 0);
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[test]
    fn test_custom_reconciler() {
        let (manager, _) = manager();
        let manager = manager.with_reconciler(Arc::new(ResolveCritical));
        manager.add_alert(alert("a1", AlertSeverity::Critical)).unwrap();
        manager.add_alert(alert("a2", AlertSeverity::Info)).unwrap();

        assert_eq!(manager.reconcile_once(), 1);
        assert_eq!(manager.get_alert("a1").unwrap().status, AlertStatus::Resolved);
        assert_eq!(manager.get_alert("a2").unwrap().status, AlertStatus::Active);
    }

    #[tokio::test]
    async fn test_intake_and_lifecycle() {
        let (manager, _) = manager();
        let manager = Arc::new(manager);
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(Error::State(_))));

        let (tx, rx) = mpsc::channel(4);
        let intake = manager.spawn_intake(rx, CancellationToken::new());
        tx.send(alert("q1", AlertSeverity::Warning)).await.unwrap();
        drop(tx);
        intake.await.unwrap();
        assert!(manager.get_alert("q1").is_ok());

        // queued before cancellation, still delivered
        let (tx, rx) = mpsc::channel(4);
        tx.send(alert("q2", AlertSeverity::Warning)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        manager.spawn_intake(rx, cancel).await.unwrap();
        assert!(manager.get_alert("q2").is_ok());

        manager.stop().await.unwrap();
        assert!(matches!(manager.stop().await, Err(Error::State(_))));
    }
}
