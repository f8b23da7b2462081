//! Alert notification sinks.

use crate::config::{Config, NotificationKind};
use crate::model::Alert;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where alert lifecycle events are delivered.
pub trait Notifier: Send + Sync {
    fn alert_raised(&self, alert: &Alert);
    fn alert_resolved(&self, alert: &Alert);
}

pub fn notifier_for(config: &Config) -> Arc<dyn Notifier> {
    match config.notification_type {
        NotificationKind::Log => Arc::new(LogNotifier),
        NotificationKind::Email => Arc::new(EmailNotifier),
        NotificationKind::Webhook => match &config.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => {
                warn!("Webhook notifications selected without WEBHOOK_URL, using log");
                Arc::new(LogNotifier)
            }
        },
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert_raised(&self, alert: &Alert) {
        warn!(
            alert_id = %alert.id,
            severity = %alert.severity,
            alert_type = %alert.alert_type,
            device_id = %alert.device_id,
            sensor_id = %alert.sensor_id,
            metadata = ?alert.metadata,
            "[ALERT] {}", alert.message
        );
    }

    fn alert_resolved(&self, alert: &Alert) {
        info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            "[RESOLVED] {}", alert.message
        );
    }
}

/// Renders alerts as mail messages. There is no mail transport in this
/// service, so the rendered message is written to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmailNotifier;

impl EmailNotifier {
    pub fn render(alert: &Alert, resolved: bool) -> (String, String) {
        let state = if resolved { "RESOLVED" } else { "ALERT" };
        let subject = format!(
            "[{}][{}] {} on {}",
            state,
            alert.severity.to_string().to_uppercase(),
            alert.alert_type,
            alert.device_id
        );
        let mut body = format!(
            "{}\n\nDevice: {}\nSensor: {}\nRaised at: {}\n",
            alert.message,
            alert.device_id,
            alert.sensor_id,
            alert.timestamp.to_rfc3339()
        );
        if let Some(resolved_at) = alert.resolved_at {
            body.push_str(&format!("Resolved at: {}\n", resolved_at.to_rfc3339()));
        }
        (subject, body)
    }
}

impl Notifier for EmailNotifier {
    fn alert_raised(&self, alert: &Alert) {
        let (subject, body) = Self::render(alert, false);
        info!(alert_id = %alert.id, subject = %subject, "Email notification: {}", body);
    }

    fn alert_resolved(&self, alert: &Alert) {
        let (subject, body) = Self::render(alert, true);
        info!(alert_id = %alert.id, subject = %subject, "Email notification: {}", body);
    }
}

/// POSTs alert events as JSON to a fixed URL without waiting for the response.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    fn post(&self, event: &'static str, alert: &Alert) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(alert_id = %alert.id, "No runtime available for webhook delivery");
            return;
        };

        let payload = json!({ "event": event, "alert": alert });
        let request = self.client.post(&self.url).json(&payload);
        let alert_id = alert.id.clone();
        runtime.spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    warn!(alert_id = %alert_id, status = %resp.status(), "Webhook rejected alert");
                }
                Err(e) => {
                    error!(alert_id = %alert_id, "Webhook delivery failed: {}", e);
                }
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn alert_raised(&self, alert: &Alert) {
        self.post("raised", alert);
    }

    fn alert_resolved(&self, alert: &Alert) {
        self.post("resolved", alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlertSeverity, AlertStatus};
    use chrono::Utc;

    fn alert() -> Alert {
        Alert {
            id: "a1".to_string(),
            device_id: "D1".to_string(),
            sensor_id: "S1".to_string(),
            alert_type: "threshold".to_string(),
            message: "too hot".to_string(),
            severity: AlertSeverity::Critical,
            timestamp: Utc::now(),
            status: AlertStatus::Active,
            resolved_at: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_email_render() {
        let (subject, body) = EmailNotifier::render(&alert(), false);
        assert_eq!(subject, "[ALERT][CRITICAL] threshold on D1");
        assert!(body.starts_with("too hot"));
        assert!(!body.contains("Resolved at"));

        let mut resolved = alert();
        resolved.resolved_at = Some(Utc::now());
        let (subject, body) = EmailNotifier::render(&resolved, true);
        assert!(subject.starts_with("[RESOLVED]"));
        assert!(body.contains("Resolved at"));
    }

    #[test]
    fn test_webhook_without_runtime_does_not_panic() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook".to_string());
        notifier.alert_raised(&alert());
    }

    #[test]
    fn test_webhook_falls_back_to_log_without_url() {
        let config = Config {
            notification_type: NotificationKind::Webhook,
            webhook_url: None,
            ..Config::default()
        };
        // only checks construction succeeds
        notifier_for(&config).alert_raised(&alert());
    }
}
