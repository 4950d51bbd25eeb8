//! Best-effort user and operator notifications.
//!
//! Notifiers never block the caller and never fail it: delivery problems are
//! logged and dropped.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    /// Needs a human now: money is leaking.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

pub trait Notifier: Send + Sync {
    fn notify_user(&self, user_id: &str, message: &str, severity: Severity);

    fn notify_ops(&self, message: &str, severity: Severity, data: Value);
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_user(&self, user_id: &str, message: &str, severity: Severity) {
        info!(user_id, severity = %severity, "user notification: {message}");
    }

    fn notify_ops(&self, message: &str, severity: Severity, data: Value) {
        match severity {
            Severity::Critical => error!(data = %data, "ops alert: {message}"),
            Severity::Warning => warn!(data = %data, "ops alert: {message}"),
            Severity::Info => info!(data = %data, "ops notice: {message}"),
        }
    }
}

/// POSTs JSON payloads to webhooks on spawned tasks.
///
/// Must be used from within a tokio runtime. Every notification is also
/// logged, so a missing webhook degrades to [`LogNotifier`].
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    user_webhook: Option<String>,
    ops_webhook: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        user_webhook: Option<String>,
        ops_webhook: Option<String>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, user_webhook, ops_webhook })
    }

    fn post(&self, url: Option<&String>, payload: Value) {
        let Some(url) = url.cloned() else { return };
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "Notification webhook rejected payload");
                }
                Err(e) => warn!(url = %url, error = %e, "Notification webhook unreachable"),
            }
        });
    }
}

impl Notifier for WebhookNotifier {
    fn notify_user(&self, user_id: &str, message: &str, severity: Severity) {
        LogNotifier.notify_user(user_id, message, severity);
        self.post(
            self.user_webhook.as_ref(),
            json!({ "user_id": user_id, "message": message, "severity": severity }),
        );
    }

    fn notify_ops(&self, message: &str, severity: Severity, data: Value) {
        LogNotifier.notify_ops(message, severity, data.clone());
        self.post(
            self.ops_webhook.as_ref(),
            json!({ "message": message, "severity": severity, "data": data }),
        );
    }
}
