//! Shared handles to the store, the external collaborators and the clock.

use crate::billing::{HttpLedger, Ledger};
use crate::clock::{Clock, SystemClock};
use crate::config::CrucibleConfig;
use crate::error::CoreResult;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::provider::{GpuProvider, HttpGpuProvider};
use crate::remote::{RemoteShell, SshShell};
use crate::storage::{JobRepository, SqliteJobRepository};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything the processor and the sweeper talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn JobRepository>,
    pub provider: Arc<dyn GpuProvider>,
    pub shell: Arc<dyn RemoteShell>,
    pub ledger: Arc<dyn Ledger>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Production wiring: SQLite file, HTTP provider and ledger, system ssh.
    ///
    /// Webhook notifications are used when at least one webhook is configured.
    pub fn from_config(config: &CrucibleConfig) -> CoreResult<Self> {
        let store = SqliteJobRepository::open(&config.orchestrator.database)?;
        let provider = HttpGpuProvider::new(
            &config.provider.base_url,
            config.provider.api_key.clone(),
            Duration::from_secs(config.provider.timeout_secs),
        )?;
        let ledger = HttpLedger::new(
            &config.ledger.base_url,
            config.ledger.api_key.clone(),
            Duration::from_secs(config.ledger.timeout_secs),
        )?;
        let shell = SshShell::new(
            config.remote.ssh_user.clone(),
            config.remote.identity_file.clone(),
            Duration::from_secs(config.remote.connect_timeout_secs),
        );

        let notifications = &config.notifications;
        let notifier: Arc<dyn Notifier> =
            if notifications.user_webhook.is_some() || notifications.ops_webhook.is_some() {
                Arc::new(WebhookNotifier::new(
                    notifications.user_webhook.clone(),
                    notifications.ops_webhook.clone(),
                    Duration::from_secs(notifications.timeout_secs),
                )?)
            } else {
                info!("No webhooks configured; notifications go to the log only");
                Arc::new(LogNotifier)
            };

        Ok(Self {
            store: Arc::new(store),
            provider: Arc::new(provider),
            shell: Arc::new(shell),
            ledger: Arc::new(ledger),
            notifier,
            clock: Arc::new(SystemClock),
        })
    }
}
