//! Command implementations for the Crucible CLI.

pub mod estimate;
pub mod jobs;
pub mod sweeper;
pub mod worker;

use anyhow::Context;
use crucible_core::CrucibleConfig;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub fn load_config(path: Option<&Path>) -> anyhow::Result<CrucibleConfig> {
    CrucibleConfig::load(path).context("Failed to load configuration")
}

/// Cancel `token` on the first SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable; listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
