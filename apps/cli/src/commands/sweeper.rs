//! Sweeper command.

use anyhow::{Context, Result};
use colored::Colorize;
use crucible_core::{Collaborators, CrucibleConfig, Sweeper};
use tokio_util::sync::CancellationToken;

pub async fn execute(config: &CrucibleConfig, once: bool) -> Result<()> {
    let collaborators =
        Collaborators::from_config(config).context("Failed to set up collaborators")?;
    let sweeper = Sweeper::new(&collaborators, config);

    if once {
        let report = sweeper.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.errors > 0 {
            eprintln!("{}", format!("sweep finished with {} error(s)", report.errors).yellow());
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    super::cancel_on_signal(shutdown.clone());
    sweeper.run(shutdown).await;
    Ok(())
}
