//! Worker command: the orchestrator loop, optionally with an embedded sweeper.

use anyhow::{bail, Context, Result};
use crucible_core::{
    Collaborators, CrucibleConfig, JobProcessor, Orchestrator, ShutdownOutcome, Sweeper,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn execute(config: CrucibleConfig, with_sweeper: bool) -> Result<()> {
    let config = Arc::new(config);
    let collaborators =
        Collaborators::from_config(&config).context("Failed to set up collaborators")?;

    let shutdown = CancellationToken::new();
    super::cancel_on_signal(shutdown.clone());

    let sweeper_task = with_sweeper.then(|| {
        let sweeper = Sweeper::new(&collaborators, &config);
        let token = shutdown.clone();
        tokio::spawn(async move { sweeper.run(token).await })
    });

    let processor = Arc::new(JobProcessor::new(&collaborators, Arc::clone(&config)));
    let orchestrator = Orchestrator::new(
        Arc::clone(&collaborators.store),
        processor,
        Arc::clone(&collaborators.clock),
        &config.orchestrator,
    );

    let outcome = orchestrator.run(shutdown.clone()).await;
    // The orchestrator only returns after cancellation or on error; stop the
    // sweeper either way.
    shutdown.cancel();
    if let Some(task) = sweeper_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }

    match outcome.context("Orchestrator failed")? {
        ShutdownOutcome::Clean => {
            info!("Worker shut down cleanly");
            Ok(())
        }
        ShutdownOutcome::Abandoned { job_id } => {
            bail!("in-flight job {job_id} was abandoned at shutdown; the sweeper will reclaim it")
        }
    }
}
