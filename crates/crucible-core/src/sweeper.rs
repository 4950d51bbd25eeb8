//! Independent audit of the job store against live provider state.
//!
//! Runs on its own timer so it keeps cleaning up when the orchestrator is
//! down. It only observes and tears down; it never provisions.

use crate::billing::BillingReconciler;
use crate::clock::Clock;
use crate::config::CrucibleConfig;
use crate::context::Collaborators;
use crate::notify::{Notifier, Severity};
use crate::provider::{GpuProvider, InstanceState, ProviderError};
use crate::storage::{JobFailure, JobRepository};
use crate::termination::{TerminationManager, TerminationOutcome};
use chrono::{DateTime, Utc};
use crucible_training::{CostEstimator, FailureReason, TrainingJob};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one sweep found and did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub orphans_checked: usize,
    pub orphans_terminated: usize,
    pub orphans_confirmed_stopped: usize,
    pub stuck_failed: usize,
    pub errors: usize,
}

pub struct Sweeper {
    store: Arc<dyn JobRepository>,
    provider: Arc<dyn GpuProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    termination: TerminationManager,
    reconciler: BillingReconciler,
    interval: Duration,
    stuck_after: chrono::Duration,
}

impl Sweeper {
    pub fn new(collaborators: &Collaborators, config: &CrucibleConfig) -> Self {
        let Collaborators { store, provider, ledger, notifier, clock, .. } = collaborators.clone();
        let termination = TerminationManager::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.termination.retry.clone(),
        );
        let reconciler = BillingReconciler::new(
            Arc::clone(&store),
            ledger,
            Arc::clone(&notifier),
            Arc::new(CostEstimator::new(config.estimator.clone())),
            Arc::clone(&clock),
        );
        Self {
            store,
            provider,
            notifier,
            clock,
            termination,
            reconciler,
            interval: Duration::from_secs(config.sweeper.interval_secs),
            stuck_after: chrono::Duration::seconds(config.sweeper.stuck_after_secs as i64),
        }
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Sweeper started");
        loop {
            let report = self.run_cycle().await;
            if report.errors > 0 {
                warn!(report = ?report, "Sweep finished with errors");
            } else {
                debug!(report = ?report, "Sweep finished");
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.clock.sleep(self.interval) => {}
            }
        }
        info!("Sweeper stopped");
    }

    pub async fn run_cycle(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.sweep_orphans(&mut report).await;
        self.sweep_stuck(&mut report).await;
        report
    }

    async fn sweep_orphans(&self, report: &mut SweepReport) {
        let candidates = match self.store.find_orphan_candidates() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Orphan query failed");
                report.errors += 1;
                return;
            }
        };

        for job in candidates {
            let Some(instance_id) = job.instance_id.as_deref() else { continue };
            report.orphans_checked += 1;
            match self.provider.instance_status(instance_id).await {
                Ok(status) if status.state.is_alive() => {
                    self.notifier.notify_ops(
                        "CRITICAL: orphan instance still running after job finished",
                        Severity::Critical,
                        json!({
                            "job_id": job.id,
                            "instance_id": instance_id,
                            "job_status": job.status,
                            "state": status.state,
                        }),
                    );
                    match self.termination.terminate(&job).await {
                        Ok(outcome) => {
                            info!(job_id = %job.id, instance_id, outcome = ?outcome, "Orphan instance terminated");
                            report.orphans_terminated += 1;
                        }
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Orphan termination failed");
                            report.errors += 1;
                        }
                    }
                }
                Ok(status) if status.state == InstanceState::Stopping => {
                    debug!(job_id = %job.id, instance_id, "Orphan candidate still stopping");
                }
                Ok(_) | Err(ProviderError::NotFound(_)) => {
                    match self.store.mark_instance_terminated(&job.id, self.clock.now()) {
                        Ok(()) => report.orphans_confirmed_stopped += 1,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Could not record termination");
                            report.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, instance_id, error = %e, "Instance status unavailable");
                    report.errors += 1;
                }
            }
        }
    }

    async fn sweep_stuck(&self, report: &mut SweepReport) {
        let cutoff = self.clock.now() - self.stuck_after;
        let stuck = match self.store.find_stuck(cutoff) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Stuck-job query failed");
                report.errors += 1;
                return;
            }
        };

        for job in stuck {
            self.clean_stuck(&job, cutoff, report).await;
        }
    }

    /// Fail the job first so a live processor stops driving it, then tear
    /// down and settle. The failure only lands if the heartbeat is still
    /// older than `cutoff`.
    async fn clean_stuck(
        &self,
        job: &TrainingJob,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        warn!(job_id = %job.id, status = %job.status, updated_at = %job.updated_at, "Stuck job detected");

        let failure = JobFailure::new(
            FailureReason::StuckSweeperCleanup,
            format!("no progress since {} while {}", job.updated_at, job.status),
        );
        match self.store.fail_if_stale(&job.id, cutoff, &failure, self.clock.now()) {
            Ok(true) => report.stuck_failed += 1,
            Ok(false) => {
                debug!(job_id = %job.id, "Job progressed or finished before cleanup");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Could not fail stuck job");
                report.errors += 1;
                return;
            }
        }
        self.notifier.notify_ops(
            "stuck training job; forcing cleanup",
            Severity::Warning,
            json!({
                "job_id": job.id,
                "status": job.status,
                "updated_at": job.updated_at,
                "instance_id": job.instance_id,
            }),
        );

        match self.termination.terminate(job).await {
            Ok(TerminationOutcome::NoInstance) => {}
            Ok(outcome) => info!(job_id = %job.id, outcome = ?outcome, "Stuck job instance terminated"),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Stuck job termination failed");
                report.errors += 1;
            }
        }
        if let Err(e) = self.reconciler.reconcile(&job.id).await {
            error!(job_id = %job.id, error = %e, "Stuck job reconciliation failed");
            report.errors += 1;
        }

        self.notifier.notify_user(
            &job.user_id,
            &format!("Training job {} stopped responding and was cancelled", job.id),
            Severity::Warning,
        );
    }
}
