//! The job state machine.
//!
//! `Queued -> Provisioning -> Uploading -> Training -> Finalizing -> Completed`,
//! with `Failed` reachable from any active state. Every status change goes
//! through the store's guarded updates; a guard miss means another actor (the
//! sweeper) already finalized the job, and the processor stops driving it.
//! Every terminal path ends in the termination manager.

pub mod monitor;

use crate::billing::{BillingReconciler, Ledger, LedgerError};
use crate::clock::Clock;
use crate::config::{CommandContext, CrucibleConfig};
use crate::context::Collaborators;
use crate::notify::{Notifier, Severity};
use crate::provider::{GpuProvider, InstanceState, Offer, OfferQuery, ProviderError};
use crate::remote::{RemoteError, RemoteTarget, ResilientShell};
use crate::storage::{InstanceRecord, JobFailure, JobRepository, StorageError};
use crate::termination::{TerminationError, TerminationManager};
use crucible_training::{
    parse_progress, CostEstimate, CostEstimator, FailureReason, JobStatus, ProgressReport,
    RunState, StallDetector, TrainingJob,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use monitor::{MonitorEvent, MonitorState};

/// Why a job stopped. Each variant except `Superseded` is persisted as the
/// matching [`FailureReason`].
#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailure(String),

    #[error("dataset upload failed: {0}")]
    UploadFailure(String),

    #[error("remote unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("instance lost: {0}")]
    InstanceLost(String),

    #[error("training crashed: {0}")]
    TrainingCrashed(String),

    #[error("stall timeout: {0}")]
    StallTimeout(String),

    #[error("hard timeout: {0}")]
    HardTimeout(String),

    #[error("artifact collection failed: {0}")]
    ArtifactFailure(String),

    #[error("termination failed: {0}")]
    TerminationFailure(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Another actor moved the job out from under us.
    #[error("job superseded: {0}")]
    Superseded(String),
}

impl JobError {
    pub fn reason(&self) -> Option<FailureReason> {
        let reason = match self {
            Self::InsufficientBalance(_) => FailureReason::InsufficientBalance,
            Self::ProvisioningFailure(_) => FailureReason::ProvisioningFailure,
            Self::UploadFailure(_) => FailureReason::UploadFailure,
            Self::RemoteUnreachable(_) => FailureReason::RemoteUnreachable,
            Self::InstanceLost(_) => FailureReason::InstanceLost,
            Self::TrainingCrashed(_) => FailureReason::TrainingCrashed,
            Self::StallTimeout(_) => FailureReason::StallTimeout,
            Self::HardTimeout(_) => FailureReason::HardTimeout,
            Self::ArtifactFailure(_) => FailureReason::ArtifactFailure,
            Self::TerminationFailure(_) => FailureReason::TerminationFailure,
            Self::Internal(_) => FailureReason::InternalError,
            Self::Superseded(_) => return None,
        };
        Some(reason)
    }

    /// Classify a remote failure. Connectivity and confirmed instance death
    /// keep their own tags; anything else belongs to the phase that ran it.
    fn remote(err: RemoteError, phase: fn(String) -> Self) -> Self {
        match err {
            RemoteError::Unreachable { .. } => Self::RemoteUnreachable(err.to_string()),
            RemoteError::InstanceLost { .. } => Self::InstanceLost(err.to_string()),
            RemoteError::TimedOut { .. }
            | RemoteError::CommandFailed { .. }
            | RemoteError::Local(_) => phase(err.to_string()),
        }
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => Self::Superseded(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Result of one [`JobProcessor::process`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { artifact_uri: String },
    Failed(FailureReason),
    /// Left queued because a collaborator was temporarily unavailable.
    Deferred,
    /// Another worker claimed the job first.
    Skipped,
    /// Another actor finalized the job while it was being driven.
    Superseded,
}

/// Mutable state of one job as it moves through the phases.
struct Run {
    job: TrainingJob,
    estimate: CostEstimate,
    target: Option<RemoteTarget>,
}

enum Poll {
    Report(ProgressReport),
    Silent,
    Unreachable,
}

pub struct JobProcessor {
    store: Arc<dyn JobRepository>,
    provider: Arc<dyn GpuProvider>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    remote: ResilientShell,
    estimator: Arc<CostEstimator>,
    detector: StallDetector,
    termination: TerminationManager,
    reconciler: BillingReconciler,
    config: Arc<CrucibleConfig>,
    worker_id: String,
}

impl JobProcessor {
    pub fn new(collaborators: &Collaborators, config: Arc<CrucibleConfig>) -> Self {
        let Collaborators { store, provider, shell, ledger, notifier, clock } = collaborators.clone();
        let estimator = Arc::new(CostEstimator::new(config.estimator.clone()));
        let remote = ResilientShell::new(
            shell,
            Arc::clone(&provider),
            Arc::clone(&clock),
            config.remote.retry.clone(),
        );
        let termination = TerminationManager::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&notifier),
            Arc::clone(&clock),
            config.termination.retry.clone(),
        );
        let reconciler = BillingReconciler::new(
            Arc::clone(&store),
            Arc::clone(&ledger),
            Arc::clone(&notifier),
            Arc::clone(&estimator),
            Arc::clone(&clock),
        );
        Self {
            store,
            provider,
            ledger,
            notifier,
            clock,
            remote,
            estimator,
            detector: StallDetector::new(config.stall.clone()),
            termination,
            reconciler,
            worker_id: config.orchestrator.worker_id(),
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Drive one queued job to a terminal state.
    pub async fn process(&self, job: TrainingJob) -> JobOutcome {
        let span = info_span!("job", job_id = %job.id, environment = %job.environment);
        self.process_queued(job).instrument(span).await
    }

    async fn process_queued(&self, job: TrainingJob) -> JobOutcome {
        let estimate =
            match self.estimator.estimate(&job.model_family, job.total_steps, job.dataset_size) {
                Ok(estimate) => estimate,
                Err(e) => return self.fail_queued(&job, JobError::Internal(e.to_string())),
            };

        match self.ledger.check_balance(&job.user_id, estimate.points).await {
            Ok(true) => {}
            Ok(false) | Err(LedgerError::InsufficientFunds { .. }) => {
                let detail = format!("{} points required", estimate.points);
                return self.fail_queued(&job, JobError::InsufficientBalance(detail));
            }
            Err(e) => {
                warn!(error = %e, "Balance check unavailable; leaving job queued");
                return JobOutcome::Deferred;
            }
        }

        let claimed = match self.store.claim(&job.id, &self.worker_id, self.clock.now()) {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return JobOutcome::Skipped,
            Err(e) => {
                error!(error = %e, "Claim failed");
                return JobOutcome::Deferred;
            }
        };

        let mut run = Run { job: claimed, estimate, target: None };
        match self.drive(&mut run).await {
            Ok(artifact_uri) => self.finish_completed(&run, artifact_uri).await,
            Err(JobError::Superseded(detail)) => self.finish_superseded(&run, &detail).await,
            Err(err) => self.finish_failed(&run, err).await,
        }
    }

    /// Fail a job that never left `Queued`. Nothing was charged or rented.
    fn fail_queued(&self, job: &TrainingJob, err: JobError) -> JobOutcome {
        let reason = err.reason().unwrap_or(FailureReason::InternalError);
        let failure = JobFailure::new(reason, err.to_string());
        match self.store.mark_failed_from(&job.id, JobStatus::Queued, &failure, self.clock.now()) {
            Ok(true) => {
                self.notifier.notify_user(
                    &job.user_id,
                    &format!("Training job {} could not start: {err}", job.id),
                    Severity::Warning,
                );
                JobOutcome::Failed(reason)
            }
            Ok(false) => {
                debug!(job_id = %job.id, "Job left the queue before pre-flight failure was recorded");
                JobOutcome::Skipped
            }
            Err(e) => {
                error!(error = %e, reason = %reason, "Could not record pre-flight failure");
                JobOutcome::Deferred
            }
        }
    }

    async fn drive(&self, run: &mut Run) -> Result<String, JobError> {
        self.charge(run).await?;
        self.provision(run).await?;
        let target = self.wait_for_boot(run).await?;
        run.target = Some(target.clone());

        self.transition(run, JobStatus::Provisioning, JobStatus::Uploading)?;
        let stage = self.command(&run.job, &self.config.commands.stage_dataset);
        self.exec_phase(run, &target, &stage, self.config.remote.stage_timeout_secs)
            .await
            .map_err(|e| JobError::remote(e, JobError::UploadFailure))?;

        self.transition(run, JobStatus::Uploading, JobStatus::Training)?;
        let launch = self.command(&run.job, &self.config.commands.launch);
        self.exec_phase(run, &target, &launch, self.config.remote.exec_timeout_secs)
            .await
            .map_err(|e| JobError::remote(e, JobError::TrainingCrashed))?;
        self.notifier.notify_user(
            &run.job.user_id,
            &format!("Training job {} started", run.job.id),
            Severity::Info,
        );

        self.monitor(run, &target).await?;

        self.transition(run, JobStatus::Training, JobStatus::Finalizing)?;
        self.collect_artifact(run, &target).await.map_err(|e| JobError::remote(e, JobError::ArtifactFailure))
    }

    fn transition(&self, run: &mut Run, from: JobStatus, to: JobStatus) -> Result<(), JobError> {
        self.store.set_status(&run.job.id, from, to, self.clock.now())?;
        run.job.status = to;
        Ok(())
    }

    async fn charge(&self, run: &mut Run) -> Result<(), JobError> {
        let job = &run.job;
        let points = run.estimate.points;
        let transaction_id = match self.ledger.charge(&job.user_id, points, job.id.as_str()).await {
            Ok(tx) => tx,
            Err(LedgerError::InsufficientFunds { available, required }) => {
                return Err(JobError::InsufficientBalance(format!(
                    "{available} points available, {required} required"
                )));
            }
            Err(e) => return Err(JobError::Internal(format!("charge failed: {e}"))),
        };

        if let Err(e) = self.store.record_charge(&job.id, points, &transaction_id, self.clock.now()) {
            error!(transaction_id, points, error = %e, "Could not persist charge; refunding");
            if let Err(refund) = self.ledger.refund(&transaction_id, points).await {
                self.notifier.notify_ops(
                    "charge could not be persisted or refunded; manual refund required",
                    Severity::Warning,
                    json!({ "job_id": job.id, "transaction_id": transaction_id, "points": points, "error": refund.to_string() }),
                );
            }
            return Err(JobError::from(e));
        }

        info!(points, transaction_id, "Charged prepaid estimate");
        run.job.estimated_cost_points = Some(points);
        run.job.charge_transaction_id = Some(transaction_id);
        Ok(())
    }

    async fn provision(&self, run: &mut Run) -> Result<(), JobError> {
        let provisioning = &self.config.provisioning;
        let query = OfferQuery {
            gpu_type: run.estimate.gpu_class.clone(),
            max_hourly_rate: Some(run.estimate.expected_hourly_rate * provisioning.max_rate_multiplier),
        };
        let offers = self
            .provider
            .search_offers(&query)
            .await
            .map_err(|e| JobError::ProvisioningFailure(format!("offer search failed: {e}")))?;
        if offers.is_empty() {
            return Err(JobError::ProvisioningFailure(format!(
                "no {} offers at or below ${:.2}/h",
                query.gpu_type,
                query.max_hourly_rate.unwrap_or_default()
            )));
        }

        let label = format!("crucible-{}", run.job.id);
        let mut last_error = String::new();
        for offer in offers.iter().take(provisioning.max_offer_attempts as usize) {
            match self.provider.create_instance(&offer.id, &label).await {
                Ok(instance_id) => return self.persist_instance(run, offer, instance_id).await,
                Err(e @ (ProviderError::OfferTaken(_) | ProviderError::Unavailable(_))) => {
                    warn!(offer_id = %offer.id, error = %e, "Offer unusable; trying the next one");
                    last_error = e.to_string();
                }
                Err(e) => {
                    warn!(offer_id = %offer.id, error = %e, "Instance creation rejected");
                    last_error = e.to_string();
                }
            }
        }
        Err(JobError::ProvisioningFailure(format!("no instance obtained: {last_error}")))
    }

    /// Persist the instance before anything else happens to it.
    async fn persist_instance(
        &self,
        run: &mut Run,
        offer: &Offer,
        instance_id: String,
    ) -> Result<(), JobError> {
        let now = self.clock.now();
        let affordable = self.estimator.affordable_hours(run.estimate.points, offer.hourly_rate);
        let record = InstanceRecord {
            instance_id,
            offer_id: offer.id.clone(),
            gpu_type: offer.gpu_type.clone(),
            hourly_rate: offer.hourly_rate,
            provisioned_at: now,
            soft_timeout_at: now + hours(run.estimate.expected_hours),
            hard_timeout_at: now + hours(affordable),
        };

        let job = &mut run.job;
        job.instance_id = Some(record.instance_id.clone());
        if let Err(e) = self.store.record_instance(&job.id, &record, now) {
            error!(instance_id = %record.instance_id, error = %e, "Could not persist instance; terminating it");
            // Nothing else can find this instance, so it is torn down here and
            // forgotten by the terminal path.
            let outcome = self.termination.terminate(job).await;
            job.instance_id = None;
            return Err(match outcome {
                Ok(_) => JobError::Internal(format!("failed to persist instance {}: {e}", record.instance_id)),
                Err(term) => JobError::TerminationFailure(term.to_string()),
            });
        }

        job.offer_id = Some(record.offer_id);
        job.gpu_type = Some(record.gpu_type);
        job.hourly_rate = Some(record.hourly_rate);
        job.provisioned_at = Some(record.provisioned_at);
        job.soft_timeout_at = Some(record.soft_timeout_at);
        job.hard_timeout_at = Some(record.hard_timeout_at);
        info!(
            instance_id = %record.instance_id,
            hourly_rate = record.hourly_rate,
            hard_timeout_at = %record.hard_timeout_at,
            "Instance provisioned"
        );
        Ok(())
    }

    async fn wait_for_boot(&self, run: &Run) -> Result<RemoteTarget, JobError> {
        let job = &run.job;
        let instance_id = job
            .instance_id
            .as_deref()
            .ok_or_else(|| JobError::Internal("no instance to boot".to_string()))?;
        let provisioning = &self.config.provisioning;
        let deadline = self.clock.now() + chrono::Duration::seconds(provisioning.boot_timeout_secs as i64);

        loop {
            match self.provider.instance_status(instance_id).await {
                Ok(status) if status.state == InstanceState::Running => {
                    if let (Some(host), Some(port)) = (status.ssh_host, status.ssh_port) {
                        self.store.record_endpoint(&job.id, &host, port, self.clock.now())?;
                        info!(instance_id, host, port, "Instance ready");
                        return Ok(RemoteTarget { host, port });
                    }
                    debug!(instance_id, "Instance running without an ssh endpoint yet");
                }
                Ok(status) if status.state.is_alive() => {
                    debug!(instance_id, state = %status.state, "Waiting for instance to boot");
                }
                Ok(status) => {
                    return Err(JobError::ProvisioningFailure(format!(
                        "instance {instance_id} is {} while booting",
                        status.state
                    )));
                }
                Err(ProviderError::NotFound(_)) => {
                    return Err(JobError::ProvisioningFailure(format!(
                        "instance {instance_id} disappeared while booting"
                    )));
                }
                Err(e) => warn!(instance_id, error = %e, "Instance status unavailable"),
            }

            let now = self.clock.now();
            if now >= deadline {
                return Err(JobError::ProvisioningFailure(format!(
                    "instance {instance_id} not ready after {}s",
                    provisioning.boot_timeout_secs
                )));
            }
            self.store.touch(&job.id, now)?;
            self.clock.sleep(Duration::from_secs(provisioning.boot_poll_secs)).await;
        }
    }

    fn command(&self, job: &TrainingJob, template: &str) -> String {
        let ctx = CommandContext {
            job_id: job.id.as_str(),
            dataset_uri: &job.dataset_uri,
            total_steps: job.total_steps,
            model_family: &job.model_family,
        };
        self.config.commands.render(template, &ctx)
    }

    async fn exec_phase(
        &self,
        run: &Run,
        target: &RemoteTarget,
        command: &str,
        timeout_secs: u64,
    ) -> Result<String, RemoteError> {
        let instance_id = run.job.instance_id.as_deref().unwrap_or_default();
        let timeout = Duration::from_secs(timeout_secs);
        // An alive but unreachable machine is retried until the prepaid budget runs out.
        let give_up_at = run.job.hard_timeout_at.unwrap_or_else(|| {
            self.clock.now() + chrono::Duration::seconds(timeout_secs as i64)
        });
        self.remote.exec_on_instance(instance_id, target, command, timeout, give_up_at).await
    }

    async fn monitor(&self, run: &Run, target: &RemoteTarget) -> Result<(), JobError> {
        let job = &run.job;
        let grace = chrono::Duration::seconds(self.config.monitor.stall_grace_secs as i64);
        let tick = Duration::from_secs(self.config.monitor.tick_secs);
        let mut state = MonitorState::new(job, grace, &self.detector);
        info!(total_steps = job.total_steps, "Monitoring training");

        loop {
            self.clock.sleep(tick).await;

            let poll = self.poll_progress(run, target).await?;
            let now = self.clock.now();
            match &poll {
                Poll::Report(report) => {
                    if report.state == RunState::Failed {
                        return Err(JobError::TrainingCrashed(format!(
                            "trainer reported failure at step {}",
                            report.step
                        )));
                    }
                    self.store.update_progress(&job.id, report.step, report.loss, now)?;
                    if report.reached_end(job.total_steps) {
                        info!(step = report.step, "Training finished");
                        return Ok(());
                    }
                    state.record(now, report);
                    debug!(step = report.step, loss = ?report.loss, eta = ?report.eta_seconds, "Progress");
                }
                Poll::Silent => self.store.touch(&job.id, now)?,
                Poll::Unreachable => {
                    let polls = state.note_unreachable();
                    warn!(unreachable_polls = polls, "Instance alive but unreachable; still monitoring");
                    self.store.touch(&job.id, now)?;
                }
            }

            if !matches!(poll, Poll::Unreachable) && !self.trainer_alive(run, target).await? {
                // The trainer may have exited cleanly between the two commands.
                if let Poll::Report(report) = self.poll_progress(run, target).await? {
                    if report.reached_end(job.total_steps) {
                        self.store.update_progress(&job.id, report.step, report.loss, self.clock.now())?;
                        info!(step = report.step, "Training finished");
                        return Ok(());
                    }
                }
                return Err(JobError::TrainingCrashed("trainer process exited before finishing".to_string()));
            }

            for event in state.evaluate(now, &self.detector) {
                self.handle_event(job, event)?;
            }
        }
    }

    async fn poll_progress(&self, run: &Run, target: &RemoteTarget) -> Result<Poll, JobError> {
        let command = self.command(&run.job, &self.config.commands.progress);
        let timeout = Duration::from_secs(self.config.remote.exec_timeout_secs);
        match self.remote.exec(target, &command, timeout).await {
            Ok(output) => Ok(parse_progress(&output.stdout).map_or(Poll::Silent, Poll::Report)),
            Err(RemoteError::Unreachable { attempts, last_error }) => {
                let instance_id = run.job.instance_id.as_deref().unwrap_or_default();
                self.remote
                    .check_instance(instance_id)
                    .await
                    .map_err(|e| JobError::remote(e, JobError::InstanceLost))?;
                debug!(attempts, last_error, "Progress poll exhausted its retries");
                Ok(Poll::Unreachable)
            }
            Err(RemoteError::TimedOut { .. }) => {
                warn!("Progress poll timed out");
                Ok(Poll::Silent)
            }
            Err(e) => Err(JobError::remote(e, JobError::Internal)),
        }
    }

    async fn trainer_alive(&self, run: &Run, target: &RemoteTarget) -> Result<bool, JobError> {
        let command = self.command(&run.job, &self.config.commands.process_alive);
        let timeout = Duration::from_secs(self.config.remote.exec_timeout_secs);
        match self.remote.exec(target, &command, timeout).await {
            Ok(output) => Ok(output.success()),
            // Only a clean answer can declare the trainer dead.
            Err(RemoteError::Unreachable { .. } | RemoteError::TimedOut { .. }) => Ok(true),
            Err(e) => Err(JobError::remote(e, JobError::Internal)),
        }
    }

    fn handle_event(&self, job: &TrainingJob, event: MonitorEvent) -> Result<(), JobError> {
        match event {
            MonitorEvent::HardTimeout { deadline } => Err(JobError::HardTimeout(format!(
                "prepaid budget exhausted at {deadline}"
            ))),
            MonitorEvent::SoftTimeout { deadline } => {
                warn!(soft_timeout_at = %deadline, "Training past its expected completion");
                self.notifier.notify_user(
                    &job.user_id,
                    &format!(
                        "Training job {} is taking longer than expected; it will keep running within your prepaid budget",
                        job.id
                    ),
                    Severity::Warning,
                );
                self.notifier.notify_ops(
                    "training past soft timeout",
                    Severity::Info,
                    json!({ "job_id": job.id, "soft_timeout_at": deadline }),
                );
                Ok(())
            }
            MonitorEvent::StallSuspected { verdict, notify_user } => {
                warn!(confidence = verdict.confidence.as_str(), reason = %verdict.reason, "Training may be stalled");
                self.notifier.notify_ops(
                    "training stall suspected",
                    Severity::Warning,
                    json!({ "job_id": job.id, "verdict": verdict }),
                );
                if notify_user {
                    self.notifier.notify_user(
                        &job.user_id,
                        &format!("Training job {} appears stalled: {}", job.id, verdict.reason),
                        Severity::Warning,
                    );
                }
                Ok(())
            }
            MonitorEvent::StallConfirmed { verdict, since } => {
                Err(JobError::StallTimeout(format!("stalled since {since}: {}", verdict.reason)))
            }
            MonitorEvent::StallRecovered => {
                info!("Training recovered from suspected stall");
                Ok(())
            }
        }
    }

    async fn collect_artifact(&self, run: &Run, target: &RemoteTarget) -> Result<String, RemoteError> {
        let command = self.command(&run.job, &self.config.commands.collect_artifact);
        let stdout = self
            .exec_phase(run, target, &command, self.config.remote.artifact_timeout_secs)
            .await?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .next_back()
            .map(ToString::to_string)
            .ok_or_else(|| RemoteError::CommandFailed {
                command,
                exit_code: 0,
                stderr: "artifact command printed no URI".to_string(),
            })
    }

    /// Kill the trainer and salvage whatever it produced so far.
    async fn salvage_partial(&self, run: &Run) -> Option<String> {
        let target = run.target.as_ref()?;
        let kill = self.command(&run.job, &self.config.commands.kill);
        let timeout = Duration::from_secs(self.config.remote.exec_timeout_secs);
        if let Err(e) = self.remote.exec(target, &kill, timeout).await {
            warn!(error = %e, "Could not stop trainer");
        }
        match self.collect_artifact(run, target).await {
            Ok(uri) => {
                info!(artifact_uri = %uri, "Collected partial result");
                Some(uri)
            }
            Err(e) => {
                warn!(error = %e, "No partial result collected");
                None
            }
        }
    }

    async fn finish_completed(&self, run: &Run, artifact_uri: String) -> JobOutcome {
        let job = &run.job;
        self.reconcile(job).await;
        match self.store.mark_completed(&job.id, &artifact_uri, self.clock.now()) {
            Ok(()) => {
                self.notifier.notify_user(
                    &job.user_id,
                    &format!("Training job {} completed: {artifact_uri}", job.id),
                    Severity::Info,
                );
                self.terminate(job).await;
                JobOutcome::Completed { artifact_uri }
            }
            Err(e) => {
                let err = JobError::from(e);
                if let JobError::Superseded(detail) = &err {
                    return self.finish_superseded(run, detail).await;
                }
                self.finish_failed(run, err).await
            }
        }
    }

    async fn finish_failed(&self, run: &Run, err: JobError) -> JobOutcome {
        let job = &run.job;
        let reason = err.reason().unwrap_or(FailureReason::InternalError);
        error!(reason = %reason, error = %err, "Job failed");

        let mut failure = JobFailure::new(reason, err.to_string());
        if matches!(reason, FailureReason::StallTimeout | FailureReason::HardTimeout) {
            failure.artifact_uri = self.salvage_partial(run).await;
            failure.partial_result = failure.artifact_uri.is_some();
        }

        match self.store.mark_failed(&job.id, &failure, self.clock.now()) {
            Ok(true) => {
                let message = match &failure.artifact_uri {
                    Some(uri) => format!("Training job {} failed ({reason}); partial result: {uri}", job.id),
                    None => format!("Training job {} failed ({reason})", job.id),
                };
                self.notifier.notify_user(&job.user_id, &message, Severity::Warning);
            }
            Ok(false) => info!("Job was already finalized elsewhere"),
            Err(e) => error!(error = %e, "Could not record job failure"),
        }

        self.terminate(job).await;
        self.reconcile(job).await;
        JobOutcome::Failed(reason)
    }

    async fn finish_superseded(&self, run: &Run, detail: &str) -> JobOutcome {
        warn!(detail, "Job finalized by another actor; releasing it");
        self.terminate(&run.job).await;
        self.reconcile(&run.job).await;
        JobOutcome::Superseded
    }

    /// Terminate the job's instance using the freshest stored record.
    async fn terminate(&self, job: &TrainingJob) {
        let current = self.store.get(&job.id).unwrap_or_else(|e| {
            warn!(error = %e, "Could not reload job before termination");
            job.clone()
        });
        match self.termination.terminate(&current).await {
            Ok(outcome) => debug!(outcome = ?outcome, "Termination finished"),
            Err(TerminationError::Exhausted { instance_id, attempts, .. }) => {
                error!(instance_id, attempts, "Instance left running; sweeper will retry");
            }
        }
    }

    async fn reconcile(&self, job: &TrainingJob) {
        if let Err(e) = self.reconciler.reconcile(&job.id).await {
            error!(error = %e, "Billing reconciliation failed");
            self.notifier.notify_ops(
                "billing reconciliation failed",
                Severity::Warning,
                json!({ "job_id": job.id, "error": e.to_string() }),
            );
        }
    }
}

fn hours(value: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((value.max(0.0) * 3_600_000.0).round() as i64)
}
