//! Sequential worker loop: one job claimed and driven to a terminal state at
//! a time, for the jobs of a single environment.

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::{CoreError, CoreResult};
use crate::processor::{JobOutcome, JobProcessor};
use crate::storage::JobRepository;
use crucible_training::JobId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How [`Orchestrator::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// No job was in flight, or it finished within the wait bound.
    Clean,
    /// The in-flight job outlived the wait bound and was dropped. The sweeper
    /// reclaims it once its heartbeat goes stale.
    Abandoned { job_id: JobId },
}

pub struct Orchestrator {
    store: Arc<dyn JobRepository>,
    processor: Arc<JobProcessor>,
    clock: Arc<dyn Clock>,
    environment: String,
    poll_interval: Duration,
    shutdown_max_wait: Duration,
    current_job: Arc<Mutex<Option<JobId>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobRepository>,
        processor: Arc<JobProcessor>,
        clock: Arc<dyn Clock>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            processor,
            clock,
            environment: config.environment.clone(),
            poll_interval: config.poll_interval(),
            shutdown_max_wait: config.shutdown_max_wait(),
            current_job: Arc::new(Mutex::new(None)),
        }
    }

    /// The job being driven right now, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.current_job.lock().ok().and_then(|current| current.clone())
    }

    fn set_current_job(&self, job_id: Option<JobId>) {
        if let Ok(mut current) = self.current_job.lock() {
            *current = job_id;
        }
    }

    /// Process at most one queued job, inline. Returns `None` when the queue
    /// is empty.
    pub async fn run_once(&self) -> CoreResult<Option<JobOutcome>> {
        let Some(job) = self.store.fetch_next_queued(&self.environment)? else {
            return Ok(None);
        };
        self.set_current_job(Some(job.id.clone()));
        let outcome = self.processor.process(job).await;
        self.set_current_job(None);
        Ok(Some(outcome))
    }

    /// Poll and process until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> CoreResult<ShutdownOutcome> {
        info!(
            environment = %self.environment,
            worker_id = self.processor.worker_id(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Orchestrator started"
        );

        while !shutdown.is_cancelled() {
            let next = match self.store.fetch_next_queued(&self.environment) {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "Failed to poll for queued jobs");
                    None
                }
            };
            let Some(job) = next else {
                self.idle(&shutdown).await;
                continue;
            };

            let job_id = job.id.clone();
            self.set_current_job(Some(job_id.clone()));
            let processor = Arc::clone(&self.processor);
            let handle = tokio::spawn(async move { processor.process(job).await });

            let outcome = match self.await_job(handle, &job_id, &shutdown).await {
                Some(outcome) => outcome,
                None => {
                    self.set_current_job(None);
                    return Ok(ShutdownOutcome::Abandoned { job_id });
                }
            };
            self.set_current_job(None);

            match outcome {
                Ok(JobOutcome::Deferred) => self.idle(&shutdown).await,
                Ok(outcome) => info!(job_id = %job_id, outcome = ?outcome, "Job processed"),
                Err(e) => error!(job_id = %job_id, error = %e, "Job task failed"),
            }
        }

        info!("Orchestrator stopped");
        Ok(ShutdownOutcome::Clean)
    }

    /// Wait for the job task. After shutdown is requested the wait is bounded;
    /// `None` means the bound was hit and the task was aborted.
    async fn await_job(
        &self,
        mut handle: JoinHandle<JobOutcome>,
        job_id: &JobId,
        shutdown: &CancellationToken,
    ) -> Option<CoreResult<JobOutcome>> {
        let joined = tokio::select! {
            joined = &mut handle => joined,
            () = shutdown.cancelled() => {
                info!(
                    job_id = %job_id,
                    max_wait_secs = self.shutdown_max_wait.as_secs(),
                    "Shutdown requested; waiting for in-flight job"
                );
                if let Ok(joined) = tokio::time::timeout(self.shutdown_max_wait, &mut handle).await {
                    joined
                } else {
                    handle.abort();
                    warn!(job_id = %job_id, "In-flight job abandoned at shutdown");
                    return None;
                }
            }
        };
        Some(joined.map_err(|e| CoreError::Worker(e.to_string())))
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = self.clock.sleep(self.poll_interval) => {}
        }
    }
}
