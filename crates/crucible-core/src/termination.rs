//! Idempotent, retrying instance shutdown.
//!
//! Every attempt is counted on the job record before the provider is called,
//! so termination trouble stays visible even if this process dies mid-way.
//! Exhausting the retries raises the single critical operator alert in the
//! system.

use crate::clock::Clock;
use crate::notify::{Notifier, Severity};
use crate::provider::{GpuProvider, InstanceState, ProviderError};
use crate::retry::RetryPolicy;
use crate::storage::JobRepository;
use crucible_training::TrainingJob;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The job never got an instance.
    NoInstance,
    /// `instance_terminated_at` was already set.
    AlreadyTerminated,
    /// Provider confirmed the instance is stopped or gone.
    Terminated { attempts: u32 },
    /// Provider accepted the request and is shutting the machine down.
    /// The sweeper confirms the final state later.
    Stopping { attempts: u32 },
}

#[derive(Debug, Clone, Error)]
pub enum TerminationError {
    #[error("failed to terminate instance {instance_id} after {attempts} attempts: {last_error}")]
    Exhausted { instance_id: String, attempts: u32, last_error: String },
}

pub type TerminationResult<T> = std::result::Result<T, TerminationError>;

pub struct TerminationManager {
    store: Arc<dyn JobRepository>,
    provider: Arc<dyn GpuProvider>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl TerminationManager {
    pub fn new(
        store: Arc<dyn JobRepository>,
        provider: Arc<dyn GpuProvider>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self { store, provider, notifier, clock, retry }
    }

    pub async fn terminate(&self, job: &TrainingJob) -> TerminationResult<TerminationOutcome> {
        let Some(instance_id) = job.instance_id.as_deref() else {
            return Ok(TerminationOutcome::NoInstance);
        };
        if job.instance_terminated_at.is_some() {
            return Ok(TerminationOutcome::AlreadyTerminated);
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = job.termination_attempts;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            attempts = match self.store.record_termination_attempt(&job.id, self.clock.now()) {
                Ok(count) => count,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not record termination attempt");
                    attempts + 1
                }
            };

            match self.attempt(instance_id).await {
                Ok(InstanceState::Stopping) => {
                    info!(job_id = %job.id, instance_id, attempts, "Instance stopping");
                    return Ok(TerminationOutcome::Stopping { attempts });
                }
                Ok(_) => {
                    if let Err(e) = self.store.mark_instance_terminated(&job.id, self.clock.now()) {
                        // The sweeper re-checks and records it on its next cycle.
                        warn!(job_id = %job.id, error = %e, "Could not record termination");
                    }
                    info!(job_id = %job.id, instance_id, attempts, "Instance terminated");
                    return Ok(TerminationOutcome::Terminated { attempts });
                }
                Err(e) => last_error = e,
            }

            if attempt < max_attempts {
                let delay = self.retry.delay_after(attempt);
                warn!(
                    job_id = %job.id,
                    instance_id,
                    attempt,
                    max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %last_error,
                    "Termination attempt failed; retrying"
                );
                self.clock.sleep(delay).await;
            }
        }

        error!(job_id = %job.id, instance_id, attempts, error = %last_error, "Instance termination failed");
        self.notifier.notify_ops(
            "CRITICAL: instance termination failed; instance may still be billing",
            Severity::Critical,
            json!({
                "job_id": job.id,
                "instance_id": instance_id,
                "attempts": attempts,
                "last_error": last_error,
            }),
        );
        Err(TerminationError::Exhausted { instance_id: instance_id.to_string(), attempts, last_error })
    }

    /// One terminate call plus a status read-back.
    ///
    /// Returns the confirmed state when it is stopped, gone or stopping.
    async fn attempt(&self, instance_id: &str) -> Result<InstanceState, String> {
        match self.provider.terminate(instance_id).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => {}
            Err(e) => return Err(e.to_string()),
        }
        match self.provider.instance_status(instance_id).await {
            Ok(status) if status.state.is_alive() => {
                Err(format!("instance still {} after terminate", status.state))
            }
            Ok(status) => Ok(status.state),
            Err(ProviderError::NotFound(_)) => Ok(InstanceState::Gone),
            Err(e) => Err(format!("status check failed: {e}")),
        }
    }
}
