use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a training job.
///
/// States only move forward along the declaration order, one step at a time.
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Provisioning,
    Uploading,
    Training,
    Finalizing,
    Completed,
    Failed,
}

impl JobStatus {
    /// States in which a worker owns the job and a heartbeat is expected.
    pub const ACTIVE: [JobStatus; 4] =
        [Self::Provisioning, Self::Uploading, Self::Training, Self::Finalizing];

    pub const TERMINAL: [JobStatus; 2] = [Self::Completed, Self::Failed];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Provisioning => "provisioning",
            Self::Uploading => "uploading",
            Self::Training => "training",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// The single forward successor on the happy path.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Provisioning),
            Self::Provisioning => Some(Self::Uploading),
            Self::Uploading => Some(Self::Training),
            Self::Training => Some(Self::Finalizing),
            Self::Finalizing => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match to {
            Self::Failed => !self.is_terminal(),
            _ => self.next() == Some(to),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "provisioning" => Ok(Self::Provisioning),
            "uploading" => Ok(Self::Uploading),
            "training" => Ok(Self::Training),
            "finalizing" => Ok(Self::Finalizing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TrainingError::InvalidStatus(other.to_string())),
        }
    }
}

/// Machine-readable tag recorded on a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InsufficientBalance,
    ProvisioningFailure,
    UploadFailure,
    RemoteUnreachable,
    InstanceLost,
    TrainingCrashed,
    StallTimeout,
    HardTimeout,
    ArtifactFailure,
    TerminationFailure,
    StuckSweeperCleanup,
    InternalError,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientBalance => "insufficient_balance",
            Self::ProvisioningFailure => "provisioning_failure",
            Self::UploadFailure => "upload_failure",
            Self::RemoteUnreachable => "remote_unreachable",
            Self::InstanceLost => "instance_lost",
            Self::TrainingCrashed => "training_crashed",
            Self::StallTimeout => "stall_timeout",
            Self::HardTimeout => "hard_timeout",
            Self::ArtifactFailure => "artifact_failure",
            Self::TerminationFailure => "termination_failure",
            Self::StuckSweeperCleanup => "stuck_sweeper_cleanup",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insufficient_balance" => Ok(Self::InsufficientBalance),
            "provisioning_failure" => Ok(Self::ProvisioningFailure),
            "upload_failure" => Ok(Self::UploadFailure),
            "remote_unreachable" => Ok(Self::RemoteUnreachable),
            "instance_lost" => Ok(Self::InstanceLost),
            "training_crashed" => Ok(Self::TrainingCrashed),
            "stall_timeout" => Ok(Self::StallTimeout),
            "hard_timeout" => Ok(Self::HardTimeout),
            "artifact_failure" => Ok(Self::ArtifactFailure),
            "termination_failure" => Ok(Self::TerminationFailure),
            "stuck_sweeper_cleanup" => Ok(Self::StuckSweeperCleanup),
            "internal_error" => Ok(Self::InternalError),
            other => Err(TrainingError::InvalidFailureReason(other.to_string())),
        }
    }
}

/// What a submitter provides when enqueueing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub user_id: String,
    pub environment: String,
    pub model_family: String,
    pub total_steps: u64,
    pub dataset_uri: String,
    pub dataset_size: u64,
}

impl JobRequest {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.user_id.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("user_id is required".to_string()));
        }
        if self.environment.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("environment is required".to_string()));
        }
        if self.model_family.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("model_family is required".to_string()));
        }
        if self.total_steps == 0 {
            return Err(TrainingError::InvalidRequest("total_steps must be >= 1".to_string()));
        }
        if self.dataset_uri.trim().is_empty() {
            return Err(TrainingError::InvalidRequest("dataset_uri is required".to_string()));
        }
        Ok(())
    }
}

/// One fine-tuning request and everything the orchestrator learns while running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: JobId,
    pub environment: String,
    pub user_id: String,
    pub model_family: String,
    pub dataset_uri: String,
    pub dataset_size: u64,
    pub status: JobStatus,
    pub claimed_by: Option<String>,

    pub estimated_cost_points: Option<u64>,
    pub actual_cost_points: Option<u64>,
    pub cost_reconciled: bool,
    pub reconciliation_flagged: bool,
    pub charge_transaction_id: Option<String>,

    pub instance_id: Option<String>,
    pub offer_id: Option<String>,
    pub gpu_type: Option<String>,
    pub hourly_rate: Option<f64>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub provisioned_at: Option<DateTime<Utc>>,

    pub soft_timeout_at: Option<DateTime<Utc>>,
    pub hard_timeout_at: Option<DateTime<Utc>>,
    pub training_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub current_step: u64,
    pub total_steps: u64,
    pub current_loss: Option<f64>,

    pub instance_terminated_at: Option<DateTime<Utc>>,
    pub termination_attempts: u32,

    pub failure_reason: Option<FailureReason>,
    pub failure_detail: Option<String>,
    pub partial_result: bool,
    pub artifact_uri: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TrainingJob {
    /// Build a fresh `Queued` job from a validated request.
    pub fn queued(request: JobRequest, now: DateTime<Utc>) -> TrainingResult<Self> {
        request.validate()?;
        Ok(Self {
            id: JobId::new(),
            environment: request.environment,
            user_id: request.user_id,
            model_family: request.model_family,
            dataset_uri: request.dataset_uri,
            dataset_size: request.dataset_size,
            status: JobStatus::Queued,
            claimed_by: None,
            estimated_cost_points: None,
            actual_cost_points: None,
            cost_reconciled: false,
            reconciliation_flagged: false,
            charge_transaction_id: None,
            instance_id: None,
            offer_id: None,
            gpu_type: None,
            hourly_rate: None,
            ssh_host: None,
            ssh_port: None,
            provisioned_at: None,
            soft_timeout_at: None,
            hard_timeout_at: None,
            training_started_at: None,
            created_at: now,
            updated_at: now,
            current_step: 0,
            total_steps: request.total_steps,
            current_loss: None,
            instance_terminated_at: None,
            termination_attempts: 0,
            failure_reason: None,
            failure_detail: None,
            partial_result: false,
            artifact_uri: None,
            completed_at: None,
        })
    }

    /// The request this job was created from, used to requeue a failed job.
    #[must_use]
    pub fn request(&self) -> JobRequest {
        JobRequest {
            user_id: self.user_id.clone(),
            environment: self.environment.clone(),
            model_family: self.model_family.clone(),
            total_steps: self.total_steps,
            dataset_uri: self.dataset_uri.clone(),
            dataset_size: self.dataset_size,
        }
    }

    /// True while a rented instance may still be billing.
    #[must_use]
    pub fn has_live_instance(&self) -> bool {
        self.instance_id.is_some() && self.instance_terminated_at.is_none()
    }

    #[must_use]
    pub fn progress_fraction(&self) -> f64 {
        if self.total_steps == 0 {
            return 0.0;
        }
        (self.current_step as f64 / self.total_steps as f64).clamp(0.0, 1.0)
    }
}
