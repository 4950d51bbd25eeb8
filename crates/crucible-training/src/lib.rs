//! Crucible Training
//!
//! Pure domain types for rented-GPU training jobs:
//! - The job record and its status lifecycle (`TrainingJob`, `JobStatus`)
//! - Prepaid cost estimation (`CostEstimator`)
//! - Remote progress parsing (`parse_progress`)
//! - Advisory stall detection (`StallDetector`)
//!
//! Nothing in here performs I/O; the orchestration lives in `crucible-core`.

pub mod error;
pub mod estimate;
pub mod job;
pub mod progress;
pub mod stall;

pub use error::{TrainingError, TrainingResult};
pub use estimate::{CostEstimate, CostEstimator, EstimatorConfig, FamilyProfile};
pub use job::{FailureReason, JobId, JobRequest, JobStatus, TrainingJob};
pub use progress::{parse_progress, ProgressReport, RunState};
pub use stall::{
    EtaSample, StallConfidence, StallConfig, StallDetector, StallVerdict, ThroughputSample,
};
