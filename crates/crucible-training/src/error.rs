use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training job request: {0}")]
    InvalidRequest(String),

    #[error("invalid estimator configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown model family: {0}")]
    UnknownModelFamily(String),

    #[error("no hourly rate configured for GPU class: {0}")]
    UnknownGpuClass(String),

    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    #[error("invalid failure reason: {0}")]
    InvalidFailureReason(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
