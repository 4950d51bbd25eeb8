//! Error types for the Crucible engine.

use crate::billing::LedgerError;
use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::remote::RemoteError;
use crate::storage::StorageError;
use crate::termination::TerminationError;
use crucible_training::TrainingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("GPU provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Termination error: {0}")]
    Termination(#[from] TerminationError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
