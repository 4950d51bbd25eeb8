//! Prepaid point ledger and post-run reconciliation.

pub mod http;
pub mod reconcile;

use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpLedger;
pub use reconcile::{BillingReconciler, ReconcileOutcome};

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },

    /// Transient: network failure or ledger-side error.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Whether `user_id` can afford `points` right now.
    async fn check_balance(&self, user_id: &str, points: u64) -> LedgerResult<bool>;

    /// Debit `points`; returns the charge transaction id.
    async fn charge(&self, user_id: &str, points: u64, job_id: &str) -> LedgerResult<String>;

    /// Return part of a charge to the user.
    async fn refund(&self, transaction_id: &str, points: u64) -> LedgerResult<()>;

    /// Record that actual cost exceeded the charge. Never debits the user.
    async fn flag_overrun(&self, transaction_id: &str, points: u64) -> LedgerResult<()>;
}
