//! Crucible Core - training-job orchestration on rented GPUs.
//!
//! This crate provides:
//! - The SQLite job store with atomic claim and status-guarded updates
//! - GPU provider, remote shell, ledger and notification adapters
//! - The job processor state machine and its monitoring loop
//! - Termination, billing reconciliation and the orphan sweeper
//!
//! # Example
//!
//! ```rust,no_run
//! use crucible_core::{Collaborators, CrucibleConfig, JobProcessor, Orchestrator};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> crucible_core::CoreResult<()> {
//!     let config = Arc::new(CrucibleConfig::load(None)?);
//!     let collaborators = Collaborators::from_config(&config)?;
//!     let processor = Arc::new(JobProcessor::new(&collaborators, Arc::clone(&config)));
//!     let orchestrator = Orchestrator::new(
//!         collaborators.store.clone(),
//!         processor,
//!         collaborators.clock.clone(),
//!         &config.orchestrator,
//!     );
//!     orchestrator.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod billing;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod notify;
pub mod orchestrator;
pub mod processor;
pub mod provider;
pub mod remote;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod termination;

pub use billing::{BillingReconciler, HttpLedger, Ledger, LedgerError, ReconcileOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CrucibleConfig};
pub use context::Collaborators;
pub use error::{CoreError, CoreResult};
pub use notify::{LogNotifier, Notifier, Severity, WebhookNotifier};
pub use orchestrator::{Orchestrator, ShutdownOutcome};
pub use processor::{JobError, JobOutcome, JobProcessor};
pub use provider::{GpuProvider, HttpGpuProvider, InstanceState, InstanceStatus, Offer, ProviderError};
pub use remote::{RemoteError, RemoteShell, RemoteTarget, ResilientShell, SshShell};
pub use retry::RetryPolicy;
pub use storage::{
    Database, JobFailure, JobFilter, JobRepository, SqliteJobRepository, StorageError,
};
pub use sweeper::{SweepReport, Sweeper};
pub use termination::{TerminationError, TerminationManager, TerminationOutcome};
