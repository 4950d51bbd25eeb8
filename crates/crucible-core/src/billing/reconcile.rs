//! Post-run billing reconciliation.
//!
//! Actual cost is rented time (provisioning to now) priced at the instance's
//! real hourly rate. Underspend is refunded; overspend is only flagged, never
//! charged. The reconciliation is recorded before the ledger is touched so a
//! concurrent or repeated call can never refund twice.

use super::Ledger;
use crate::clock::Clock;
use crate::notify::{Notifier, Severity};
use crate::storage::{JobRepository, StorageResult};
use crucible_training::{CostEstimator, JobId};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No charge was ever taken for this job.
    NotCharged,
    AlreadyReconciled,
    Exact { actual: u64 },
    Refunded { actual: u64, refund: u64 },
    Flagged { actual: u64, overrun: u64 },
}

pub struct BillingReconciler {
    store: Arc<dyn JobRepository>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    estimator: Arc<CostEstimator>,
    clock: Arc<dyn Clock>,
}

impl BillingReconciler {
    pub fn new(
        store: Arc<dyn JobRepository>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        estimator: Arc<CostEstimator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, ledger, notifier, estimator, clock }
    }

    pub async fn reconcile(&self, job_id: &JobId) -> StorageResult<ReconcileOutcome> {
        let job = self.store.get(job_id)?;
        if job.cost_reconciled {
            return Ok(ReconcileOutcome::AlreadyReconciled);
        }
        let (Some(estimated), Some(transaction_id)) =
            (job.estimated_cost_points, job.charge_transaction_id.clone())
        else {
            return Ok(ReconcileOutcome::NotCharged);
        };

        let now = self.clock.now();
        let actual = match (job.provisioned_at, job.hourly_rate) {
            (Some(start), Some(rate)) => {
                let end = job.instance_terminated_at.unwrap_or(now).max(start);
                self.estimator.actual_points(end - start, rate)
            }
            _ => 0,
        };
        let flagged = actual > estimated;

        if !self.store.mark_reconciled(job_id, actual, flagged, now)? {
            return Ok(ReconcileOutcome::AlreadyReconciled);
        }

        let outcome = if actual < estimated {
            let refund = estimated - actual;
            if let Err(e) = self.ledger.refund(&transaction_id, refund).await {
                error!(job_id = %job_id, transaction_id, refund, error = %e, "Refund failed");
                self.notifier.notify_ops(
                    "refund failed; manual refund required",
                    Severity::Warning,
                    json!({ "job_id": job_id, "transaction_id": transaction_id, "points": refund }),
                );
            }
            ReconcileOutcome::Refunded { actual, refund }
        } else if flagged {
            let overrun = actual - estimated;
            if let Err(e) = self.ledger.flag_overrun(&transaction_id, overrun).await {
                warn!(job_id = %job_id, transaction_id, overrun, error = %e, "Overrun flag failed");
            }
            self.notifier.notify_ops(
                "job cost exceeded its prepaid charge",
                Severity::Warning,
                json!({ "job_id": job_id, "estimated": estimated, "actual": actual }),
            );
            ReconcileOutcome::Flagged { actual, overrun }
        } else {
            ReconcileOutcome::Exact { actual }
        };

        info!(job_id = %job_id, estimated, actual, outcome = ?outcome, "Billing reconciled");
        Ok(outcome)
    }
}
