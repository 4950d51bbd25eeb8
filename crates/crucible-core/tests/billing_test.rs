mod common;

use chrono::Duration;
use common::{estimator_config, t0, Harness};
use crucible_core::{BillingReconciler, JobRepository, ReconcileOutcome, Severity};
use crucible_training::CostEstimator;
use std::sync::Arc;

fn reconciler(harness: &Harness) -> BillingReconciler {
    BillingReconciler::new(
        harness.store.clone(),
        harness.ledger.clone(),
        harness.notifier.clone(),
        Arc::new(CostEstimator::new(estimator_config())),
        harness.clock.clone(),
    )
}

#[tokio::test]
async fn test_underspend_is_refunded() {
    let harness = Harness::new(0);
    let job = harness.provisioned_job("inst-1");
    harness.store.mark_instance_terminated(&job.id, t0() + Duration::hours(10)).unwrap();

    let outcome = reconciler(&harness).reconcile(&job.id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Refunded { actual: 2_000, refund: 13_800 });
    assert_eq!(harness.ledger.refunds(), vec![("tx-1".to_string(), 13_800)]);

    let stored = harness.store.get(&job.id).unwrap();
    assert!(stored.cost_reconciled);
    assert_eq!(stored.actual_cost_points, Some(2_000));
    assert!(!stored.reconciliation_flagged);
}

#[tokio::test]
async fn test_overrun_is_flagged_not_charged() {
    let harness = Harness::new(0);
    let job = harness.provisioned_job("inst-1");
    harness.store.mark_instance_terminated(&job.id, t0() + Duration::hours(100)).unwrap();

    let outcome = reconciler(&harness).reconcile(&job.id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Flagged { actual: 20_000, overrun: 4_200 });

    assert_eq!(harness.ledger.flags(), vec![("tx-1".to_string(), 4_200)]);
    assert!(harness.ledger.refunds().is_empty());
    assert_eq!(harness.ledger.charges().len(), 0);
    assert_eq!(harness.notifier.ops_count(Severity::Warning), 1);
    assert!(harness.store.get(&job.id).unwrap().reconciliation_flagged);
}

#[tokio::test]
async fn test_second_reconciliation_does_not_refund_twice() {
    let harness = Harness::new(0);
    let job = harness.provisioned_job("inst-1");
    harness.store.mark_instance_terminated(&job.id, t0() + Duration::hours(10)).unwrap();
    let reconciler = reconciler(&harness);

    reconciler.reconcile(&job.id).await.unwrap();
    assert_eq!(reconciler.reconcile(&job.id).await.unwrap(), ReconcileOutcome::AlreadyReconciled);
    assert_eq!(harness.ledger.refunds().len(), 1);
}

#[tokio::test]
async fn test_running_instance_is_priced_up_to_now() {
    let harness = Harness::new(0);
    let job = harness.provisioned_job("inst-1");
    harness.clock.advance(Duration::minutes(90));

    let outcome = reconciler(&harness).reconcile(&job.id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Refunded { actual: 300, refund: 15_500 });
}

#[tokio::test]
async fn test_uncharged_job_is_skipped() {
    let harness = Harness::new(0);
    let job = harness.enqueue(632);

    let outcome = reconciler(&harness).reconcile(&job.id).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::NotCharged);
    assert!(!harness.store.get(&job.id).unwrap().cost_reconciled);
    assert!(harness.ledger.refunds().is_empty());
}
