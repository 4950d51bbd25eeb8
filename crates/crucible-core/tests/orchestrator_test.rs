mod common;

use common::{test_config, Harness};
use crucible_core::{JobOutcome, JobProcessor, JobRepository, Orchestrator, ShutdownOutcome};
use crucible_training::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn orchestrator(harness: &Harness, shutdown_max_wait_secs: u64) -> Orchestrator {
    let mut config = test_config();
    config.orchestrator.shutdown_max_wait_secs = shutdown_max_wait_secs;
    let config = Arc::new(config);
    let processor = Arc::new(JobProcessor::new(&harness.collaborators(), Arc::clone(&config)));
    Orchestrator::new(harness.store.clone(), processor, harness.clock.clone(), &config.orchestrator)
}

async fn wait_for_status(harness: &Harness, id: &crucible_training::JobId, status: JobStatus) {
    for _ in 0..500 {
        if harness.store.get(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {status}");
}

#[tokio::test]
async fn test_run_once_processes_the_oldest_queued_job() {
    let harness = Harness::new(20_000);
    let job = harness.enqueue(632);
    let orchestrator = orchestrator(&harness, 600);

    let outcome = orchestrator.run_once().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    assert_eq!(harness.store.get(&job.id).unwrap().status, JobStatus::Completed);
    assert!(orchestrator.current_job().is_none());

    assert!(orchestrator.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_shutdown_with_empty_queue_is_clean() {
    let harness = Harness::new(20_000);
    let token = CancellationToken::new();
    token.cancel();

    let outcome = orchestrator(&harness, 600).run(token).await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_drains_queue_then_stops_cleanly() {
    let harness = Harness::new(40_000);
    let first = harness.enqueue(632);
    let second = harness.enqueue(632);
    let orchestrator = Arc::new(orchestrator(&harness, 600));
    let token = CancellationToken::new();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let token = token.clone();
        tokio::spawn(async move { orchestrator.run(token).await })
    };

    wait_for_status(&harness, &first.id, JobStatus::Completed).await;
    wait_for_status(&harness, &second.id, JobStatus::Completed).await;
    token.cancel();

    assert_eq!(runner.await.unwrap().unwrap(), ShutdownOutcome::Clean);
    assert_eq!(harness.ledger.charges().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_outliving_shutdown_wait_is_abandoned() {
    let harness = Harness::new(20_000);
    *harness.shell.hang_on.lock().unwrap() = Some("stage".to_string());
    let job = harness.enqueue(632);
    let orchestrator = Arc::new(orchestrator(&harness, 1));
    let token = CancellationToken::new();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let token = token.clone();
        tokio::spawn(async move { orchestrator.run(token).await })
    };

    wait_for_status(&harness, &job.id, JobStatus::Uploading).await;
    assert_eq!(orchestrator.current_job(), Some(job.id.clone()));
    token.cancel();

    let outcome = runner.await.unwrap().unwrap();
    assert_eq!(outcome, ShutdownOutcome::Abandoned { job_id: job.id.clone() });
    assert!(orchestrator.current_job().is_none());
    // Left mid-flight for the sweeper.
    assert_eq!(harness.store.get(&job.id).unwrap().status, JobStatus::Uploading);
}
