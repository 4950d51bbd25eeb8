//! Concurrent claims through separate connections to the same database file.

mod common;

use common::{request, t0};
use crucible_core::{JobRepository, SqliteJobRepository};
use crucible_training::{JobStatus, TrainingJob};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_exactly_one_worker_wins_a_contended_claim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");

    let job = TrainingJob::queued(request(632), t0()).unwrap();
    SqliteJobRepository::open(&path).unwrap().insert(&job).unwrap();

    const WORKERS: usize = 8;
    let repositories: Vec<_> =
        (0..WORKERS).map(|_| SqliteJobRepository::open(&path).unwrap()).collect();
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = repositories
        .into_iter()
        .enumerate()
        .map(|(i, repo)| {
            let barrier = Arc::clone(&barrier);
            let id = job.id.clone();
            thread::spawn(move || {
                barrier.wait();
                repo.claim(&id, &format!("worker-{i}"), t0()).unwrap().map(|_| i)
            })
        })
        .collect();

    let winners: Vec<usize> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
    assert_eq!(winners.len(), 1);

    let stored = SqliteJobRepository::open(&path).unwrap().get(&job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Provisioning);
    assert_eq!(stored.claimed_by, Some(format!("worker-{}", winners[0])));
}

#[test]
fn test_claimed_job_is_no_longer_offered() {
    let store = SqliteJobRepository::open_in_memory().unwrap();
    let first = TrainingJob::queued(request(100), t0()).unwrap();
    let second = TrainingJob::queued(request(200), t0() + chrono::Duration::seconds(1)).unwrap();
    store.insert(&first).unwrap();
    store.insert(&second).unwrap();

    assert_eq!(store.fetch_next_queued("test").unwrap().unwrap().id, first.id);
    store.claim(&first.id, "worker-1", t0()).unwrap().unwrap();
    assert_eq!(store.fetch_next_queued("test").unwrap().unwrap().id, second.id);
    assert!(store.fetch_next_queued("other-env").unwrap().is_none());
}
