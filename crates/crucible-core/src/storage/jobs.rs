//! Training job repository.
//!
//! Every status mutation is a single conditional `UPDATE` guarded on the
//! expected current status. That guard is the only concurrency control between
//! the orchestrator and the sweeper; there is no in-process locking across
//! actors.

use crate::storage::database::Database;
use crate::storage::error::{StorageError, StorageResult};
use chrono::{DateTime, SecondsFormat, Utc};
use crucible_training::{FailureReason, JobId, JobStatus, TrainingJob};
use rusqlite::{params, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str = "id, environment, user_id, model_family, dataset_uri, dataset_size, \
     status, claimed_by, estimated_cost_points, actual_cost_points, cost_reconciled, \
     reconciliation_flagged, charge_transaction_id, instance_id, offer_id, gpu_type, hourly_rate, \
     ssh_host, ssh_port, provisioned_at, soft_timeout_at, hard_timeout_at, training_started_at, \
     created_at, updated_at, current_step, total_steps, current_loss, instance_terminated_at, \
     termination_attempts, failure_reason, failure_detail, partial_result, artifact_uri, completed_at";

/// Filter for [`JobRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub limit: Option<usize>,
}

/// Instance details persisted the moment provisioning succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub offer_id: String,
    pub gpu_type: String,
    pub hourly_rate: f64,
    pub provisioned_at: DateTime<Utc>,
    pub soft_timeout_at: DateTime<Utc>,
    pub hard_timeout_at: DateTime<Utc>,
}

/// Terminal failure details.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub detail: String,
    pub partial_result: bool,
    pub artifact_uri: Option<String>,
}

impl JobFailure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self { reason, detail: detail.into(), partial_result: false, artifact_uri: None }
    }
}

/// Persistent store of training jobs.
///
/// Implementations must make `claim` and every status-changing call a single
/// atomic compare-and-set on the stored status.
pub trait JobRepository: Send + Sync {
    /// Enqueue a new job. Only `Queued` jobs may be inserted.
    fn insert(&self, job: &TrainingJob) -> StorageResult<()>;

    fn get(&self, id: &JobId) -> StorageResult<TrainingJob>;

    /// Newest first.
    fn list(&self, filter: &JobFilter) -> StorageResult<Vec<TrainingJob>>;

    /// Oldest queued job for `environment`, without mutating anything.
    fn fetch_next_queued(&self, environment: &str) -> StorageResult<Option<TrainingJob>>;

    /// Atomically move a job `Queued -> Provisioning`.
    ///
    /// Returns `None` when another actor already claimed it.
    fn claim(
        &self,
        id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<TrainingJob>>;

    /// Guarded forward transition. Idempotent when the job is already in `to`.
    fn set_status(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Persist progress for a job in `Training`.
    fn update_progress(
        &self,
        id: &JobId,
        step: u64,
        loss: Option<f64>,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Refresh the liveness heartbeat of an active job.
    fn touch(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()>;

    fn record_charge(
        &self,
        id: &JobId,
        estimated_points: u64,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Persist a freshly created instance. Not status-guarded: an instance id
    /// must never be dropped, whatever happened to the job meanwhile.
    fn record_instance(
        &self,
        id: &JobId,
        instance: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    fn record_endpoint(
        &self,
        id: &JobId,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Increment the termination attempt counter and return the new value.
    fn record_termination_attempt(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<u32>;

    /// Set `instance_terminated_at` once; later calls keep the first timestamp.
    fn mark_instance_terminated(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()>;

    /// `Finalizing -> Completed`. Idempotent.
    fn mark_completed(
        &self,
        id: &JobId,
        artifact_uri: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Move any non-terminal job to `Failed`.
    ///
    /// Returns `false` when the job was already terminal and nothing changed.
    fn mark_failed(&self, id: &JobId, failure: &JobFailure, now: DateTime<Utc>)
    -> StorageResult<bool>;

    /// Move a job to `Failed` only while it is still in `from`.
    ///
    /// Returns `false` when the job has moved on, e.g. another worker claimed
    /// it after the caller read its snapshot.
    fn mark_failed_from(
        &self,
        id: &JobId,
        from: JobStatus,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Move an active job to `Failed` only if its heartbeat is still older
    /// than `older_than`. Returns `false` when it progressed meanwhile.
    fn fail_if_stale(
        &self,
        id: &JobId,
        older_than: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Record the billing reconciliation result exactly once.
    ///
    /// Returns `false` when the job had already been reconciled.
    fn mark_reconciled(
        &self,
        id: &JobId,
        actual_points: u64,
        flagged: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Terminal jobs whose instance has not been confirmed dead.
    fn find_orphan_candidates(&self) -> StorageResult<Vec<TrainingJob>>;

    /// Active jobs whose heartbeat is older than `older_than`.
    fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<TrainingJob>>;

    /// Enqueue a fresh copy of a failed job. The failed record is left untouched.
    fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<TrainingJob>;
}

/// SQLite implementation of [`JobRepository`].
#[derive(Clone)]
pub struct SqliteJobRepository {
    db: Arc<Mutex<Database>>,
}

impl SqliteJobRepository {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(Mutex::new(db)) }
    }

    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    fn db(&self) -> StorageResult<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StorageError::InvalidData("database mutex poisoned".to_string()))
    }

    fn current_status(db: &Database, id: &JobId) -> StorageResult<JobStatus> {
        let status: Option<String> = db
            .conn()
            .query_row("SELECT status FROM training_jobs WHERE id = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        match status {
            Some(s) => s.parse().map_err(|_| StorageError::InvalidData(format!("status '{s}'"))),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Translate a zero-row guarded update into the right error.
    fn guard_miss(db: &Database, id: &JobId, expected: &str) -> StorageError {
        match Self::current_status(db, id) {
            Ok(actual) => {
                StorageError::Conflict { job_id: id.to_string(), expected: expected.to_string(), actual }
            }
            Err(e) => e,
        }
    }

    /// Fail a job that is in one of `statuses` and, when `stale_before` is
    /// set, whose heartbeat predates it. `false` on a guard miss.
    fn fail_guarded(
        &self,
        id: &JobId,
        failure: &JobFailure,
        now: DateTime<Utc>,
        statuses: &[JobStatus],
        stale_before: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        let db = self.db()?;
        let now = ts(now);
        let allowed =
            statuses.iter().map(|s| format!("'{}'", s.as_str())).collect::<Vec<_>>().join(", ");
        let changed = db.conn().execute(
            &format!(
                "UPDATE training_jobs SET status = 'failed', failure_reason = ?2, failure_detail = ?3, \
                     partial_result = ?4, artifact_uri = COALESCE(?5, artifact_uri), \
                     completed_at = ?6, updated_at = ?6 \
                 WHERE id = ?1 AND status IN ({allowed}) AND (?7 IS NULL OR updated_at < ?7)"
            ),
            params![
                id.as_str(),
                failure.reason.as_str(),
                failure.detail,
                failure.partial_result,
                failure.artifact_uri,
                now,
                stale_before.map(ts),
            ],
        )?;
        if changed == 0 {
            // Surface NotFound; a job that moved on is not an error.
            let actual = Self::current_status(&db, id)?;
            debug!(job_id = %id, status = %actual, "Failure guard missed; job left as is");
            return Ok(false);
        }
        warn!(job_id = %id, reason = %failure.reason, detail = %failure.detail, "Job failed");
        Ok(true)
    }

    fn query_jobs(
        db: &Database,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<TrainingJob>> {
        let mut stmt = db.conn().prepare(sql)?;
        let jobs = stmt
            .query_map(params, row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn active_status_list() -> String {
    JobStatus::ACTIVE.iter().map(|s| format!("'{}'", s.as_str())).collect::<Vec<_>>().join(", ")
}

fn invalid_column(name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, name.to_string(), rusqlite::types::Type::Text)
}

fn parse_timestamp(row: &Row, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(name)?;
    value
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| invalid_column(name))
        })
        .transpose()
}

fn required_timestamp(row: &Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row, name)?.ok_or_else(|| invalid_column(name))
}

fn get_u64(row: &Row, name: &str) -> rusqlite::Result<u64> {
    let value: i64 = row.get(name)?;
    u64::try_from(value).map_err(|_| invalid_column(name))
}

fn get_opt_u64(row: &Row, name: &str) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(name)?;
    value.map(|v| u64::try_from(v).map_err(|_| invalid_column(name))).transpose()
}

fn row_to_job(row: &Row) -> rusqlite::Result<TrainingJob> {
    let status: String = row.get("status")?;
    let status = status.parse::<JobStatus>().map_err(|_| invalid_column("status"))?;
    let failure_reason: Option<String> = row.get("failure_reason")?;
    let failure_reason = failure_reason
        .map(|s| s.parse::<FailureReason>().map_err(|_| invalid_column("failure_reason")))
        .transpose()?;
    let ssh_port: Option<i64> = row.get("ssh_port")?;
    let ssh_port =
        ssh_port.map(|p| u16::try_from(p).map_err(|_| invalid_column("ssh_port"))).transpose()?;
    let attempts: i64 = row.get("termination_attempts")?;

    Ok(TrainingJob {
        id: JobId(row.get("id")?),
        environment: row.get("environment")?,
        user_id: row.get("user_id")?,
        model_family: row.get("model_family")?,
        dataset_uri: row.get("dataset_uri")?,
        dataset_size: get_u64(row, "dataset_size")?,
        status,
        claimed_by: row.get("claimed_by")?,
        estimated_cost_points: get_opt_u64(row, "estimated_cost_points")?,
        actual_cost_points: get_opt_u64(row, "actual_cost_points")?,
        cost_reconciled: row.get("cost_reconciled")?,
        reconciliation_flagged: row.get("reconciliation_flagged")?,
        charge_transaction_id: row.get("charge_transaction_id")?,
        instance_id: row.get("instance_id")?,
        offer_id: row.get("offer_id")?,
        gpu_type: row.get("gpu_type")?,
        hourly_rate: row.get("hourly_rate")?,
        ssh_host: row.get("ssh_host")?,
        ssh_port,
        provisioned_at: parse_timestamp(row, "provisioned_at")?,
        soft_timeout_at: parse_timestamp(row, "soft_timeout_at")?,
        hard_timeout_at: parse_timestamp(row, "hard_timeout_at")?,
        training_started_at: parse_timestamp(row, "training_started_at")?,
        created_at: required_timestamp(row, "created_at")?,
        updated_at: required_timestamp(row, "updated_at")?,
        current_step: get_u64(row, "current_step")?,
        total_steps: get_u64(row, "total_steps")?,
        current_loss: row.get("current_loss")?,
        instance_terminated_at: parse_timestamp(row, "instance_terminated_at")?,
        termination_attempts: u32::try_from(attempts)
            .map_err(|_| invalid_column("termination_attempts"))?,
        failure_reason,
        failure_detail: row.get("failure_detail")?,
        partial_result: row.get("partial_result")?,
        artifact_uri: row.get("artifact_uri")?,
        completed_at: parse_timestamp(row, "completed_at")?,
    })
}

fn insert_queued(conn: &rusqlite::Connection, job: &TrainingJob) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO training_jobs (id, environment, user_id, model_family, dataset_uri, dataset_size, \
         status, created_at, updated_at, current_step, total_steps) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
        params![
            job.id.as_str(),
            job.environment,
            job.user_id,
            job.model_family,
            job.dataset_uri,
            job.dataset_size,
            JobStatus::Queued.as_str(),
            ts(job.created_at),
            ts(job.updated_at),
            job.total_steps,
        ],
    )?;
    Ok(())
}

impl JobRepository for SqliteJobRepository {
    fn insert(&self, job: &TrainingJob) -> StorageResult<()> {
        if job.status != JobStatus::Queued {
            return Err(StorageError::IllegalTransition { from: job.status, to: JobStatus::Queued });
        }
        let db = self.db()?;
        insert_queued(db.conn(), job)?;
        info!(job_id = %job.id, environment = %job.environment, "Enqueued training job");
        Ok(())
    }

    fn get(&self, id: &JobId) -> StorageResult<TrainingJob> {
        let db = self.db()?;
        db.conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = ?1"),
                params![id.as_str()],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn list(&self, filter: &JobFilter) -> StorageResult<Vec<TrainingJob>> {
        let db = self.db()?;
        let limit = filter.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        Self::query_jobs(
            &db,
            &format!(
                "SELECT {JOB_COLUMNS} FROM training_jobs \
                 WHERE (?1 IS NULL OR status = ?1) \
                   AND (?2 IS NULL OR environment = ?2) \
                   AND (?3 IS NULL OR user_id = ?3) \
                 ORDER BY created_at DESC, id LIMIT ?4"
            ),
            params![
                filter.status.map(JobStatus::as_str),
                filter.environment,
                filter.user_id,
                limit
            ],
        )
    }

    fn fetch_next_queued(&self, environment: &str) -> StorageResult<Option<TrainingJob>> {
        let db = self.db()?;
        let job = db
            .conn()
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM training_jobs \
                     WHERE environment = ?1 AND status = 'queued' \
                     ORDER BY created_at ASC, id ASC LIMIT 1"
                ),
                params![environment],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn claim(
        &self,
        id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<TrainingJob>> {
        let db = self.db()?;
        let claimed = db
            .conn()
            .query_row(
                &format!(
                    "UPDATE training_jobs SET status = 'provisioning', claimed_by = ?2, updated_at = ?3 \
                     WHERE id = ?1 AND status = 'queued' \
                     RETURNING {JOB_COLUMNS}"
                ),
                params![id.as_str(), worker_id, ts(now)],
                row_to_job,
            )
            .optional()?;
        match &claimed {
            Some(_) => info!(job_id = %id, worker_id, "Claimed training job"),
            None => debug!(job_id = %id, worker_id, "Job already claimed by another actor"),
        }
        Ok(claimed)
    }

    fn set_status(
        &self,
        id: &JobId,
        from: JobStatus,
        to: JobStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        if !from.can_transition_to(to) {
            return Err(StorageError::IllegalTransition { from, to });
        }
        let db = self.db()?;
        let now = ts(now);
        let changed = db.conn().execute(
            "UPDATE training_jobs SET status = ?3, updated_at = ?4, \
                 training_started_at = CASE WHEN ?3 = 'training' THEN ?4 ELSE training_started_at END, \
                 completed_at = CASE WHEN ?3 IN ('completed', 'failed') THEN ?4 ELSE completed_at END \
             WHERE id = ?1 AND status = ?2",
            params![id.as_str(), from.as_str(), to.as_str(), now],
        )?;
        if changed == 0 {
            return match Self::current_status(&db, id)? {
                actual if actual == to => Ok(()),
                actual => Err(StorageError::Conflict {
                    job_id: id.to_string(),
                    expected: from.to_string(),
                    actual,
                }),
            };
        }
        info!(job_id = %id, from = %from, to = %to, "Job status changed");
        Ok(())
    }

    fn update_progress(
        &self,
        id: &JobId,
        step: u64,
        loss: Option<f64>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET current_step = ?2, current_loss = COALESCE(?3, current_loss), updated_at = ?4 \
             WHERE id = ?1 AND status = 'training'",
            params![id.as_str(), step, loss, ts(now)],
        )?;
        if changed == 0 {
            return Err(Self::guard_miss(&db, id, JobStatus::Training.as_str()));
        }
        Ok(())
    }

    fn touch(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            &format!(
                "UPDATE training_jobs SET updated_at = ?2 WHERE id = ?1 AND status IN ({})",
                active_status_list()
            ),
            params![id.as_str(), ts(now)],
        )?;
        if changed == 0 {
            return Err(Self::guard_miss(&db, id, "an active status"));
        }
        Ok(())
    }

    fn record_charge(
        &self,
        id: &JobId,
        estimated_points: u64,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET estimated_cost_points = ?2, charge_transaction_id = ?3, updated_at = ?4 \
             WHERE id = ?1",
            params![id.as_str(), estimated_points, transaction_id, ts(now)],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn record_instance(
        &self,
        id: &JobId,
        instance: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET instance_id = ?2, offer_id = ?3, gpu_type = ?4, hourly_rate = ?5, \
                 provisioned_at = ?6, soft_timeout_at = ?7, hard_timeout_at = ?8, updated_at = ?9 \
             WHERE id = ?1",
            params![
                id.as_str(),
                instance.instance_id,
                instance.offer_id,
                instance.gpu_type,
                instance.hourly_rate,
                ts(instance.provisioned_at),
                ts(instance.soft_timeout_at),
                ts(instance.hard_timeout_at),
                ts(now),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        info!(job_id = %id, instance_id = %instance.instance_id, "Persisted instance");
        Ok(())
    }

    fn record_endpoint(
        &self,
        id: &JobId,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET ssh_host = ?2, ssh_port = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.as_str(), host, port, ts(now)],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn record_termination_attempt(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<u32> {
        let db = self.db()?;
        let attempts: Option<i64> = db
            .conn()
            .query_row(
                "UPDATE training_jobs SET termination_attempts = termination_attempts + 1, updated_at = \
                     CASE WHEN status IN ('completed', 'failed') THEN updated_at ELSE ?2 END \
                 WHERE id = ?1 RETURNING termination_attempts",
                params![id.as_str(), ts(now)],
                |row| row.get(0),
            )
            .optional()?;
        let attempts = attempts.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        u32::try_from(attempts).map_err(|_| StorageError::InvalidData(format!("attempts {attempts}")))
    }

    fn mark_instance_terminated(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET instance_terminated_at = COALESCE(instance_terminated_at, ?2) \
             WHERE id = ?1",
            params![id.as_str(), ts(now)],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        info!(job_id = %id, "Instance confirmed terminated");
        Ok(())
    }

    fn mark_completed(
        &self,
        id: &JobId,
        artifact_uri: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let db = self.db()?;
        let now = ts(now);
        let changed = db.conn().execute(
            "UPDATE training_jobs SET status = 'completed', artifact_uri = ?2, \
                 current_step = total_steps, completed_at = ?3, updated_at = ?3 \
             WHERE id = ?1 AND status = 'finalizing'",
            params![id.as_str(), artifact_uri, now],
        )?;
        if changed == 0 {
            return match Self::current_status(&db, id)? {
                JobStatus::Completed => Ok(()),
                actual => Err(StorageError::Conflict {
                    job_id: id.to_string(),
                    expected: JobStatus::Finalizing.to_string(),
                    actual,
                }),
            };
        }
        info!(job_id = %id, artifact_uri, "Job completed");
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &JobId,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let open: Vec<JobStatus> =
            std::iter::once(JobStatus::Queued).chain(JobStatus::ACTIVE).collect();
        self.fail_guarded(id, failure, now, &open, None)
    }

    fn mark_failed_from(
        &self,
        id: &JobId,
        from: JobStatus,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        if !from.can_transition_to(JobStatus::Failed) {
            return Err(StorageError::IllegalTransition { from, to: JobStatus::Failed });
        }
        self.fail_guarded(id, failure, now, &[from], None)
    }

    fn fail_if_stale(
        &self,
        id: &JobId,
        older_than: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.fail_guarded(id, failure, now, &JobStatus::ACTIVE, Some(older_than))
    }

    fn mark_reconciled(
        &self,
        id: &JobId,
        actual_points: u64,
        flagged: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let db = self.db()?;
        let changed = db.conn().execute(
            "UPDATE training_jobs SET actual_cost_points = ?2, reconciliation_flagged = ?3, \
                 cost_reconciled = 1, updated_at = ?4 \
             WHERE id = ?1 AND cost_reconciled = 0",
            params![id.as_str(), actual_points, flagged, ts(now)],
        )?;
        if changed == 0 {
            Self::current_status(&db, id)?;
            return Ok(false);
        }
        Ok(true)
    }

    fn find_orphan_candidates(&self) -> StorageResult<Vec<TrainingJob>> {
        let db = self.db()?;
        Self::query_jobs(
            &db,
            &format!(
                "SELECT {JOB_COLUMNS} FROM training_jobs \
                 WHERE status IN ('completed', 'failed') \
                   AND instance_id IS NOT NULL AND instance_terminated_at IS NULL \
                 ORDER BY updated_at ASC"
            ),
            &[],
        )
    }

    fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<TrainingJob>> {
        let db = self.db()?;
        Self::query_jobs(
            &db,
            &format!(
                "SELECT {JOB_COLUMNS} FROM training_jobs \
                 WHERE status IN ({}) AND updated_at < ?1 \
                 ORDER BY updated_at ASC",
                active_status_list()
            ),
            params![ts(older_than)],
        )
    }

    fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<TrainingJob> {
        let mut db = self.db()?;
        let fresh = db.transaction(|tx| {
            let original = tx
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM training_jobs WHERE id = ?1"),
                    params![id.as_str()],
                    row_to_job,
                )
                .optional()?
                .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
            if original.status != JobStatus::Failed {
                return Err(StorageError::IllegalTransition {
                    from: original.status,
                    to: JobStatus::Queued,
                });
            }
            let fresh = TrainingJob::queued(original.request(), now)
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;
            insert_queued(tx, &fresh)?;
            Ok(fresh)
        })?;
        info!(job_id = %id, new_job_id = %fresh.id, "Requeued failed job");
        Ok(fresh)
    }
}
