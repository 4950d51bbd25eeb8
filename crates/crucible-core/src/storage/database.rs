//! Database connection and schema management.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::storage::error::StorageResult;

/// How long a writer waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper.
///
/// The orchestrator and the sweeper usually run as separate processes on the
/// same file, so file databases are opened in WAL mode with a busy timeout.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (creating if needed) the database file at `path`.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database connection fails
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode answers with a row, so it cannot go through execute()
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!(path = %path.as_ref().display(), journal_mode = %mode, "Opened job database");
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Opens an in-memory database for testing.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Gets a reference to the underlying connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Gets a mutable reference to the underlying connection.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS training_jobs (
                id TEXT PRIMARY KEY,
                environment TEXT NOT NULL,
                user_id TEXT NOT NULL,
                model_family TEXT NOT NULL,
                dataset_uri TEXT NOT NULL,
                dataset_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                claimed_by TEXT,

                estimated_cost_points INTEGER,
                actual_cost_points INTEGER,
                cost_reconciled INTEGER NOT NULL DEFAULT 0,
                reconciliation_flagged INTEGER NOT NULL DEFAULT 0,
                charge_transaction_id TEXT,

                instance_id TEXT,
                offer_id TEXT,
                gpu_type TEXT,
                hourly_rate REAL,
                ssh_host TEXT,
                ssh_port INTEGER,
                provisioned_at TEXT,

                soft_timeout_at TEXT,
                hard_timeout_at TEXT,
                training_started_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,

                current_step INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL,
                current_loss REAL,

                instance_terminated_at TEXT,
                termination_attempts INTEGER NOT NULL DEFAULT 0,

                failure_reason TEXT,
                failure_detail TEXT,
                partial_result INTEGER NOT NULL DEFAULT 0,
                artifact_uri TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_training_jobs_queue
                ON training_jobs(environment, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_training_jobs_status_updated
                ON training_jobs(status, updated_at);
            "#,
        )?;
        Ok(())
    }

    /// Runs a transaction with the provided closure.
    ///
    /// Commits when the closure succeeds, rolls back otherwise.
    pub fn transaction<F, R>(&mut self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&rusqlite::Transaction) -> StorageResult<R>,
    {
        let tx = self.conn.transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;

    fn tables(db: &Database) -> Vec<String> {
        let mut stmt =
            db.conn().prepare("SELECT name FROM sqlite_master WHERE type='table'").unwrap();
        stmt.query_map([], |row| row.get(0)).unwrap().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_database_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(tables(&db).contains(&"training_jobs".to_string()));
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        let db = Database::open(&path).unwrap();
        let mode: String =
            db.conn().query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(tables(&db).iter().filter(|t| *t == "training_jobs").count(), 1);
    }

    #[test]
    fn test_transaction_rollback() {
        let mut db = Database::open_in_memory().unwrap();
        let result: StorageResult<()> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO training_jobs (id, environment, user_id, model_family, dataset_uri, dataset_size, status, created_at, updated_at, total_steps)
                 VALUES ('j1', 'test', 'u', 'sdxl-lora', 's3://d', 1, 'queued', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z', 10)",
                [],
            )?;
            Err(StorageError::InvalidData("Simulated error".to_string()))
        });
        assert!(result.is_err());

        let count: i64 =
            db.conn().query_row("SELECT COUNT(*) FROM training_jobs", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
