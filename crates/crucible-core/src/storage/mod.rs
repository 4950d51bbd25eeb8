//! Job Store: SQLite persistence for training jobs.

// SQL strings don't need hash-less raw strings
#![allow(clippy::needless_raw_string_hashes)]

pub mod database;
pub mod error;
pub mod jobs;

pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use jobs::{InstanceRecord, JobFailure, JobFilter, JobRepository, SqliteJobRepository};
