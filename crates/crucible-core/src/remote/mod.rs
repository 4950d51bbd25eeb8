//! Remote command execution on rented instances.
//!
//! [`RemoteShell`] is the raw channel. [`ResilientShell`] wraps it with
//! per-call timeouts, connection retries and the provider liveness check that
//! separates "connection lost" from "instance died".

pub mod resilient;
pub mod ssh;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use resilient::ResilientShell;
pub use ssh::SshShell;

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Failures of the channel itself, never of the remote command.
#[derive(Debug, Clone, Error)]
pub enum ShellError {
    /// The session could not be established or dropped mid-command.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The local client could not be started.
    #[error("failed to spawn remote shell: {0}")]
    Spawn(String),
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> Result<ExecOutput, ShellError>;
}

/// Classified outcome of a resilient remote call.
///
/// `Unreachable` and `InstanceLost` are deliberately separate: the first is a
/// connectivity problem with a machine the provider still reports alive, the
/// second is provider-confirmed death.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote unreachable after {attempts} attempts: {last_error}")]
    Unreachable { attempts: u32, last_error: String },

    #[error("remote command timed out after {after:?}: {command}")]
    TimedOut { command: String, after: Duration },

    #[error("remote command exited with {exit_code}: {stderr}")]
    CommandFailed { command: String, exit_code: i32, stderr: String },

    #[error("instance {instance_id} is {state}")]
    InstanceLost { instance_id: String, state: String },

    #[error("local shell error: {0}")]
    Local(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
