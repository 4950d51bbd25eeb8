//! [`RemoteShell`] over the system OpenSSH client.

use super::{ExecOutput, RemoteShell, RemoteTarget, ShellError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// ssh reserves this exit status for its own failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshShell {
    pub fn new(user: impl Into<String>, identity_file: Option<PathBuf>, connect_timeout: Duration) -> Self {
        Self { user: user.into(), identity_file, connect_timeout }
    }

    fn args(&self, target: &RemoteTarget, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-p".to_string(),
            target.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.user, target.host));
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> Result<ExecOutput, ShellError> {
        debug!(target = %target, command, "ssh exec");
        let output = Command::new("ssh")
            .args(self.args(target, command))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == SSH_CONNECTION_FAILURE {
            return Err(ShellError::Connection(stderr.trim().to_string()));
        }
        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }
}
