//! Retry and failure classification around [`RemoteShell`].

use super::{ExecOutput, RemoteError, RemoteResult, RemoteShell, RemoteTarget, ShellError};
use crate::clock::Clock;
use crate::provider::{GpuProvider, ProviderError};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ResilientShell {
    shell: Arc<dyn RemoteShell>,
    provider: Arc<dyn GpuProvider>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ResilientShell {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        provider: Arc<dyn GpuProvider>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self { shell, provider, clock, retry }
    }

    /// Run `command` with a per-call timeout, retrying connection failures.
    ///
    /// A non-zero exit status is returned as output, not as an error. A
    /// timeout is not retried: the command may still be running remotely.
    pub async fn exec(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
    ) -> RemoteResult<ExecOutput> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match tokio::time::timeout(timeout, self.shell.exec(target, command)).await {
                Err(_) => {
                    return Err(RemoteError::TimedOut { command: command.to_string(), after: timeout });
                }
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(ShellError::Spawn(e))) => return Err(RemoteError::Local(e)),
                Ok(Err(ShellError::Connection(e))) => {
                    last_error = e;
                    if attempt < max_attempts {
                        let delay = self.retry.delay_after(attempt);
                        warn!(
                            target = %target,
                            attempt,
                            max_attempts,
                            delay_secs = delay.as_secs(),
                            error = %last_error,
                            "Remote connection failed; retrying"
                        );
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
        Err(RemoteError::Unreachable { attempts: max_attempts, last_error })
    }

    /// Like [`exec`](Self::exec), but a non-zero exit is `CommandFailed`.
    pub async fn exec_checked(
        &self,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
    ) -> RemoteResult<String> {
        let output = self.exec(target, command, timeout).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(RemoteError::CommandFailed {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Ask the provider whether the instance is still alive.
    ///
    /// Only a provider-confirmed dead instance is `InstanceLost`. If the
    /// provider itself cannot be reached the instance is assumed alive.
    pub async fn check_instance(&self, instance_id: &str) -> RemoteResult<()> {
        match self.provider.instance_status(instance_id).await {
            Ok(status) if status.state.is_dead() => Err(RemoteError::InstanceLost {
                instance_id: instance_id.to_string(),
                state: status.state.to_string(),
            }),
            Ok(status) => {
                debug!(instance_id, state = %status.state, "Instance still alive");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => Err(RemoteError::InstanceLost {
                instance_id: instance_id.to_string(),
                state: "not found".to_string(),
            }),
            Err(e) => {
                warn!(instance_id, error = %e, "Could not confirm instance state");
                Ok(())
            }
        }
    }

    /// Run a checked command on a rented instance, consulting the provider
    /// whenever the connection is exhausted.
    ///
    /// While the provider reports the machine alive the retry sequence is
    /// restarted, until `give_up_at` passes. A dead machine ends it at once.
    pub async fn exec_on_instance(
        &self,
        instance_id: &str,
        target: &RemoteTarget,
        command: &str,
        timeout: Duration,
        give_up_at: DateTime<Utc>,
    ) -> RemoteResult<String> {
        let mut total_attempts = 0;
        let mut round = 1;
        loop {
            match self.exec_checked(target, command, timeout).await {
                Err(RemoteError::Unreachable { attempts, last_error }) => {
                    total_attempts += attempts;
                    self.check_instance(instance_id).await?;
                    if self.clock.now() >= give_up_at {
                        return Err(RemoteError::Unreachable { attempts: total_attempts, last_error });
                    }
                    warn!(
                        instance_id,
                        round,
                        %give_up_at,
                        "Instance alive but unreachable; restarting connection retries"
                    );
                    round += 1;
                }
                other => return other,
            }
        }
    }
}
