//! Configuration for Crucible.
//!
//! Loaded from TOML, then overridden by `CRUCIBLE_*` environment variables.
//! Every operational threshold lives here rather than in code.

pub mod commands;

use crate::retry::RetryPolicy;
use crucible_training::{EstimatorConfig, StallConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use commands::{CommandContext, CommandTemplates};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Partition tag; only jobs with this environment are claimed.
    pub environment: String,
    /// Recorded as `claimed_by`. Defaults to `<environment>-<pid>`.
    pub worker_id: Option<String>,
    pub database: PathBuf,
    pub poll_interval_secs: u64,
    /// How long shutdown waits for the in-flight job.
    pub shutdown_max_wait_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            worker_id: None,
            database: PathBuf::from("crucible.db"),
            poll_interval_secs: 10,
            shutdown_max_wait_secs: 600,
        }
    }
}

impl OrchestratorConfig {
    pub fn worker_id(&self) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.environment, std::process::id()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn shutdown_max_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_max_wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Offers tried before giving up.
    pub max_offer_attempts: u32,
    /// Ceiling on offer price relative to the estimator's expected rate.
    pub max_rate_multiplier: f64,
    pub boot_timeout_secs: u64,
    pub boot_poll_secs: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_offer_attempts: 3,
            max_rate_multiplier: 1.5,
            boot_timeout_secs: 900,
            boot_poll_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Per-call timeout for short commands (progress, liveness, kill).
    pub exec_timeout_secs: u64,
    pub stage_timeout_secs: u64,
    pub artifact_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_user: "root".to_string(),
            identity_file: None,
            connect_timeout_secs: 15,
            exec_timeout_secs: 60,
            stage_timeout_secs: 3600,
            artifact_timeout_secs: 1800,
            retry: RetryPolicy::remote_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_secs: u64,
    /// Time a suspected stall has to recover before the job is failed.
    pub stall_grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { tick_secs: 60, stall_grace_secs: 900 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    pub retry: RetryPolicy,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self { retry: RetryPolicy::termination_default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Active jobs without a heartbeat for this long are failed.
    pub stuck_after_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self { interval_secs: 300, stuck_after_secs: 7200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:8700".to_string(), api_key: None, timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { base_url: "http://127.0.0.1:8800".to_string(), api_key: None, timeout_secs: 15 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub user_webhook: Option<String>,
    pub ops_webhook: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { user_webhook: None, ops_webhook: None, timeout_secs: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrucibleConfig {
    pub orchestrator: OrchestratorConfig,
    pub estimator: EstimatorConfig,
    pub provisioning: ProvisioningConfig,
    pub remote: RemoteConfig,
    pub monitor: MonitorConfig,
    pub stall: StallConfig,
    pub termination: TerminationConfig,
    pub sweeper: SweeperConfig,
    pub provider: ProviderConfig,
    pub ledger: LedgerConfig,
    pub notifications: NotificationConfig,
    pub commands: CommandTemplates,
}

impl CrucibleConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from("crucible.toml")
    }

    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".crucible")
            .join("config.toml")
    }

    /// Resolve, load, apply environment overrides and validate.
    ///
    /// An explicit path must exist. Otherwise the first existing of
    /// `./crucible.toml` and `~/.crucible/config.toml` is used, falling back
    /// to defaults.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match explicit {
            Some(path) => Self::load_from_file(path)?,
            None => [Self::default_local_path(), Self::default_global_path()]
                .iter()
                .find(|p| p.exists())
                .map_or_else(|| Ok(Self::default()), |p| Self::load_from_file(p))?,
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `CRUCIBLE_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("CRUCIBLE_ENVIRONMENT") {
            self.orchestrator.environment = v;
        }
        if let Some(v) = get("CRUCIBLE_DATABASE") {
            self.orchestrator.database = PathBuf::from(v);
        }
        if let Some(v) = get("CRUCIBLE_PROVIDER_URL") {
            self.provider.base_url = v;
        }
        if let Some(v) = get("CRUCIBLE_PROVIDER_API_KEY") {
            self.provider.api_key = Some(v);
        }
        if let Some(v) = get("CRUCIBLE_LEDGER_URL") {
            self.ledger.base_url = v;
        }
        if let Some(v) = get("CRUCIBLE_LEDGER_API_KEY") {
            self.ledger.api_key = Some(v);
        }
        if let Some(v) = get("CRUCIBLE_USER_WEBHOOK") {
            self.notifications.user_webhook = Some(v);
        }
        if let Some(v) = get("CRUCIBLE_OPS_WEBHOOK") {
            self.notifications.ops_webhook = Some(v);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::InvalidValue(msg));

        if self.orchestrator.environment.trim().is_empty() {
            return invalid("orchestrator.environment must not be empty".to_string());
        }
        if self.orchestrator.poll_interval_secs == 0 {
            return invalid("orchestrator.poll_interval_secs must be > 0".to_string());
        }
        self.estimator.validate().map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        if self.provisioning.max_offer_attempts == 0 {
            return invalid("provisioning.max_offer_attempts must be >= 1".to_string());
        }
        if self.provisioning.max_rate_multiplier < 1.0 {
            return invalid("provisioning.max_rate_multiplier must be >= 1.0".to_string());
        }
        if self.provisioning.boot_poll_secs == 0 {
            return invalid("provisioning.boot_poll_secs must be > 0".to_string());
        }

        self.remote.retry.validate().map_err(|e| ConfigError::InvalidValue(format!("remote.retry: {e}")))?;
        self.termination
            .retry
            .validate()
            .map_err(|e| ConfigError::InvalidValue(format!("termination.retry: {e}")))?;
        if self.remote.exec_timeout_secs == 0 {
            return invalid("remote.exec_timeout_secs must be > 0".to_string());
        }

        let stall = &self.stall;
        let threshold = stall.convergence_threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return invalid("stall.convergence_threshold must be in (0, 1]".to_string());
        }
        let drop = stall.throughput_drop;
        if drop.is_nan() || drop <= 0.0 || drop >= 1.0 {
            return invalid("stall.throughput_drop must be in (0, 1)".to_string());
        }
        if stall.window < 2 || stall.min_samples < 2 {
            return invalid("stall.window and stall.min_samples must be >= 2".to_string());
        }
        if self.monitor.tick_secs == 0 {
            return invalid("monitor.tick_secs must be > 0".to_string());
        }

        if self.sweeper.interval_secs == 0 {
            return invalid("sweeper.interval_secs must be > 0".to_string());
        }
        // Long remote calls do not heartbeat; they must finish well inside the stuck window.
        let longest_silence = self
            .remote
            .stage_timeout_secs
            .max(self.remote.artifact_timeout_secs)
            .max(self.monitor.tick_secs)
            .max(self.provisioning.boot_poll_secs);
        if self.sweeper.stuck_after_secs <= longest_silence {
            return invalid(format!(
                "sweeper.stuck_after_secs ({}) must exceed the longest remote call ({longest_silence}s)",
                self.sweeper.stuck_after_secs
            ));
        }

        let empty = self.commands.empty_templates();
        if !empty.is_empty() {
            return invalid(format!("empty command templates: {}", empty.join(", ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        CrucibleConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_from_file_partial_sections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("crucible.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
environment = "prod-eu"
database = "/var/lib/crucible/jobs.db"

[estimator]
safety_buffer = 1.8

[estimator.gpu_rates]
h100 = 2.5

[estimator.families.flux-lora]
hours_per_step = 0.001
gpu_class = "h100"

[remote.retry]
max_attempts = 3
delays_secs = [1, 2]

[stall]
convergence_threshold = 0.4
"#,
        )
        .unwrap();

        let config = CrucibleConfig::load(Some(&path)).unwrap();
        assert_eq!(config.orchestrator.environment, "prod-eu");
        assert_eq!(config.orchestrator.poll_interval_secs, 10);
        assert_eq!(config.estimator.safety_buffer, 1.8);
        assert_eq!(config.estimator.families["flux-lora"].gpu_class, "h100");
        assert_eq!(config.remote.retry.max_attempts, 3);
        assert_eq!(config.stall.convergence_threshold, 0.4);
        assert_eq!(config.stall.window, 4);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let err = CrucibleConfig::load(Some(Path::new("/nonexistent/crucible.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_parse_error_names_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[orchestrator\nenvironment=").unwrap();
        let err = CrucibleConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(msg) if msg.contains("bad.toml")));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CRUCIBLE_ENVIRONMENT", "staging"),
            ("CRUCIBLE_PROVIDER_API_KEY", "secret"),
            ("CRUCIBLE_OPS_WEBHOOK", "https://hooks.example/ops"),
            ("CRUCIBLE_LEDGER_URL", ""),
        ]);
        let mut config = CrucibleConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.orchestrator.environment, "staging");
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
        assert_eq!(config.notifications.ops_webhook.as_deref(), Some("https://hooks.example/ops"));
        assert_eq!(config.ledger.base_url, LedgerConfig::default().base_url);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = CrucibleConfig::default();
        config.stall.convergence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = CrucibleConfig::default();
        config.estimator.safety_buffer = 0.9;
        assert!(config.validate().is_err());

        let mut config = CrucibleConfig::default();
        config.remote.retry.delays_secs.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_stuck_window_shorter_than_staging() {
        let mut config = CrucibleConfig::default();
        config.sweeper.stuck_after_secs = 1800;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stuck_after_secs"));
    }
}
