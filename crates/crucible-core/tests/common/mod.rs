//! Scripted in-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use crucible_core::billing::LedgerResult;
use crucible_core::config::CommandTemplates;
use crucible_core::provider::{OfferQuery, ProviderResult};
use crucible_core::remote::{ExecOutput, ShellError};
use crucible_core::{
    Clock, Collaborators, CrucibleConfig, GpuProvider, InstanceState, InstanceStatus, JobRepository,
    Ledger, LedgerError, ManualClock, Notifier, Offer, ProviderError, RemoteShell, RemoteTarget,
    Severity, SqliteJobRepository,
};
use crucible_core::storage::{InstanceRecord, JobFailure, JobFilter, StorageResult};
use crucible_training::{EstimatorConfig, FamilyProfile, JobId, JobRequest, JobStatus, TrainingJob};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z").unwrap().with_timezone(&Utc)
}

/// 632 steps of flux-lora cost exactly 15,800 points under this config.
pub fn estimator_config() -> EstimatorConfig {
    EstimatorConfig {
        safety_buffer: 2.0,
        platform_margin: 1.0,
        points_per_usd: 100.0,
        gpu_rates: BTreeMap::from([("a100".to_string(), 2.0)]),
        families: BTreeMap::from([(
            "flux-lora".to_string(),
            FamilyProfile {
                hours_per_step: 0.0625,
                baseline_dataset_size: 20,
                dataset_scale: 0.5,
                gpu_class: "a100".to_string(),
            },
        )]),
    }
}

pub fn test_config() -> CrucibleConfig {
    let mut config = CrucibleConfig::default();
    config.orchestrator.environment = "test".to_string();
    config.orchestrator.worker_id = Some("worker-1".to_string());
    config.estimator = estimator_config();
    config.monitor.tick_secs = 600;
    config.monitor.stall_grace_secs = 900;
    config.commands = CommandTemplates {
        workdir: "/w".to_string(),
        stage_dataset: "stage {job_id} {dataset_uri}".to_string(),
        launch: "launch {job_id} {total_steps}".to_string(),
        progress: "progress {job_id}".to_string(),
        process_alive: "alive {job_id}".to_string(),
        kill: "kill {job_id}".to_string(),
        collect_artifact: "collect {job_id}".to_string(),
    };
    config
}

pub fn request(total_steps: u64) -> JobRequest {
    JobRequest {
        user_id: "user-1".to_string(),
        environment: "test".to_string(),
        model_family: "flux-lora".to_string(),
        total_steps,
        dataset_uri: "s3://datasets/portraits.tar".to_string(),
        dataset_size: 20,
    }
}

pub fn progress_line(step: u64, eta: Option<f64>, rate: Option<f64>) -> String {
    let mut value = serde_json::json!({ "step": step, "total_steps": 632 });
    if let Some(eta) = eta {
        value["eta_seconds"] = eta.into();
    }
    if let Some(rate) = rate {
        value["steps_per_second"] = rate.into();
    }
    value.to_string()
}

pub fn completed_line() -> String {
    r#"{"step":632,"total_steps":632,"state":"completed","loss":0.05}"#.to_string()
}

// --- GPU provider ---

#[derive(Default)]
pub struct FakeProvider {
    pub offers: Mutex<Vec<Offer>>,
    pub create_results: Mutex<VecDeque<ProviderResult<String>>>,
    pub states: Mutex<HashMap<String, InstanceState>>,
    /// Consumed by `instance_status` before falling back to `states`.
    pub status_script: Mutex<VecDeque<InstanceState>>,
    pub terminate_script: Mutex<VecDeque<ProviderResult<()>>>,
    pub create_calls: Mutex<u32>,
    pub terminate_calls: Mutex<u32>,
}

impl FakeProvider {
    pub fn with_offer(rate: f64) -> Self {
        let provider = Self::default();
        provider.offers.lock().unwrap().push(Offer {
            id: "offer-1".to_string(),
            gpu_type: "a100".to_string(),
            hourly_rate: rate,
        });
        provider
    }

    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        self.states.lock().unwrap().insert(instance_id.to_string(), state);
    }

    pub fn state(&self, instance_id: &str) -> Option<InstanceState> {
        self.states.lock().unwrap().get(instance_id).copied()
    }

    pub fn script_status(&self, states: &[InstanceState]) {
        self.status_script.lock().unwrap().extend(states.iter().copied());
    }

    pub fn script_terminate(&self, results: Vec<ProviderResult<()>>) {
        self.terminate_script.lock().unwrap().extend(results);
    }

    pub fn create_calls(&self) -> u32 {
        *self.create_calls.lock().unwrap()
    }

    pub fn terminate_calls(&self) -> u32 {
        *self.terminate_calls.lock().unwrap()
    }
}

#[async_trait]
impl GpuProvider for FakeProvider {
    async fn search_offers(&self, query: &OfferQuery) -> ProviderResult<Vec<Offer>> {
        let offers = self.offers.lock().unwrap();
        Ok(offers
            .iter()
            .filter(|o| o.gpu_type == query.gpu_type)
            .filter(|o| query.max_hourly_rate.is_none_or(|max| o.hourly_rate <= max))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, _offer_id: &str, _label: &str) -> ProviderResult<String> {
        let mut calls = self.create_calls.lock().unwrap();
        *calls += 1;
        let result = self
            .create_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("inst-{calls}")));
        if let Ok(id) = &result {
            self.states.lock().unwrap().insert(id.clone(), InstanceState::Running);
        }
        result
    }

    async fn instance_status(&self, instance_id: &str) -> ProviderResult<InstanceStatus> {
        let state = match self.status_script.lock().unwrap().pop_front() {
            Some(state) => state,
            None => self
                .state(instance_id)
                .ok_or_else(|| ProviderError::NotFound(instance_id.to_string()))?,
        };
        Ok(InstanceStatus {
            state,
            ssh_host: Some("10.0.0.7".to_string()),
            ssh_port: Some(22),
        })
    }

    async fn terminate(&self, instance_id: &str) -> ProviderResult<()> {
        *self.terminate_calls.lock().unwrap() += 1;
        let result = self.terminate_script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.set_state(instance_id, InstanceState::Gone);
        }
        result
    }
}

// --- Remote shell ---

/// Dispatches on the first word of the rendered test templates.
pub struct FakeShell {
    pub progress: Mutex<VecDeque<Result<String, ShellError>>>,
    /// Returned once `progress` is drained.
    pub sticky_progress: Mutex<Result<String, ShellError>>,
    pub alive: Mutex<bool>,
    pub artifact: Mutex<Option<String>>,
    /// Commands starting with this word never return.
    pub hang_on: Mutex<Option<String>>,
    /// Runs when the launch command is received.
    pub on_launch: Mutex<Option<Box<dyn Fn() + Send>>>,
    pub commands: Mutex<Vec<String>>,
}

impl Default for FakeShell {
    fn default() -> Self {
        Self {
            progress: Mutex::new(VecDeque::new()),
            sticky_progress: Mutex::new(Ok(completed_line())),
            alive: Mutex::new(true),
            artifact: Mutex::new(Some("s3://artifacts/lora.safetensors".to_string())),
            hang_on: Mutex::new(None),
            on_launch: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
        }
    }
}

impl FakeShell {
    pub fn script_progress(&self, lines: Vec<Result<String, ShellError>>) {
        self.progress.lock().unwrap().extend(lines);
    }

    pub fn set_sticky(&self, line: Result<String, ShellError>) {
        *self.sticky_progress.lock().unwrap() = line;
    }

    pub fn ran(&self, verb: &str) -> usize {
        self.commands.lock().unwrap().iter().filter(|c| c.split(' ').next() == Some(verb)).count()
    }
}

fn ok(stdout: String) -> Result<ExecOutput, ShellError> {
    Ok(ExecOutput { exit_code: 0, stdout, stderr: String::new() })
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn exec(&self, _target: &RemoteTarget, command: &str) -> Result<ExecOutput, ShellError> {
        self.commands.lock().unwrap().push(command.to_string());
        let verb = command.split(' ').next().unwrap_or_default().to_string();
        if self.hang_on.lock().unwrap().as_deref() == Some(verb.as_str()) {
            return std::future::pending().await;
        }
        match verb.as_str() {
            "launch" => {
                if let Some(hook) = self.on_launch.lock().unwrap().as_ref() {
                    hook();
                }
                ok(String::new())
            }
            "progress" => {
                let next = self.progress.lock().unwrap().pop_front();
                next.unwrap_or_else(|| self.sticky_progress.lock().unwrap().clone()).and_then(ok)
            }
            "alive" => {
                let code = i32::from(!*self.alive.lock().unwrap());
                Ok(ExecOutput { exit_code: code, ..ExecOutput::default() })
            }
            "collect" => match self.artifact.lock().unwrap().clone() {
                Some(uri) => ok(format!("uploading...\n{uri}\n")),
                None => Ok(ExecOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "nothing to upload".to_string(),
                }),
            },
            _ => ok(String::new()),
        }
    }
}

// --- Ledger ---

#[derive(Default)]
pub struct FakeLedger {
    pub balance: Mutex<u64>,
    pub charges: Mutex<Vec<(String, u64, String)>>,
    pub refunds: Mutex<Vec<(String, u64)>>,
    pub flags: Mutex<Vec<(String, u64)>>,
}

impl FakeLedger {
    pub fn with_balance(balance: u64) -> Self {
        Self { balance: Mutex::new(balance), ..Self::default() }
    }

    pub fn charges(&self) -> Vec<(String, u64, String)> {
        self.charges.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<(String, u64)> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn flags(&self) -> Vec<(String, u64)> {
        self.flags.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn check_balance(&self, _user_id: &str, points: u64) -> LedgerResult<bool> {
        Ok(*self.balance.lock().unwrap() >= points)
    }

    async fn charge(&self, user_id: &str, points: u64, job_id: &str) -> LedgerResult<String> {
        let mut balance = self.balance.lock().unwrap();
        if *balance < points {
            return Err(LedgerError::InsufficientFunds { available: *balance, required: points });
        }
        *balance -= points;
        let mut charges = self.charges.lock().unwrap();
        charges.push((user_id.to_string(), points, job_id.to_string()));
        Ok(format!("tx-{}", charges.len()))
    }

    async fn refund(&self, transaction_id: &str, points: u64) -> LedgerResult<()> {
        *self.balance.lock().unwrap() += points;
        self.refunds.lock().unwrap().push((transaction_id.to_string(), points));
        Ok(())
    }

    async fn flag_overrun(&self, transaction_id: &str, points: u64) -> LedgerResult<()> {
        self.flags.lock().unwrap().push((transaction_id.to_string(), points));
        Ok(())
    }
}

// --- Notifications ---

#[derive(Default)]
pub struct RecordingNotifier {
    pub user: Mutex<Vec<(String, String, Severity)>>,
    pub ops: Mutex<Vec<(String, Severity, Value)>>,
}

impl RecordingNotifier {
    pub fn user_messages(&self) -> Vec<String> {
        self.user.lock().unwrap().iter().map(|(_, m, _)| m.clone()).collect()
    }

    pub fn ops_count(&self, severity: Severity) -> usize {
        self.ops.lock().unwrap().iter().filter(|(_, s, _)| *s == severity).count()
    }

    pub fn ops_messages(&self) -> Vec<String> {
        self.ops.lock().unwrap().iter().map(|(m, _, _)| m.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_user(&self, user_id: &str, message: &str, severity: Severity) {
        self.user.lock().unwrap().push((user_id.to_string(), message.to_string(), severity));
    }

    fn notify_ops(&self, message: &str, severity: Severity, data: Value) {
        self.ops.lock().unwrap().push((message.to_string(), severity, data));
    }
}

// --- Harness ---

pub struct Harness {
    pub store: Arc<SqliteJobRepository>,
    pub provider: Arc<FakeProvider>,
    pub shell: Arc<FakeShell>,
    pub ledger: Arc<FakeLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(balance: u64) -> Self {
        Self {
            store: Arc::new(SqliteJobRepository::open_in_memory().unwrap()),
            provider: Arc::new(FakeProvider::with_offer(2.0)),
            shell: Arc::new(FakeShell::default()),
            ledger: Arc::new(FakeLedger::with_balance(balance)),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(ManualClock::new(t0())),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with_store(self.store.clone())
    }

    /// Same collaborators, with `store` standing in for the job store.
    pub fn collaborators_with_store(&self, store: Arc<dyn JobRepository>) -> Collaborators {
        Collaborators {
            store,
            provider: self.provider.clone(),
            shell: self.shell.clone(),
            ledger: self.ledger.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn enqueue(&self, total_steps: u64) -> TrainingJob {
        let job = TrainingJob::queued(request(total_steps), t0()).unwrap();
        self.store.insert(&job).unwrap();
        job
    }

    pub fn clock_elapsed_secs(&self) -> i64 {
        (self.clock.now() - t0()).num_seconds()
    }

    /// A claimed, charged job with a running instance, as the processor
    /// leaves it right after provisioning.
    pub fn provisioned_job(&self, instance_id: &str) -> TrainingJob {
        let job = self.enqueue(632);
        self.store.claim(&job.id, "worker-1", t0()).unwrap().unwrap();
        self.store.record_charge(&job.id, 15_800, "tx-1", t0()).unwrap();
        let record = InstanceRecord {
            instance_id: instance_id.to_string(),
            offer_id: "offer-1".to_string(),
            gpu_type: "a100".to_string(),
            hourly_rate: 2.0,
            provisioned_at: t0(),
            soft_timeout_at: t0() + Duration::minutes(2370),
            hard_timeout_at: t0() + Duration::hours(79),
        };
        self.store.record_instance(&job.id, &record, t0()).unwrap();
        self.provider.set_state(instance_id, InstanceState::Running);
        self.store.get(&job.id).unwrap()
    }

    /// Walk a provisioned job forward to `Completed`.
    pub fn complete(&self, job: &TrainingJob) {
        let steps = [
            (JobStatus::Provisioning, JobStatus::Uploading),
            (JobStatus::Uploading, JobStatus::Training),
            (JobStatus::Training, JobStatus::Finalizing),
        ];
        for (from, to) in steps {
            self.store.set_status(&job.id, from, to, t0()).unwrap();
        }
        self.store.mark_completed(&job.id, "s3://artifacts/out", t0()).unwrap();
    }
}

// --- Job store ---

/// Delegates to SQLite and records every status the store accepted, in order.
pub struct RecordingStore {
    inner: Arc<SqliteJobRepository>,
    statuses: Mutex<Vec<JobStatus>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<SqliteJobRepository>) -> Self {
        Self { inner, statuses: Mutex::new(Vec::new()) }
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        self.statuses.lock().unwrap().clone()
    }

    fn record(&self, status: JobStatus) {
        self.statuses.lock().unwrap().push(status);
    }

    fn record_failure(&self, result: &StorageResult<bool>) {
        if matches!(result, Ok(true)) {
            self.record(JobStatus::Failed);
        }
    }
}

impl JobRepository for RecordingStore {
    fn insert(&self, job: &TrainingJob) -> StorageResult<()> {
        self.inner.insert(job)
    }

    fn get(&self, id: &JobId) -> StorageResult<TrainingJob> {
        self.inner.get(id)
    }

    fn list(&self, filter: &JobFilter) -> StorageResult<Vec<TrainingJob>> {
        self.inner.list(filter)
    }

    fn fetch_next_queued(&self, environment: &str) -> StorageResult<Option<TrainingJob>> {
        self.inner.fetch_next_queued(environment)
    }

    fn claim(
        &self,
        id: &JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<TrainingJob>> {
        let claimed = self.inner.claim(id, worker_id, now)?;
        if claimed.is_some() {
            self.record(JobStatus::Provisioning);
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
        self.inner.set_status(id, from, to, now)?;
        self.record(to);
        Ok(())
    }

    fn update_progress(
        &self,
        id: &JobId,
        step: u64,
        loss: Option<f64>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.update_progress(id, step, loss, now)
    }

    fn touch(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()> {
        self.inner.touch(id, now)
    }

    fn record_charge(
        &self,
        id: &JobId,
        estimated_points: u64,
        transaction_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.record_charge(id, estimated_points, transaction_id, now)
    }

    fn record_instance(
        &self,
        id: &JobId,
        instance: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.record_instance(id, instance, now)
    }

    fn record_endpoint(
        &self,
        id: &JobId,
        host: &str,
        port: u16,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.record_endpoint(id, host, port, now)
    }

    fn record_termination_attempt(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<u32> {
        self.inner.record_termination_attempt(id, now)
    }

    fn mark_instance_terminated(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<()> {
        self.inner.mark_instance_terminated(id, now)
    }

    fn mark_completed(
        &self,
        id: &JobId,
        artifact_uri: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.mark_completed(id, artifact_uri, now)?;
        self.record(JobStatus::Completed);
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &JobId,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = self.inner.mark_failed(id, failure, now);
        self.record_failure(&result);
        result
    }

    fn mark_failed_from(
        &self,
        id: &JobId,
        from: JobStatus,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = self.inner.mark_failed_from(id, from, failure, now);
        self.record_failure(&result);
        result
    }

    fn fail_if_stale(
        &self,
        id: &JobId,
        older_than: DateTime<Utc>,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let result = self.inner.fail_if_stale(id, older_than, failure, now);
        self.record_failure(&result);
        result
    }

    fn mark_reconciled(
        &self,
        id: &JobId,
        actual_points: u64,
        flagged: bool,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.inner.mark_reconciled(id, actual_points, flagged, now)
    }

    fn find_orphan_candidates(&self) -> StorageResult<Vec<TrainingJob>> {
        self.inner.find_orphan_candidates()
    }

    fn find_stuck(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<TrainingJob>> {
        self.inner.find_stuck(older_than)
    }

    fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> StorageResult<TrainingJob> {
        self.inner.requeue(id, now)
    }
}
