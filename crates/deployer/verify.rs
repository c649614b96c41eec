//! Source verification of everything recorded in a ledger.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use async_trait::async_trait;
use deploykit_common::{Address, abi::{self, Value}};
use deploykit_storage::{DeploymentLedger, DeploymentRecord};
use futures::{StreamExt, stream};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub name: String,
    /// Artifact name, which differs from `name` for aliased deployments.
    pub contract: String,
    pub address: Address,
    pub constructor_args: Vec<Value>,
    /// Fully qualified `path/File.sol:Name`, needed when several artifacts
    /// compile to the same bytecode.
    pub contract_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplorerOutcome {
    Verified,
    AlreadyVerified,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExplorerError {
    #[error("More than one contract matches the deployed bytecode ({} candidates)", .candidates.len())]
    AmbiguousBytecode { candidates: Vec<String> },
    #[error("Transient explorer failure: {0}")]
    Transient(String),
    #[error("Explorer rejected the submission: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Explorer: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<ExplorerOutcome, ExplorerError>;
}

#[derive(Debug, Clone)]
pub struct VerificationOptions {
    /// Total submissions per task, the first one included.
    pub max_retries: u32,
    /// Contract name (or artifact name) to fully qualified path.
    pub contract_path_hints: BTreeMap<String, String>,
    pub retry_delay: Duration,
    /// Minimum spacing between any two submissions, retries included.
    pub task_delay: Duration,
    /// Names whose failure does not fail the run.
    pub non_critical: BTreeSet<String>,
    /// Names verified first, in this order. Everything else follows in
    /// ledger order.
    pub priority: Vec<String>,
    pub concurrency: usize,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            contract_path_hints: BTreeMap::new(),
            retry_delay: Duration::from_secs(5),
            task_delay: Duration::from_secs(3),
            non_critical: BTreeSet::new(),
            priority: Vec::new(),
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationTask {
    pub name: String,
    pub contract: String,
    pub address: Address,
    pub constructor_args: Vec<Value>,
    pub contract_path: Option<String>,
    /// Submissions made so far.
    pub attempts: u32,
}

impl VerificationTask {
    pub fn from_record(record: &DeploymentRecord, hints: &BTreeMap<String, String>) -> Self {
        let contract_path = hints
            .get(&record.name)
            .or_else(|| hints.get(record.artifact()))
            .cloned();
        Self {
            name: record.name.clone(),
            contract: record.artifact().to_owned(),
            address: record.address,
            constructor_args: record.constructor_args.clone(),
            contract_path,
            attempts: 0,
        }
    }

    fn request(&self, contract_path: Option<&str>) -> VerificationRequest {
        VerificationRequest {
            name: self.name.clone(),
            contract: self.contract.clone(),
            address: self.address,
            constructor_args: self.constructor_args.clone(),
            contract_path: contract_path.map(str::to_owned),
        }
    }

    /// Picks the candidate path that names this contract or its artifact.
    fn pick_candidate(&self, candidates: &[String]) -> Option<String> {
        let by_name = format!(":{}", self.name);
        let by_artifact = format!(":{}", self.contract);
        candidates
            .iter()
            .find(|c| c.ends_with(&by_name))
            .or_else(|| candidates.iter().find(|c| c.ends_with(&by_artifact)))
            .cloned()
    }

    /// What an operator needs to verify the contract by hand.
    pub fn manual_hint(&self) -> String {
        let args = abi::encode(&self.constructor_args)
            .map(|encoded| format!("0x{}", hex::encode(encoded)))
            .unwrap_or_else(|err| format!("<unencodable: {err}>"));
        let path = self.contract_path.as_deref().unwrap_or(&self.contract);
        format!(
            "contract {path} at {:#x}, constructor arguments {args}",
            self.address
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Verified,
    AlreadyVerified,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task: VerificationTask,
    pub outcome: TaskOutcome,
    pub critical: bool,
    /// Present for failed tasks.
    pub manual_hint: Option<String>,
}

impl TaskResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub results: Vec<TaskResult>,
    pub elapsed: Duration,
}

impl VerificationReport {
    pub fn verified(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Verified))
    }

    pub fn already_verified(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::AlreadyVerified))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, TaskOutcome::Failed { .. }))
    }

    fn count(&self, f: impl Fn(&TaskOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn critical_failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| r.is_failure() && r.critical)
    }

    pub fn non_critical_failures(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| r.is_failure() && !r.critical)
    }

    /// True when at least one critical contract could not be verified.
    pub fn is_fatal(&self) -> bool {
        self.critical_failures().next().is_some()
    }

    pub fn get(&self, name: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task.name == name)
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "verified: {}, already verified: {}, failed: {} ({} critical)\n",
            self.verified(),
            self.already_verified(),
            self.failed(),
            self.critical_failures().count()
        );
        for result in self.results.iter().filter(|r| r.is_failure()) {
            let kind = if result.critical { "critical" } else { "non-critical" };
            out.push_str(&format!("  ! {} ({kind})\n", result.task.name));
            if let Some(hint) = &result.manual_hint {
                out.push_str(&format!("    verify manually: {hint}\n"));
            }
        }
        out
    }
}

/// Submits ledger records to an [`Explorer`].
pub struct VerificationEngine<'a> {
    explorer: &'a dyn Explorer,
    options: &'a VerificationOptions,
    /// Time of the most recent submission, shared by concurrent tasks.
    last_submission: Mutex<Option<Instant>>,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(explorer: &'a dyn Explorer, options: &'a VerificationOptions) -> Self {
        Self {
            explorer,
            options,
            last_submission: Mutex::new(None),
        }
    }

    /// Tasks for every ledger record, priority names first.
    pub fn tasks(&self, ledger: &DeploymentLedger) -> Vec<VerificationTask> {
        let records = ledger.all();
        let mut ordered: Vec<&DeploymentRecord> = Vec::with_capacity(records.len());
        for name in &self.options.priority {
            if let Some(record) = records.iter().find(|r| &r.name == name) {
                ordered.push(*record);
            }
        }
        for record in records {
            if !self.options.priority.contains(&record.name) {
                ordered.push(record);
            }
        }
        ordered
            .into_iter()
            .map(|record| VerificationTask::from_record(record, &self.options.contract_path_hints))
            .collect()
    }

    pub async fn verify_all(&self, ledger: &DeploymentLedger) -> VerificationReport {
        self.verify_tasks(self.tasks(ledger)).await
    }

    pub async fn verify_tasks(&self, tasks: Vec<VerificationTask>) -> VerificationReport {
        let started = Instant::now();
        info!(tasks = tasks.len(), concurrency = self.options.concurrency, "Starting verification");
        let results = stream::iter(tasks)
            .map(|task| self.verify_task(task))
            .buffered(self.options.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;
        let report = VerificationReport {
            results,
            elapsed: started.elapsed(),
        };
        info!(
            verified = report.verified(),
            already_verified = report.already_verified(),
            failed = report.failed(),
            "Verification finished"
        );
        report
    }

    /// Submits `request` once `task_delay` has passed since the previous
    /// submission of any task.
    async fn submit(&self, request: &VerificationRequest) -> Result<ExplorerOutcome, ExplorerError> {
        {
            let mut last_submission = self.last_submission.lock().await;
            if let Some(previous) = *last_submission {
                tokio::time::sleep_until(previous + self.options.task_delay).await;
            }
            *last_submission = Some(Instant::now());
        }
        self.explorer.verify(request).await
    }

    async fn verify_task(&self, mut task: VerificationTask) -> TaskResult {
        let critical = !self.options.non_critical.contains(&task.name);
        let outcome = self.submit_with_retry(&mut task).await;
        let manual_hint = matches!(outcome, TaskOutcome::Failed { .. }).then(|| task.manual_hint());
        TaskResult {
            task,
            outcome,
            critical,
            manual_hint,
        }
    }

    async fn submit_with_retry(&self, task: &mut VerificationTask) -> TaskOutcome {
        let max_attempts = self.options.max_retries.max(1);
        loop {
            task.attempts += 1;
            info!(
                name = %task.name,
                address = %format!("{:#x}", task.address),
                attempt = task.attempts,
                max_attempts,
                "Verifying contract"
            );
            let request = task.request(task.contract_path.as_deref());
            let err = match self.submit(&request).await {
                Ok(outcome) => return Self::success(task, outcome),
                Err(err) => err,
            };

            match err {
                ExplorerError::AmbiguousBytecode { candidates } => {
                    return self.resolve_ambiguity(task, &candidates).await;
                }
                ExplorerError::Rejected(reason) => {
                    warn!(name = %task.name, %reason, "Explorer rejected verification");
                    return TaskOutcome::Failed { reason };
                }
                ExplorerError::Transient(reason) if task.attempts < max_attempts => {
                    warn!(
                        name = %task.name,
                        attempt = task.attempts,
                        %reason,
                        retry_in_secs = self.options.retry_delay.as_secs(),
                        "Verification attempt failed, retrying"
                    );
                    if !self.options.retry_delay.is_zero() {
                        tokio::time::sleep(self.options.retry_delay).await;
                    }
                }
                ExplorerError::Transient(reason) => {
                    warn!(name = %task.name, attempts = task.attempts, %reason, "Verification failed");
                    return TaskOutcome::Failed {
                        reason: format!("gave up after {} attempts: {reason}", task.attempts),
                    };
                }
            }
        }
    }

    /// One extra submission with a fully qualified contract path.
    async fn resolve_ambiguity(
        &self,
        task: &mut VerificationTask,
        candidates: &[String],
    ) -> TaskOutcome {
        if task.contract_path.is_some() {
            return TaskOutcome::Failed {
                reason: "bytecode still ambiguous with an explicit contract path".to_owned(),
            };
        }
        let Some(path) = task.pick_candidate(candidates) else {
            return TaskOutcome::Failed {
                reason: format!(
                    "bytecode matches several contracts and none is named {}",
                    task.name
                ),
            };
        };

        info!(name = %task.name, %path, "Bytecode is ambiguous, retrying with contract path");
        task.contract_path = Some(path);
        task.attempts += 1;
        let request = task.request(task.contract_path.as_deref());
        match self.submit(&request).await {
            Ok(outcome) => Self::success(task, outcome),
            Err(err) => {
                warn!(name = %task.name, %err, "Verification with contract path failed");
                TaskOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn success(task: &VerificationTask, outcome: ExplorerOutcome) -> TaskOutcome {
        match outcome {
            ExplorerOutcome::Verified => {
                info!(name = %task.name, "Contract verified");
                TaskOutcome::Verified
            }
            ExplorerOutcome::AlreadyVerified => {
                debug!(name = %task.name, "Contract already verified");
                TaskOutcome::AlreadyVerified
            }
        }
    }
}

/// Verifies every record of `ledger` with the given options.
pub async fn verify_all(
    ledger: &DeploymentLedger,
    explorer: &dyn Explorer,
    options: &VerificationOptions,
) -> VerificationReport {
    VerificationEngine::new(explorer, options)
        .verify_all(ledger)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str, contract: &str) -> VerificationTask {
        VerificationTask {
            name: name.into(),
            contract: contract.into(),
            address: Address::repeat_byte(1),
            constructor_args: vec![Value::Uint(7u64.into())],
            contract_path: None,
            attempts: 0,
        }
    }

    #[test]
    fn candidate_matches_name_before_artifact() {
        let candidates = vec![
            "contracts/a/StablePoolFactory.sol:StablePoolFactory".to_owned(),
            "contracts/b/StablePoolV2Factory.sol:StablePoolV2Factory".to_owned(),
        ];
        let aliased = task("StablePoolV2Factory", "StablePoolFactory");
        assert_eq!(
            aliased.pick_candidate(&candidates).as_deref(),
            Some("contracts/b/StablePoolV2Factory.sol:StablePoolV2Factory")
        );
        let plain = task("StablePoolFactory", "StablePoolFactory");
        assert_eq!(
            plain.pick_candidate(&candidates).as_deref(),
            Some("contracts/a/StablePoolFactory.sol:StablePoolFactory")
        );
        assert_eq!(task("Router", "Router").pick_candidate(&candidates), None);
    }

    #[test]
    fn manual_hint_carries_path_and_encoded_args() {
        let mut t = task("LBPoolFactory", "LBPoolFactory");
        t.contract_path = Some("contracts/LBPoolFactory.sol:LBPoolFactory".into());
        let hint = t.manual_hint();
        assert!(hint.contains("contracts/LBPoolFactory.sol:LBPoolFactory"));
        assert!(hint.contains(&format!("0x{}7", "0".repeat(63))));
    }
}
