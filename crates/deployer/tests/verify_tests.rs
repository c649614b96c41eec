#![allow(clippy::unwrap_used)]

use std::{collections::BTreeMap, time::Duration};

use deploykit_common::{Address, abi::Value};
use deploykit_deployer::{
    ExplorerError, ExplorerOutcome, TaskOutcome, VerificationEngine, VerificationOptions,
    testing::FakeExplorer, verify_all,
};
use deploykit_storage::{DeploymentLedger, DeploymentRecord};
use tempfile::TempDir;

const NETWORK: &str = "moksha";

fn options() -> VerificationOptions {
    VerificationOptions {
        retry_delay: Duration::ZERO,
        task_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn ledger_with(dir: &TempDir, names: &[&str]) -> DeploymentLedger {
    let mut ledger = DeploymentLedger::open(dir.path(), NETWORK).unwrap();
    for (i, name) in names.iter().enumerate() {
        let mut record = DeploymentRecord::new(
            *name,
            Address::from_low_u64_be(i as u64 + 1),
            vec![Value::Address(Address::from_low_u64_be(0xaa))],
            None,
        );
        record.deployed_at = chrono_at(i as i64);
        ledger.append(record).unwrap();
    }
    ledger
}

fn chrono_at(secs: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn transient() -> Result<ExplorerOutcome, ExplorerError> {
    Err(ExplorerError::Transient("rate limited".into()))
}

#[tokio::test]
async fn already_verified_counts_as_success() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["Vault", "Router"]);
    let explorer = FakeExplorer::new();
    explorer.then("Vault", Ok(ExplorerOutcome::AlreadyVerified));

    let report = verify_all(&ledger, &explorer, &options()).await;

    assert_eq!(report.verified(), 1);
    assert_eq!(report.already_verified(), 1);
    assert_eq!(report.failed(), 0);
    assert!(!report.is_fatal());
    assert_eq!(explorer.submissions("Vault"), 1);
}

#[tokio::test]
async fn always_transient_is_submitted_max_retries_times() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["Vault"]);

    for max_retries in [1, 3, 5] {
        let explorer = FakeExplorer::new();
        explorer.always("Vault", transient());
        let report = verify_all(
            &ledger,
            &explorer,
            &VerificationOptions {
                max_retries,
                ..options()
            },
        )
        .await;

        assert_eq!(explorer.submissions("Vault"), max_retries as usize);
        let result = report.get("Vault").unwrap();
        assert!(matches!(result.outcome, TaskOutcome::Failed { .. }));
        assert_eq!(result.task.attempts, max_retries);
        assert!(report.is_fatal());
    }
}

#[tokio::test]
async fn transient_failure_recovers_within_budget() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["Vault"]);
    let explorer = FakeExplorer::new();
    explorer
        .then("Vault", transient())
        .then("Vault", transient())
        .then("Vault", Ok(ExplorerOutcome::Verified));

    let report = verify_all(&ledger, &explorer, &options()).await;

    assert_eq!(report.verified(), 1);
    assert_eq!(explorer.submissions("Vault"), 3);
}

#[tokio::test]
async fn ambiguous_bytecode_is_resolved_from_candidates() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["WeightedPoolFactory"]);
    let explorer = FakeExplorer::new();
    explorer.then(
        "WeightedPoolFactory",
        Err(ExplorerError::AmbiguousBytecode {
            candidates: vec![
                "contracts/mocks/WeightedPoolFactoryMock.sol:WeightedPoolFactoryMock".into(),
                "contracts/pools/WeightedPoolFactory.sol:WeightedPoolFactory".into(),
            ],
        }),
    );

    let report = verify_all(&ledger, &explorer, &options()).await;

    assert_eq!(report.verified(), 1);
    let requests = explorer.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].contract_path, None);
    assert_eq!(
        requests[1].contract_path.as_deref(),
        Some("contracts/pools/WeightedPoolFactory.sol:WeightedPoolFactory")
    );
}

#[tokio::test]
async fn supplied_contract_path_is_used_from_the_start() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["LBPoolFactory"]);
    let path = "contracts/core/additional/factories/LBPoolFactory.sol:LBPoolFactory";
    let options = VerificationOptions {
        contract_path_hints: BTreeMap::from([("LBPoolFactory".to_owned(), path.to_owned())]),
        ..options()
    };
    let explorer = FakeExplorer::new();

    let report = verify_all(&ledger, &explorer, &options).await;

    assert_eq!(report.verified(), 1);
    assert_eq!(explorer.requests()[0].contract_path.as_deref(), Some(path));
}

#[tokio::test]
async fn unresolvable_ambiguity_fails_without_retrying() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["Router"]);
    let explorer = FakeExplorer::new();
    explorer.always(
        "Router",
        Err(ExplorerError::AmbiguousBytecode {
            candidates: vec!["contracts/Other.sol:Other".into()],
        }),
    );

    let report = verify_all(&ledger, &explorer, &options()).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(explorer.submissions("Router"), 1);
    let result = report.get("Router").unwrap();
    assert!(result.manual_hint.as_deref().unwrap().contains("Router"));
}

#[tokio::test]
async fn non_critical_failures_are_not_fatal() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["Vault", "LBPoolFactory"]);
    let explorer = FakeExplorer::new();
    explorer.always("LBPoolFactory", Err(ExplorerError::Rejected("no source".into())));
    let options = VerificationOptions {
        non_critical: ["LBPoolFactory".to_owned()].into(),
        ..options()
    };

    let report = verify_all(&ledger, &explorer, &options).await;

    assert_eq!(report.failed(), 1);
    assert_eq!(report.non_critical_failures().count(), 1);
    assert_eq!(report.critical_failures().count(), 0);
    assert!(!report.is_fatal());
    // Rejections are final.
    assert_eq!(explorer.submissions("LBPoolFactory"), 1);
    assert!(report.summary().contains("LBPoolFactory (non-critical)"));
}

#[tokio::test]
async fn priority_names_go_first() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["StablePoolFactory", "Router", "Vault", "Hook"]);
    let explorer = FakeExplorer::new();
    let options = VerificationOptions {
        priority: vec!["Vault".into(), "Router".into(), "Missing".into()],
        ..options()
    };

    let engine = VerificationEngine::new(&explorer, &options);
    let order: Vec<_> = engine.tasks(&ledger).into_iter().map(|t| t.name).collect();
    assert_eq!(order, ["Vault", "Router", "StablePoolFactory", "Hook"]);

    engine.verify_all(&ledger).await;
    let submitted: Vec<_> = explorer.requests().into_iter().map(|r| r.name).collect();
    assert_eq!(submitted, order);
}

#[tokio::test]
async fn concurrent_verification_keeps_report_order() {
    let dir = TempDir::new().unwrap();
    let names = ["A", "B", "C", "D", "E"];
    let ledger = ledger_with(&dir, &names);
    let explorer = FakeExplorer::new();
    explorer.then("C", transient());
    let options = VerificationOptions {
        concurrency: 3,
        ..options()
    };

    let report = verify_all(&ledger, &explorer, &options).await;

    let reported: Vec<_> = report.results.iter().map(|r| r.task.name.as_str()).collect();
    assert_eq!(reported, names);
    assert_eq!(report.verified(), 5);
    assert_eq!(explorer.submissions("C"), 2);
}

#[tokio::test]
async fn empty_ledger_gives_empty_report() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &[]);
    let report = verify_all(&ledger, &FakeExplorer::new(), &options()).await;
    assert!(report.results.is_empty());
    assert!(!report.is_fatal());
}

/// Seconds since `start` of every submission, in order.
fn offsets(explorer: &FakeExplorer, start: tokio::time::Instant) -> Vec<(String, u64)> {
    explorer
        .timeline()
        .into_iter()
        .map(|(name, at)| (name, (at - start).as_secs()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn retries_wait_for_the_task_delay_of_concurrent_tasks() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["A", "B"]);
    let explorer = FakeExplorer::new();
    explorer.then("A", transient());
    let options = VerificationOptions {
        concurrency: 2,
        task_delay: Duration::from_secs(10),
        retry_delay: Duration::from_secs(1),
        ..Default::default()
    };

    let start = tokio::time::Instant::now();
    let report = verify_all(&ledger, &explorer, &options).await;

    assert_eq!(report.verified(), 2);
    assert_eq!(
        offsets(&explorer, start),
        [("A".to_owned(), 0), ("B".to_owned(), 10), ("A".to_owned(), 20)]
    );
}

#[tokio::test(start_paused = true)]
async fn sequential_submissions_respect_both_delays() {
    let dir = TempDir::new().unwrap();
    let ledger = ledger_with(&dir, &["A", "B"]);
    let explorer = FakeExplorer::new();
    explorer.then("A", transient());
    let options = VerificationOptions {
        task_delay: Duration::from_secs(3),
        retry_delay: Duration::from_secs(5),
        ..Default::default()
    };

    let start = tokio::time::Instant::now();
    verify_all(&ledger, &explorer, &options).await;

    // The retry waits out retry_delay; B then waits out task_delay.
    assert_eq!(
        offsets(&explorer, start),
        [("A".to_owned(), 0), ("A".to_owned(), 5), ("B".to_owned(), 8)]
    );
}
