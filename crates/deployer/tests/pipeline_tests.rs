#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;

use deploykit_common::{
    Address,
    abi::Value,
    address::{AddressPredictor, calculate_create_address},
};
use deploykit_deployer::{
    DeployStep, DeploymentPipeline, MismatchPolicy, PipelineError, PipelineOptions, PipelinePhase,
    Redeploy, StepOutcome,
    testing::{Failure, FakeChain},
};
use deploykit_storage::DeploymentLedger;
use tempfile::TempDir;

const CHAIN_ID: u64 = 31337;
const NETWORK: &str = "localhost";

fn deployer() -> Address {
    Address::from_low_u64_be(0xd3)
}

fn ledger(dir: &TempDir) -> DeploymentLedger {
    DeploymentLedger::open(dir.path(), NETWORK).unwrap()
}

fn plain(name: &str) -> DeployStep {
    DeployStep::with_args(name, vec![])
}

/// A step whose only argument is the address of `dependency`.
fn depends_on(name: &str, dependency: &'static str) -> DeployStep {
    DeployStep::new(name, move |r| Ok(vec![r.address(dependency)?.into()]))
}

/// Admin, Extension and FeeController all need Core's address before Core
/// exists; Core needs the real Extension and FeeController.
fn core_plan() -> Vec<PipelinePhase> {
    vec![PipelinePhase::required(
        "core",
        vec![
            depends_on("Admin", "Core"),
            DeployStep::new("Extension", |r| {
                Ok(vec![r.address("Core")?.into(), r.address("Admin")?.into()])
            }),
            depends_on("FeeController", "Core"),
            DeployStep::new("Core", |r| {
                Ok(vec![
                    r.address("Extension")?.into(),
                    r.address("FeeController")?.into(),
                    r.deployer().into(),
                ])
            }),
        ],
    )]
}

fn pipeline(phases: Vec<PipelinePhase>) -> DeploymentPipeline {
    DeploymentPipeline::new(phases, PipelineOptions::default())
}

#[tokio::test]
async fn core_lands_at_its_predicted_address() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::with_nonce(deployer(), CHAIN_ID, 5);
    let predicted_core = AddressPredictor::new(deployer(), 5).predict(3);

    let result = pipeline(core_plan())
        .run(&mut ledger, &chain, &chain)
        .await
        .unwrap();

    assert!(result.is_success(), "{result}");
    assert!(result.mismatches.is_empty());
    let core = ledger.get("Core").unwrap();
    assert_eq!(core.address, predicted_core.address);
    assert_eq!(predicted_core.nonce, 8);

    let admin_args = chain.deployment_args("Admin").unwrap();
    assert_eq!(admin_args, vec![Value::Address(core.address)]);
    assert_eq!(
        chain.deployment_args("Core").unwrap(),
        vec![
            Value::Address(ledger.get("Extension").unwrap().address),
            Value::Address(ledger.get("FeeController").unwrap().address),
            Value::Address(deployer()),
        ]
    );
    assert_eq!(
        ledger.get("Core").unwrap().constructor_args,
        chain.deployment_args("Core").unwrap()
    );
}

#[tokio::test]
async fn prediction_matches_after_k_creations() {
    for k in 0..=3usize {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let chain = FakeChain::new(deployer(), CHAIN_ID);

        // The first step resolves "Target", which is the k-th creation.
        let mut steps = vec![];
        if k == 0 {
            steps.push(depends_on("Target", "Target"));
        } else {
            steps.push(depends_on("Dependent", "Target"));
            for i in 1..k {
                steps.push(plain(&format!("Filler{i}")));
            }
            steps.push(plain("Target"));
        }

        let result = pipeline(vec![PipelinePhase::required("all", steps)])
            .run(&mut ledger, &chain, &chain)
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.mismatches.is_empty(), "k = {k}");
        let target = ledger.get("Target").unwrap().address;
        assert_eq!(target, calculate_create_address(deployer(), k as u64), "k = {k}");
        let dependent = if k == 0 { "Target" } else { "Dependent" };
        assert_eq!(
            ledger.get(dependent).unwrap().constructor_args,
            vec![Value::Address(target)]
        );
    }
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let plan = pipeline(core_plan());
    let path = DeploymentLedger::path_for(dir.path(), NETWORK);

    {
        let mut ledger = ledger(&dir);
        plan.run(&mut ledger, &chain, &chain).await.unwrap();
    }
    let before = std::fs::read_to_string(&path).unwrap();
    let nonce = chain.nonce();

    let mut ledger = ledger(&dir);
    let result = plan.run(&mut ledger, &chain, &chain).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.deployed().count(), 0);
    assert!(
        result
            .steps
            .iter()
            .all(|s| matches!(s.outcome, StepOutcome::Skipped { .. }))
    );
    assert_eq!(result.steps.len(), 4);
    assert_eq!(chain.nonce(), nonce);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
}

#[tokio::test]
async fn resumes_after_a_failed_step() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let plan = pipeline(vec![PipelinePhase::required(
        "all",
        vec![plain("A"), plain("B"), plain("C")],
    )]);
    chain.fail("B", Failure::Reject);

    {
        let mut ledger = ledger(&dir);
        let result = plan.run(&mut ledger, &chain, &chain).await.unwrap();
        assert!(!result.is_success());
        assert!(matches!(
            result.abort,
            Some(PipelineError::RequiredStepFailed { ref name, .. }) if name == "B"
        ));
        assert!(result.outcome("C").is_none());
        assert!(ledger.has("A"));
        assert!(!ledger.has("B"));
        assert!(!ledger.has("C"));
    }

    chain.heal("B");
    let mut ledger = ledger(&dir);
    let result = plan.run(&mut ledger, &chain, &chain).await.unwrap();
    assert!(result.is_success());
    assert!(matches!(result.outcome("A"), Some(StepOutcome::Skipped { .. })));
    assert!(matches!(result.outcome("B"), Some(StepOutcome::Deployed { .. })));
    assert!(matches!(result.outcome("C"), Some(StepOutcome::Deployed { .. })));
    assert_eq!(chain.deployed_contracts(), ["A", "B", "C"]);
}

#[tokio::test]
async fn optional_failures_do_not_stop_the_run() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    chain.fail("LBPoolFactory", Failure::Revert);

    let result = pipeline(vec![
        PipelinePhase::required("core", vec![plain("Vault")]),
        PipelinePhase::optional(
            "additional",
            vec![
                depends_on("LBPoolFactory", "Vault"),
                depends_on("ReClammPoolFactory", "Vault"),
            ],
        ),
        PipelinePhase::required("routers", vec![depends_on("Router", "Vault")]),
    ])
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert!(result.is_success(), "{result}");
    assert!(matches!(
        result.outcome("LBPoolFactory"),
        Some(StepOutcome::Failed {
            consumed_nonce: true,
            ..
        })
    ));
    assert!(ledger.has("ReClammPoolFactory"));
    assert!(ledger.has("Router"));
    assert!(!ledger.has("LBPoolFactory"));
    assert_eq!(result.addresses.len(), 3);
    assert!(result.summary().contains("additional (optional): 1 deployed, 0 already deployed, 1 failed"));
}

#[tokio::test]
async fn required_failure_aborts_later_phases() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    chain.fail("Vault", Failure::Timeout);

    let result = pipeline(vec![
        PipelinePhase::required("core", vec![plain("Vault")]),
        PipelinePhase::required("routers", vec![depends_on("Router", "Vault")]),
    ])
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert!(!result.is_success());
    assert!(result.outcome("Router").is_none());
    assert!(ledger.is_empty());
    assert!(result.into_result().is_err());
}

#[tokio::test]
async fn unresolved_dependency_is_a_step_failure() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);

    let result = pipeline(vec![
        PipelinePhase::optional("hooks", vec![depends_on("Hook", "Ghost")]),
        PipelinePhase::required("core", vec![depends_on("Router", "Ghost")]),
    ])
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert!(matches!(
        result.outcome("Hook"),
        Some(StepOutcome::Failed {
            consumed_nonce: false,
            ..
        })
    ));
    match result.abort {
        Some(PipelineError::RequiredStepFailed { name, source, .. }) => {
            assert_eq!(name, "Router");
            assert!(source.to_string().contains("Ghost"));
        }
        other => panic!("unexpected abort: {other:?}"),
    }
    assert_eq!(chain.nonce(), 0);
}

#[tokio::test]
async fn rejected_step_between_prediction_and_target_is_a_mismatch() {
    let plan = |policy| {
        DeploymentPipeline::new(
            vec![
                PipelinePhase::required("first", vec![depends_on("Admin", "Core")]),
                PipelinePhase::optional("extra", vec![plain("Extra")]),
                PipelinePhase::required("last", vec![plain("Core")]),
            ],
            PipelineOptions {
                mismatch_policy: policy,
                ..Default::default()
            },
        )
    };

    for policy in [MismatchPolicy::Warn, MismatchPolicy::Abort] {
        let dir = TempDir::new().unwrap();
        let mut ledger = ledger(&dir);
        let chain = FakeChain::new(deployer(), CHAIN_ID);
        chain.fail("Extra", Failure::Reject);

        let result = plan(policy).run(&mut ledger, &chain, &chain).await.unwrap();

        assert_eq!(result.mismatches.len(), 1);
        let mismatch = &result.mismatches[0];
        assert_eq!(mismatch.name, "Core");
        assert_eq!(mismatch.predicted, calculate_create_address(deployer(), 2));
        assert_eq!(mismatch.actual, calculate_create_address(deployer(), 1));
        // The real address is recorded either way.
        assert_eq!(ledger.get("Core").unwrap().address, mismatch.actual);
        assert_eq!(result.is_success(), policy == MismatchPolicy::Warn);
    }
}

#[tokio::test]
async fn nonce_consuming_failure_keeps_predictions_valid() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    chain.fail("Extra", Failure::Revert);

    let result = pipeline(vec![
        PipelinePhase::required("first", vec![depends_on("Admin", "Core")]),
        PipelinePhase::optional("extra", vec![plain("Extra")]),
        PipelinePhase::required("last", vec![plain("Core")]),
    ])
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert!(result.is_success());
    assert!(result.mismatches.is_empty());
    assert_eq!(
        ledger.get("Core").unwrap().address,
        calculate_create_address(deployer(), 2)
    );
}

#[tokio::test]
async fn phase_scoped_run_reads_dependencies_from_ledger() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let phases = || {
        vec![
            PipelinePhase::required("core", vec![plain("Vault")]),
            PipelinePhase::required("routers", vec![depends_on("Router", "Vault")]),
        ]
    };
    let scoped = |name: &str| {
        DeploymentPipeline::new(
            phases(),
            PipelineOptions {
                phases: Some(vec![name.to_owned()]),
                ..Default::default()
            },
        )
    };

    // Routers alone cannot run before the vault exists.
    {
        let mut ledger = ledger(&dir);
        let result = scoped("routers").run(&mut ledger, &chain, &chain).await.unwrap();
        assert!(!result.is_success());
        assert!(ledger.is_empty());
    }

    let mut ledger = ledger(&dir);
    let core = scoped("core").run(&mut ledger, &chain, &chain).await.unwrap();
    assert_eq!(core.steps.len(), 1);
    let routers = scoped("routers").run(&mut ledger, &chain, &chain).await.unwrap();
    assert!(routers.is_success());
    assert_eq!(
        ledger.get("Router").unwrap().constructor_args,
        vec![Value::Address(ledger.get("Vault").unwrap().address)]
    );
}

#[tokio::test]
async fn unknown_phase_is_rejected_up_front() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let err = DeploymentPipeline::new(
        core_plan(),
        PipelineOptions {
            phases: Some(vec!["hooks".into()]),
            ..Default::default()
        },
    )
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownPhase(ref p) if p == "hooks"));
}

#[tokio::test]
async fn wrong_chain_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let err = DeploymentPipeline::new(
        core_plan(),
        PipelineOptions {
            expected_chain_id: Some(1),
            ..Default::default()
        },
    )
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::NetworkIdentityMismatch {
            expected: 1,
            actual: CHAIN_ID
        }
    ));
    assert_eq!(chain.nonce(), 0);
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn forced_redeploy_replaces_only_named_records() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    let phases = || {
        vec![PipelinePhase::required(
            "routers",
            vec![plain("Router"), plain("BatchRouter")],
        )]
    };
    pipeline(phases()).run(&mut ledger, &chain, &chain).await.unwrap();
    let router = ledger.get("Router").unwrap().address;
    let batch_router = ledger.get("BatchRouter").unwrap().address;

    let result = DeploymentPipeline::new(
        phases(),
        PipelineOptions {
            redeploy: Redeploy::Only(BTreeSet::from(["Router".to_owned()])),
            ..Default::default()
        },
    )
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert!(result.is_success());
    assert_ne!(ledger.get("Router").unwrap().address, router);
    assert_eq!(ledger.get("BatchRouter").unwrap().address, batch_router);
    assert!(matches!(
        result.outcome("BatchRouter"),
        Some(StepOutcome::Skipped { .. })
    ));
}

#[tokio::test]
async fn aliased_step_records_its_artifact() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);

    pipeline(vec![PipelinePhase::optional(
        "factories",
        vec![plain("StablePoolV2Factory").artifact("StablePoolFactory")],
    )])
    .run(&mut ledger, &chain, &chain)
    .await
    .unwrap();

    assert_eq!(chain.deployed_contracts(), ["StablePoolFactory"]);
    let record = ledger.get("StablePoolV2Factory").unwrap();
    assert_eq!(record.artifact(), "StablePoolFactory");
}

#[tokio::test]
async fn intervening_transaction_is_detected() {
    let dir = TempDir::new().unwrap();
    let mut ledger = ledger(&dir);
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    chain.interfere_before("Core");

    let result = pipeline(core_plan())
        .run(&mut ledger, &chain, &chain)
        .await
        .unwrap();

    assert_eq!(result.mismatches.len(), 1);
    assert_eq!(result.mismatches[0].predicted, calculate_create_address(deployer(), 3));
    assert_eq!(result.mismatches[0].actual, calculate_create_address(deployer(), 4));
    assert_eq!(
        ledger.get("Admin").unwrap().constructor_args,
        vec![Value::Address(result.mismatches[0].predicted)]
    );
}

fn with_policy(policy: MismatchPolicy, redeploy: Redeploy) -> DeploymentPipeline {
    DeploymentPipeline::new(
        core_plan(),
        PipelineOptions {
            mismatch_policy: policy,
            redeploy,
            ..Default::default()
        },
    )
}

/// Deploys Admin against a predicted Core, then makes Extension fail with
/// `failure` so Core is left for a later run.
async fn stop_after_admin(dir: &TempDir, chain: &FakeChain, failure: Failure) {
    chain.fail("Extension", failure);
    let mut ledger = ledger(dir);
    let result = pipeline(core_plan()).run(&mut ledger, chain, chain).await.unwrap();
    assert!(!result.is_success());
    assert!(ledger.has("Admin"));
    assert!(!ledger.has("Core"));
    chain.heal("Extension");
}

#[tokio::test]
async fn prediction_broken_by_a_failed_run_is_reported_when_the_target_lands() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    stop_after_admin(&dir, &chain, Failure::Revert).await;
    {
        let ledger = ledger(&dir);
        let admin = ledger.get("Admin").unwrap();
        assert_eq!(
            admin.predicted_dependencies.get("Core"),
            Some(&AddressPredictor::new(deployer(), 0).predict(3))
        );
    }

    {
        let mut ledger = ledger(&dir);
        let result = with_policy(MismatchPolicy::Warn, Redeploy::None)
            .run(&mut ledger, &chain, &chain)
            .await
            .unwrap();
        assert!(result.is_success(), "{result}");
        assert_eq!(result.mismatches.len(), 1);
        let mismatch = &result.mismatches[0];
        assert_eq!(mismatch.name, "Core");
        assert_eq!(mismatch.predicted, calculate_create_address(deployer(), 3));
        assert_eq!(mismatch.actual, calculate_create_address(deployer(), 4));
        assert_eq!(mismatch.dependents, ["Admin"]);
        assert_eq!(ledger.get("Core").unwrap().address, mismatch.actual);
    }

    // Nothing left to deploy, but Admin still points to the wrong Core.
    {
        let mut ledger = ledger(&dir);
        let result = with_policy(MismatchPolicy::Warn, Redeploy::None)
            .run(&mut ledger, &chain, &chain)
            .await
            .unwrap();
        assert_eq!(result.deployed().count(), 0);
        assert_eq!(result.mismatches.len(), 1);
        assert_eq!(result.mismatches[0].dependents, ["Admin"]);
        assert!(result.summary().contains("constructor arguments of Admin"));
    }
    {
        let mut ledger = ledger(&dir);
        let nonce = chain.nonce();
        let err = with_policy(MismatchPolicy::Abort, Redeploy::None)
            .run(&mut ledger, &chain, &chain)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::AddressMismatch(ref m) if m.name == "Core"));
        assert_eq!(chain.nonce(), nonce);
    }

    let mut ledger = ledger(&dir);
    let result = with_policy(MismatchPolicy::Abort, Redeploy::All)
        .run(&mut ledger, &chain, &chain)
        .await
        .unwrap();
    assert!(result.is_success(), "{result}");
    assert!(result.mismatches.is_empty());
    let core = ledger.get("Core").unwrap().address;
    assert_eq!(
        ledger.get("Admin").unwrap().constructor_args,
        vec![Value::Address(core)]
    );
}

#[tokio::test]
async fn resume_that_would_break_a_recorded_prediction_sends_nothing() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    stop_after_admin(&dir, &chain, Failure::Revert).await;
    let nonce = chain.nonce();

    let mut ledger = ledger(&dir);
    let err = with_policy(MismatchPolicy::Abort, Redeploy::None)
        .run(&mut ledger, &chain, &chain)
        .await
        .unwrap_err();

    match err {
        PipelineError::StalePrediction {
            name,
            predicted,
            forecast,
            dependents,
        } => {
            assert_eq!(name, "Core");
            assert_eq!(predicted, calculate_create_address(deployer(), 3));
            assert_eq!(forecast, calculate_create_address(deployer(), 4));
            assert_eq!(dependents, ["Admin"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(chain.nonce(), nonce);
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn resume_after_rejected_step_keeps_recorded_predictions() {
    let dir = TempDir::new().unwrap();
    let chain = FakeChain::new(deployer(), CHAIN_ID);
    stop_after_admin(&dir, &chain, Failure::Reject).await;

    let mut ledger = ledger(&dir);
    let result = with_policy(MismatchPolicy::Abort, Redeploy::None)
        .run(&mut ledger, &chain, &chain)
        .await
        .unwrap();

    assert!(result.is_success(), "{result}");
    assert!(result.mismatches.is_empty());
    let core = ledger.get("Core").unwrap().address;
    assert_eq!(core, calculate_create_address(deployer(), 3));
    assert_eq!(
        chain.deployment_args("Admin").unwrap(),
        vec![Value::Address(core)]
    );
}
