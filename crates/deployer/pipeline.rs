//! Phased, resumable deployment of mutually dependent contracts.
//!
//! A plan is a list of [`PipelinePhase`]s, each an ordered list of
//! [`DeployStep`]s. Steps whose name is already in the ledger are skipped,
//! so re-running a plan after a failure resumes at the first missing
//! contract.
//!
//! Constructor arguments are built lazily by each step through a
//! [`Resolver`]. A name resolves to its real address when it is deployed
//! (earlier in this run or in the ledger), and to a predicted `CREATE`
//! address when it is still pending in this run. The prediction offset is
//! the number of creation transactions queued between the step being built
//! and the target, so inserting or removing steps never requires touching
//! offsets by hand.

use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use deploykit_common::{
    Address, H256,
    abi::Value,
    address::{AddressPredictor, PredictedAddress},
};
use deploykit_storage::{DeploymentLedger, DeploymentRecord};
use tracing::{info, warn};

use crate::{
    error::{PipelineError, ResolveError, StepError},
    factory::{ChainContext, ContractFactory},
};

type ArgsBuilder = Arc<dyn Fn(&Resolver<'_>) -> Result<Vec<Value>, ResolveError> + Send + Sync>;

#[derive(Clone)]
pub struct DeployStep {
    name: String,
    contract: String,
    args: ArgsBuilder,
}

impl DeployStep {
    /// A step whose constructor arguments depend on other contracts.
    pub fn new<F>(name: impl Into<String>, args: F) -> Self
    where
        F: Fn(&Resolver<'_>) -> Result<Vec<Value>, ResolveError> + Send + Sync + 'static,
    {
        let name = name.into();
        Self {
            contract: name.clone(),
            name,
            args: Arc::new(args),
        }
    }

    pub fn with_args(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(name, move |_| Ok(args.clone()))
    }

    /// Deploys the artifact `contract` under this step's name.
    pub fn artifact(mut self, contract: impl Into<String>) -> Self {
        self.contract = contract.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }
}

impl fmt::Debug for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployStep")
            .field("name", &self.name)
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PipelinePhase {
    pub name: String,
    pub steps: Vec<DeployStep>,
    /// A failed step in a required phase aborts the run.
    pub required: bool,
}

impl PipelinePhase {
    pub fn required(name: impl Into<String>, steps: Vec<DeployStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, steps: Vec<DeployStep>) -> Self {
        Self {
            name: name.into(),
            steps,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redeploy {
    #[default]
    None,
    All,
    Only(BTreeSet<String>),
}

impl Redeploy {
    pub fn forces(&self, name: &str) -> bool {
        match self {
            Redeploy::None => false,
            Redeploy::All => true,
            Redeploy::Only(names) => names.contains(name),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Log the mismatch, keep it in the result and continue.
    #[default]
    Warn,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub redeploy: Redeploy,
    /// Run only these phases; everything else must already be in the ledger.
    pub phases: Option<Vec<String>>,
    pub mismatch_policy: MismatchPolicy,
    /// Refuse to send anything if the node reports another chain id.
    pub expected_chain_id: Option<u64>,
}

/// A contract that landed somewhere other than where its dependents were
/// told it would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMismatch {
    pub name: String,
    pub predicted: Address,
    pub actual: Address,
    pub nonce: u64,
    /// Contracts whose constructor arguments hold `predicted`.
    pub dependents: Vec<String>,
}

impl fmt::Display for AddressMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} was predicted at {:#x} (nonce {}) but deployed at {:#x}; ",
            self.name, self.predicted, self.nonce, self.actual
        )?;
        if self.dependents.is_empty() {
            f.write_str("contracts built against the prediction point to the wrong address")
        } else {
            write!(
                f,
                "constructor arguments of {} point to the wrong address",
                self.dependents.join(", ")
            )
        }
    }
}

/// Folds the predictions made for one target into one mismatch per distinct
/// wrong address.
fn mismatches_against(
    name: &str,
    actual: Address,
    expectations: Vec<(String, PredictedAddress)>,
) -> Vec<AddressMismatch> {
    let mut found: Vec<AddressMismatch> = Vec::new();
    for (dependent, prediction) in expectations {
        if prediction.address == actual {
            continue;
        }
        match found.iter_mut().find(|m| m.predicted == prediction.address) {
            Some(mismatch) => {
                if !mismatch.dependents.contains(&dependent) {
                    mismatch.dependents.push(dependent);
                }
            }
            None => found.push(AddressMismatch {
                name: name.to_owned(),
                predicted: prediction.address,
                actual,
                nonce: prediction.nonce,
                dependents: vec![dependent],
            }),
        }
    }
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Deployed { address: Address, tx_hash: H256 },
    /// Already in the ledger.
    Skipped { address: Address },
    Failed { reason: String, consumed_nonce: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub phase: String,
    pub name: String,
    pub required: bool,
    pub outcome: StepOutcome,
}

#[derive(Debug)]
pub struct PipelineResult {
    pub steps: Vec<StepReport>,
    pub mismatches: Vec<AddressMismatch>,
    /// Addresses of every step in scope that exists after the run.
    pub addresses: BTreeMap<String, Address>,
    pub elapsed: Duration,
    /// Set when a required step failed or a mismatch aborted the run.
    pub abort: Option<PipelineError>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.abort.is_none()
    }

    pub fn deployed(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Deployed { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.name == name).map(|s| &s.outcome)
    }

    /// Converts an aborted run into its error.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        match self.abort {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Human readable per-phase summary.
    pub fn summary(&self) -> String {
        let mut phases: Vec<(&str, bool, Vec<&StepReport>)> = Vec::new();
        for step in &self.steps {
            match phases.iter_mut().find(|(name, _, _)| *name == step.phase) {
                Some((_, _, steps)) => steps.push(step),
                None => phases.push((step.phase.as_str(), step.required, vec![step])),
            }
        }

        let mut out = String::new();
        for (phase, required, steps) in phases {
            let count = |f: fn(&StepOutcome) -> bool| steps.iter().filter(|s| f(&s.outcome)).count();
            let deployed = count(|o| matches!(o, StepOutcome::Deployed { .. }));
            let skipped = count(|o| matches!(o, StepOutcome::Skipped { .. }));
            let failed = count(|o| matches!(o, StepOutcome::Failed { .. }));
            out.push_str(&format!(
                "{phase} ({}): {deployed} deployed, {skipped} already deployed, {failed} failed\n",
                if required { "required" } else { "optional" }
            ));
            for step in steps {
                let line = match &step.outcome {
                    StepOutcome::Deployed { address, .. } => format!("  + {} {address:#x}", step.name),
                    StepOutcome::Skipped { address } => format!("  = {} {address:#x}", step.name),
                    StepOutcome::Failed { reason, .. } => format!("  ! {} {reason}", step.name),
                };
                out.push_str(&line);
                out.push('\n');
            }
        }
        for mismatch in &self.mismatches {
            out.push_str(&format!("address mismatch: {mismatch}\n"));
        }
        if let Some(abort) = &self.abort {
            out.push_str(&format!("aborted: {abort}\n"));
        }
        out.push_str(&format!("elapsed: {:.1}s\n", self.elapsed.as_secs_f64()));
        out
    }
}

impl fmt::Display for PipelineResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Resolves contract names to addresses while a step builds its arguments.
pub struct Resolver<'a> {
    deployer: Address,
    chain_id: u64,
    ledger: &'a DeploymentLedger,
    deployed: &'a HashMap<String, Address>,
    queue: &'a [QueuedStep<'a>],
    position: usize,
    predictor: AddressPredictor,
    consumed: u64,
    predictions: RefCell<Vec<(String, PredictedAddress)>>,
}

impl Resolver<'_> {
    pub fn deployer(&self) -> Address {
        self.deployer
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Real address of `name`, or its predicted address if it is still
    /// pending in this run (including the step currently being built).
    pub fn address(&self, name: &str) -> Result<Address, ResolveError> {
        if let Some(address) = self.deployed.get(name) {
            return Ok(*address);
        }

        if let Some(distance) = self.queue[self.position..]
            .iter()
            .position(|queued| queued.step.name == name)
        {
            let predicted = self.predictor.predict(self.consumed + distance as u64);
            self.predictions
                .borrow_mut()
                .push((name.to_owned(), predicted));
            return Ok(predicted.address);
        }

        self.ledger
            .get(name)
            .map(|record| record.address)
            .ok_or_else(|| ResolveError::UnresolvedDependency(name.to_owned()))
    }

    fn into_predictions(self) -> Vec<(String, PredictedAddress)> {
        self.predictions.into_inner()
    }
}

struct QueuedStep<'a> {
    phase: &'a PipelinePhase,
    step: &'a DeployStep,
}

#[derive(Debug, Clone)]
pub struct DeploymentPipeline {
    phases: Vec<PipelinePhase>,
    options: PipelineOptions,
}

impl DeploymentPipeline {
    pub fn new(phases: Vec<PipelinePhase>, options: PipelineOptions) -> Self {
        Self { phases, options }
    }

    pub fn phases(&self) -> &[PipelinePhase] {
        &self.phases
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn in_scope(&self, phase: &PipelinePhase) -> bool {
        self.options
            .phases
            .as_ref()
            .is_none_or(|selected| selected.iter().any(|p| p == &phase.name))
    }

    fn validate(&self) -> Result<(), PipelineError> {
        if let Some(selected) = &self.options.phases {
            for name in selected {
                if !self.phases.iter().any(|p| &p.name == name) {
                    return Err(PipelineError::UnknownPhase(name.clone()));
                }
            }
        }
        let mut seen = BTreeSet::new();
        for step in self.phases.iter().flat_map(|p| &p.steps) {
            if !seen.insert(step.name.as_str()) {
                return Err(PipelineError::DuplicateStep(step.name.clone()));
            }
        }
        Ok(())
    }

    /// Checks the predictions stored with already deployed contracts.
    ///
    /// A target that is in the ledger at another address is a mismatch from
    /// an earlier run. A target still queued must land where the dependents
    /// were told; if the current nonce already puts it elsewhere the run
    /// stops before sending anything under [`MismatchPolicy::Abort`].
    /// Returns the predictions to check once queued targets are deployed.
    fn check_recorded_predictions(
        &self,
        ledger: &DeploymentLedger,
        queue: &[QueuedStep<'_>],
        predictor: AddressPredictor,
        mismatches: &mut Vec<AddressMismatch>,
    ) -> Result<HashMap<String, Vec<(String, PredictedAddress)>>, PipelineError> {
        let positions: HashMap<&str, usize> = queue
            .iter()
            .enumerate()
            .map(|(i, queued)| (queued.step.name.as_str(), i))
            .collect();

        let mut expectations: HashMap<String, Vec<(String, PredictedAddress)>> = HashMap::new();
        let mut settled: BTreeMap<String, Vec<(String, PredictedAddress)>> = BTreeMap::new();
        for record in ledger.all() {
            if positions.contains_key(record.name.as_str()) {
                continue;
            }
            for (target, prediction) in &record.predicted_dependencies {
                let pending = if positions.contains_key(target.as_str()) {
                    expectations.entry(target.clone()).or_default()
                } else if ledger.has(target) {
                    settled.entry(target.clone()).or_default()
                } else {
                    continue;
                };
                pending.push((record.name.clone(), *prediction));
            }
        }

        for (target, expected) in settled {
            let Some(actual) = ledger.get(&target).map(|record| record.address) else {
                continue;
            };
            for mismatch in mismatches_against(&target, actual, expected) {
                warn!(%mismatch, "Recorded prediction differs from deployed address");
                if self.options.mismatch_policy == MismatchPolicy::Abort {
                    return Err(PipelineError::AddressMismatch(mismatch));
                }
                mismatches.push(mismatch);
            }
        }

        let mut targets: Vec<_> = expectations.keys().cloned().collect();
        targets.sort_by_key(|target| positions.get(target.as_str()).copied());
        for target in targets {
            let Some(position) = positions.get(target.as_str()) else {
                continue;
            };
            let forecast = predictor.predict(*position as u64);
            let expected = expectations.get(&target).cloned().unwrap_or_default();
            for stale in mismatches_against(&target, forecast.address, expected) {
                warn!(
                    name = %target,
                    predicted = %format!("{:#x}", stale.predicted),
                    forecast = %format!("{:#x}", forecast.address),
                    dependents = %stale.dependents.join(", "),
                    "Recorded prediction no longer matches the next nonce, redeploy the dependents with it"
                );
                if self.options.mismatch_policy == MismatchPolicy::Abort {
                    return Err(PipelineError::StalePrediction {
                        name: target,
                        predicted: stale.predicted,
                        forecast: forecast.address,
                        dependents: stale.dependents,
                    });
                }
            }
        }
        Ok(expectations)
    }

    /// Runs the plan against `ledger`.
    ///
    /// Returns `Err` only when nothing could be attempted (invalid plan, wrong
    /// chain, unreachable node) or when a deployed contract could not be
    /// recorded. Step failures are reported in the [`PipelineResult`].
    pub async fn run(
        &self,
        ledger: &mut DeploymentLedger,
        chain: &dyn ChainContext,
        factory: &dyn ContractFactory,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        self.validate()?;

        let chain_id = chain.chain_id().await.map_err(PipelineError::Chain)?;
        if let Some(expected) = self.options.expected_chain_id
            && expected != chain_id
        {
            return Err(PipelineError::NetworkIdentityMismatch {
                expected,
                actual: chain_id,
            });
        }

        let deployer = chain.deployer();
        let base_nonce = chain
            .transaction_count()
            .await
            .map_err(PipelineError::Chain)?;
        let predictor = AddressPredictor::new(deployer, base_nonce);
        info!(
            deployer = %format!("{deployer:#x}"),
            chain_id,
            nonce = base_nonce,
            "Starting deployment"
        );

        let mut steps = Vec::new();
        let mut queue = Vec::new();
        for phase in self.phases.iter().filter(|p| self.in_scope(p)) {
            for step in &phase.steps {
                match ledger.get(&step.name) {
                    Some(record) if !self.options.redeploy.forces(&step.name) => {
                        info!(name = %step.name, address = %format!("{:#x}", record.address), "Already deployed, skipping");
                        steps.push(StepReport {
                            phase: phase.name.clone(),
                            name: step.name.clone(),
                            required: phase.required,
                            outcome: StepOutcome::Skipped {
                                address: record.address,
                            },
                        });
                    }
                    _ => queue.push(QueuedStep { phase, step }),
                }
            }
        }

        let mut mismatches = Vec::new();
        let mut expectations =
            self.check_recorded_predictions(ledger, &queue, predictor, &mut mismatches)?;

        let mut deployed: HashMap<String, Address> = HashMap::new();
        let mut consumed = 0u64;
        let mut abort = None;

        for position in 0..queue.len() {
            let QueuedStep { phase, step } = &queue[position];
            let (phase, step) = (*phase, *step);

            let resolver = Resolver {
                deployer,
                chain_id,
                ledger: &*ledger,
                deployed: &deployed,
                queue: &queue,
                position,
                predictor,
                consumed,
                predictions: RefCell::new(Vec::new()),
            };
            let args = (step.args)(&resolver);
            let step_predictions = resolver.into_predictions();

            let result = match args {
                Ok(args) => factory
                    .deploy(&step.contract, &args)
                    .await
                    .map(|contract| (contract, args))
                    .map_err(StepError::from),
                Err(err) => Err(StepError::from(err)),
            };

            let outcome = match result {
                Ok((contract, args)) => {
                    consumed += 1;
                    info!(
                        name = %step.name,
                        address = %format!("{:#x}", contract.address),
                        tx_hash = %format!("{:#x}", contract.tx_hash),
                        "Deployed contract"
                    );
                    let mut recorded = BTreeMap::new();
                    for (target, prediction) in &step_predictions {
                        if target != &step.name {
                            recorded.entry(target.clone()).or_insert(*prediction);
                        }
                    }
                    ledger.append(
                        DeploymentRecord::new(
                            &step.name,
                            contract.address,
                            args,
                            Some(contract.tx_hash),
                        )
                        .with_contract(&step.contract)
                        .with_predicted_dependencies(recorded),
                    )?;
                    deployed.insert(step.name.clone(), contract.address);

                    for (target, prediction) in step_predictions {
                        expectations
                            .entry(target)
                            .or_default()
                            .push((step.name.clone(), prediction));
                    }
                    let expected = expectations.remove(&step.name).unwrap_or_default();
                    for mismatch in mismatches_against(&step.name, contract.address, expected) {
                        warn!(%mismatch, "Deployed address differs from prediction");
                        if self.options.mismatch_policy == MismatchPolicy::Abort && abort.is_none() {
                            abort = Some(PipelineError::AddressMismatch(mismatch.clone()));
                        }
                        mismatches.push(mismatch);
                    }

                    StepOutcome::Deployed {
                        address: contract.address,
                        tx_hash: contract.tx_hash,
                    }
                }
                Err(err) => {
                    let consumed_nonce = matches!(&err, StepError::Factory(e) if e.consumed_nonce());
                    if consumed_nonce {
                        consumed += 1;
                    }
                    let outcome = StepOutcome::Failed {
                        reason: err.to_string(),
                        consumed_nonce,
                    };
                    if phase.required {
                        warn!(name = %step.name, phase = %phase.name, %err, "Required step failed, aborting");
                        abort = Some(PipelineError::RequiredStepFailed {
                            phase: phase.name.clone(),
                            name: step.name.clone(),
                            source: err,
                        });
                    } else {
                        warn!(name = %step.name, phase = %phase.name, %err, "Optional step failed, continuing");
                    }
                    outcome
                }
            };

            steps.push(StepReport {
                phase: phase.name.clone(),
                name: step.name.clone(),
                required: phase.required,
                outcome,
            });

            if abort.is_some() {
                break;
            }
        }

        // Keep reports in plan order regardless of which steps were skipped.
        let order: HashMap<&str, usize> = self
            .phases
            .iter()
            .flat_map(|p| &p.steps)
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        steps.sort_by_key(|s| order.get(s.name.as_str()).copied().unwrap_or(usize::MAX));

        let addresses = steps
            .iter()
            .filter_map(|s| match s.outcome {
                StepOutcome::Deployed { address, .. } | StepOutcome::Skipped { address } => {
                    Some((s.name.clone(), address))
                }
                StepOutcome::Failed { .. } => None,
            })
            .collect();

        let result = PipelineResult {
            steps,
            mismatches,
            addresses,
            elapsed: started.elapsed(),
            abort,
        };
        info!(
            deployed = result.deployed().count(),
            failed = result.failed().count(),
            elapsed_secs = result.elapsed.as_secs(),
            "Deployment finished"
        );
        Ok(result)
    }
}
