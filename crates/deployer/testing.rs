//! In-memory chain and explorer for exercising the pipeline and the
//! verification engine without a node.

#![allow(clippy::unwrap_used)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use deploykit_common::{Address, H256, abi::Value, address::calculate_create_address};

use crate::{
    factory::{ChainContext, ContractFactory, DeployedContract, FactoryError},
    verify::{Explorer, ExplorerError, ExplorerOutcome, VerificationRequest},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Reject,
    Revert,
    Timeout,
}

#[derive(Debug, Default)]
struct ChainState {
    nonce: u64,
    deployments: Vec<(String, Vec<Value>)>,
    failures: HashMap<String, Failure>,
    interfere_before: HashSet<String>,
}

/// A deployer account on a fake chain. Contracts land at the real `CREATE`
/// address for the account's current nonce.
#[derive(Debug)]
pub struct FakeChain {
    deployer: Address,
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(deployer: Address, chain_id: u64) -> Self {
        Self::with_nonce(deployer, chain_id, 0)
    }

    pub fn with_nonce(deployer: Address, chain_id: u64, nonce: u64) -> Self {
        Self {
            deployer,
            chain_id,
            state: Mutex::new(ChainState {
                nonce,
                ..Default::default()
            }),
        }
    }

    /// Makes every deployment of `contract` fail with `failure`.
    pub fn fail(&self, contract: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(contract.to_owned(), failure);
    }

    pub fn heal(&self, contract: &str) {
        self.state.lock().unwrap().failures.remove(contract);
    }

    /// Simulates a transaction sent by someone else from the same account.
    pub fn send_unrelated_transaction(&self) {
        self.state.lock().unwrap().nonce += 1;
    }

    /// Sends an unrelated transaction right before the next deployment of
    /// `contract`.
    pub fn interfere_before(&self, contract: &str) {
        self.state
            .lock()
            .unwrap()
            .interfere_before
            .insert(contract.to_owned());
    }

    pub fn nonce(&self) -> u64 {
        self.state.lock().unwrap().nonce
    }

    /// Artifact names passed to `deploy` that produced a contract, in order.
    pub fn deployed_contracts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn deployment_args(&self, contract: &str) -> Option<Vec<Value>> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .rev()
            .find(|(name, _)| name == contract)
            .map(|(_, args)| args.clone())
    }
}

#[async_trait]
impl ChainContext for FakeChain {
    fn deployer(&self) -> Address {
        self.deployer
    }

    async fn chain_id(&self) -> Result<u64, FactoryError> {
        Ok(self.chain_id)
    }

    async fn transaction_count(&self) -> Result<u64, FactoryError> {
        Ok(self.nonce())
    }
}

#[async_trait]
impl ContractFactory for FakeChain {
    async fn deploy(&self, contract: &str, args: &[Value]) -> Result<DeployedContract, FactoryError> {
        let mut state = self.state.lock().unwrap();
        if state.interfere_before.remove(contract) {
            state.nonce += 1;
        }
        let nonce = state.nonce;
        let tx_hash = H256::from_low_u64_be(nonce + 1);

        match state.failures.get(contract).copied() {
            Some(Failure::Reject) => {
                return Err(FactoryError::Rejected {
                    contract: contract.to_owned(),
                    reason: "insufficient funds".to_owned(),
                });
            }
            Some(Failure::Revert) => {
                state.nonce += 1;
                return Err(FactoryError::Reverted {
                    contract: contract.to_owned(),
                    tx_hash,
                });
            }
            Some(Failure::Timeout) => {
                state.nonce += 1;
                return Err(FactoryError::Timeout {
                    contract: contract.to_owned(),
                    tx_hash: Some(tx_hash),
                });
            }
            None => {}
        }

        state.nonce += 1;
        state.deployments.push((contract.to_owned(), args.to_vec()));
        Ok(DeployedContract {
            address: calculate_create_address(self.deployer, nonce),
            tx_hash,
        })
    }
}

type Scripted = Result<ExplorerOutcome, ExplorerError>;

/// Explorer that answers from per-contract scripts, then reports `Verified`.
#[derive(Debug, Default)]
pub struct FakeExplorer {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    always: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<VerificationRequest>>,
    submitted_at: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl FakeExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one answer for the next submission of `name`.
    pub fn then(&self, name: &str, answer: Scripted) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_default()
            .push_back(answer);
        self
    }

    /// Answers every submission of `name` the same way once its script ran out.
    pub fn always(&self, name: &str, answer: Scripted) -> &Self {
        self.always.lock().unwrap().insert(name.to_owned(), answer);
        self
    }

    pub fn requests(&self) -> Vec<VerificationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Name and arrival time of every submission, in arrival order.
    pub fn timeline(&self) -> Vec<(String, tokio::time::Instant)> {
        self.submitted_at.lock().unwrap().clone()
    }

    pub fn submissions(&self, name: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .count()
    }
}

#[async_trait]
impl Explorer for FakeExplorer {
    async fn verify(&self, request: &VerificationRequest) -> Result<ExplorerOutcome, ExplorerError> {
        self.requests.lock().unwrap().push(request.clone());
        self.submitted_at
            .lock()
            .unwrap()
            .push((request.name.clone(), tokio::time::Instant::now()));
        if let Some(answer) = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.name)
            .and_then(VecDeque::pop_front)
        {
            return answer;
        }
        self.always
            .lock()
            .unwrap()
            .get(&request.name)
            .cloned()
            .unwrap_or(Ok(ExplorerOutcome::Verified))
    }
}
