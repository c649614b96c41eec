use deploykit_common::Address;
use deploykit_storage::LedgerError;

use crate::{factory::FactoryError, pipeline::AddressMismatch};

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("{0} is neither deployed nor planned in this run")]
    UnresolvedDependency(String),
    #[error("Invalid constructor argument: {0}")]
    InvalidArgument(String),
}

/// Why a single step did not produce a contract.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Connected to chain {actual}, but the network expects chain {expected}")]
    NetworkIdentityMismatch { expected: u64, actual: u64 },
    #[error("Failed to query the chain: {0}")]
    Chain(#[source] FactoryError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Unknown phase {0}")]
    UnknownPhase(String),
    #[error("Step {0} appears more than once in the plan")]
    DuplicateStep(String),
    #[error("Required step {name} in phase {phase} failed: {source}")]
    RequiredStepFailed {
        phase: String,
        name: String,
        #[source]
        source: StepError,
    },
    #[error("{0}")]
    AddressMismatch(AddressMismatch),
    #[error(
        "{} were built against {name} at {predicted:#x}, but it would now be deployed at {forecast:#x}",
        .dependents.join(", ")
    )]
    StalePrediction {
        name: String,
        predicted: Address,
        forecast: Address,
        dependents: Vec<String>,
    },
}
