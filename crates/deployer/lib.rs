//! Deployment orchestration: the phased pipeline that turns a plan into
//! on-chain contracts, and the engine that verifies them on an explorer.

pub mod error;
pub mod factory;
pub mod pipeline;
pub mod verify;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{PipelineError, ResolveError, StepError};
pub use factory::{ChainContext, ContractFactory, DeployedContract, FactoryError};
pub use pipeline::{
    AddressMismatch, DeployStep, DeploymentPipeline, MismatchPolicy, PipelineOptions,
    PipelinePhase, PipelineResult, Redeploy, Resolver, StepOutcome, StepReport,
};
pub use verify::{
    Explorer, ExplorerError, ExplorerOutcome, TaskOutcome, TaskResult, VerificationEngine,
    VerificationOptions, VerificationReport, VerificationRequest, VerificationTask, verify_all,
};
