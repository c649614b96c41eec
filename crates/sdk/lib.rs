//! Concrete collaborators for the deployer: Hardhat artifacts, an RPC-backed
//! contract factory and an Etherscan-compatible explorer.

pub mod artifacts;
pub mod explorer;
pub mod factory;

pub use artifacts::{Artifact, ArtifactEntry, ArtifactError, ArtifactIndex, BuildInfo};
pub use explorer::{EtherscanExplorer, ResponseKind, classify_response};
pub use factory::RpcContractFactory;
