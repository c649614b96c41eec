//! Capabilities the pipeline needs from the outside world.

use async_trait::async_trait;
use deploykit_common::{Address, H256, abi::Value};

/// Identity of the deployer and the chain it talks to.
#[async_trait]
pub trait ChainContext: Send + Sync {
    fn deployer(&self) -> Address;

    async fn chain_id(&self) -> Result<u64, FactoryError>;

    /// Number of transactions the deployer has sent so far, including pending ones.
    async fn transaction_count(&self) -> Result<u64, FactoryError>;
}

/// Deploys one compiled contract and waits for its confirmation.
#[async_trait]
pub trait ContractFactory: Send + Sync {
    async fn deploy(&self, contract: &str, args: &[Value]) -> Result<DeployedContract, FactoryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployedContract {
    pub address: Address,
    pub tx_hash: H256,
}

#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// Nothing reached the chain (unknown artifact, bad arguments, node
    /// refused the transaction).
    #[error("{contract}: deployment rejected: {reason}")]
    Rejected { contract: String, reason: String },
    #[error("{contract}: creation transaction {tx_hash:#x} reverted")]
    Reverted { contract: String, tx_hash: H256 },
    #[error("{contract}: timed out waiting for confirmation{}", .tx_hash.map(|h| format!(" of {h:#x}")).unwrap_or_default())]
    Timeout {
        contract: String,
        tx_hash: Option<H256>,
    },
    #[error("Chain query failed: {0}")]
    Chain(String),
}

impl FactoryError {
    /// Whether the failed deployment used up one of the deployer's nonces.
    pub fn consumed_nonce(&self) -> bool {
        matches!(
            self,
            FactoryError::Reverted { .. } | FactoryError::Timeout { .. }
        )
    }
}
