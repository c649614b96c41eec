//! [`ContractFactory`] and [`ChainContext`] over a JSON-RPC node and a local
//! signer.

use async_trait::async_trait;
use deploykit_common::{Address, abi::Value, address::calculate_create_address};
use deploykit_deployer::{ChainContext, ContractFactory, DeployedContract, FactoryError};
use deploykit_rpc::{EthClient, EthClientError, Signer};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::artifacts::ArtifactIndex;

pub struct RpcContractFactory {
    client: EthClient,
    signer: Signer,
    artifacts: ArtifactIndex,
    chain_id: OnceCell<u64>,
    /// Next nonce to use, fetched lazily from the node and advanced locally
    /// after every submitted transaction.
    next_nonce: Mutex<Option<u64>>,
}

impl RpcContractFactory {
    pub fn new(client: EthClient, signer: Signer, artifacts: ArtifactIndex) -> Self {
        Self {
            client,
            signer,
            artifacts,
            chain_id: OnceCell::new(),
            next_nonce: Mutex::new(None),
        }
    }

    async fn cached_chain_id(&self) -> Result<u64, EthClientError> {
        self.chain_id
            .get_or_try_init(|| self.client.get_chain_id())
            .await
            .copied()
    }
}

fn chain_error(err: EthClientError) -> FactoryError {
    FactoryError::Chain(err.to_string())
}

#[async_trait]
impl ChainContext for RpcContractFactory {
    fn deployer(&self) -> Address {
        self.signer.address()
    }

    async fn chain_id(&self) -> Result<u64, FactoryError> {
        self.cached_chain_id().await.map_err(chain_error)
    }

    async fn transaction_count(&self) -> Result<u64, FactoryError> {
        self.client
            .get_nonce(self.signer.address())
            .await
            .map_err(chain_error)
    }
}

#[async_trait]
impl ContractFactory for RpcContractFactory {
    async fn deploy(&self, contract: &str, args: &[Value]) -> Result<DeployedContract, FactoryError> {
        let rejected = |reason: String| FactoryError::Rejected {
            contract: contract.to_owned(),
            reason,
        };
        let init_code = self
            .artifacts
            .artifact(contract)
            .and_then(|artifact| artifact.init_code(args))
            .map_err(|e| rejected(e.to_string()))?;
        let chain_id = self
            .cached_chain_id()
            .await
            .map_err(|e| rejected(e.to_string()))?;

        // Held until the receipt arrives so creations never overlap.
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self
                .client
                .get_nonce(self.signer.address())
                .await
                .map_err(|e| rejected(e.to_string()))?,
        };

        let tx_hash = match self
            .client
            .send_create_transaction(&self.signer, chain_id, nonce, init_code)
            .await
        {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                // Refetch next time, the node's view may differ from ours.
                *next_nonce = None;
                return Err(rejected(err.to_string()));
            }
        };
        *next_nonce = Some(nonce + 1);
        info!(contract, nonce, tx_hash = %format!("{tx_hash:#x}"), "Creation transaction sent");

        let receipt = match self.client.wait_for_transaction_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(err) => {
                warn!(contract, %err, "No receipt for creation transaction");
                return Err(FactoryError::Timeout {
                    contract: contract.to_owned(),
                    tx_hash: Some(tx_hash),
                });
            }
        };
        if !receipt.status {
            return Err(FactoryError::Reverted {
                contract: contract.to_owned(),
                tx_hash,
            });
        }
        let address = receipt
            .contract_address
            .unwrap_or_else(|| calculate_create_address(self.signer.address(), nonce));
        Ok(DeployedContract { address, tx_hash })
    }
}
