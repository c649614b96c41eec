use std::time::Duration;

use bytes::Bytes;
use deploykit_common::{Address, H256, U256};
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::{
    signer::Signer,
    types::Eip1559Transaction,
    utils::{
        RpcRequest, RpcResponse, get_message_from_revert_data, parse_json_address,
        parse_json_h256, parse_json_hex, parse_json_u256,
    },
};

use super::EthClientError;

/// Retry and polling behaviour of an [`EthClient`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempts for requests that fail at the transport level.
    pub max_retries: u32,
    /// Backoff before the first retry, doubled on every further one.
    pub base_backoff: Duration,
    /// Interval between `eth_getTransactionReceipt` polls.
    pub receipt_poll_interval: Duration,
    /// How long to wait for a transaction to be mined.
    pub receipt_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
            receipt_poll_interval: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReceipt {
    pub tx_hash: H256,
    pub status: bool,
    pub contract_address: Option<Address>,
    pub block_number: u64,
    pub gas_used: u64,
}

impl RpcReceipt {
    fn from_json(value: &Value) -> Result<Self, String> {
        let field = |name: &str| {
            value
                .get(name)
                .ok_or_else(|| format!("receipt is missing {name}"))
        };
        let contract_address = match value.get("contractAddress") {
            None | Some(Value::Null) => None,
            Some(address) => Some(parse_json_address(address)?),
        };
        Ok(Self {
            tx_hash: parse_json_h256(field("transactionHash")?)?,
            status: parse_json_hex(field("status")?)? == 1,
            contract_address,
            block_number: parse_json_hex(field("blockNumber")?)?,
            gas_used: parse_json_hex(field("gasUsed")?)?,
        })
    }
}

/// Async JSON-RPC client for the handful of `eth_` methods a deployer needs.
#[derive(Debug, Clone)]
pub struct EthClient {
    client: Client,
    url: Url,
    config: RpcConfig,
}

impl EthClient {
    pub fn new(url: Url) -> Result<Self, EthClientError> {
        Self::with_config(url, RpcConfig::default())
    }

    pub fn with_config(url: Url, config: RpcConfig) -> Result<Self, EthClientError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EthClientError::Custom(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url,
            config,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    async fn send_request(&self, request: &RpcRequest) -> Result<RpcResponse, reqwest::Error> {
        self.client
            .post(self.url.as_str())
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await?
            .json::<RpcResponse>()
            .await
    }

    /// Sends `method`, retrying transport failures with exponential backoff.
    /// JSON-RPC errors are returned as is.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, EthClientError> {
        let request = RpcRequest::new(method, Some(params));
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_request(&request).await {
                Ok(RpcResponse::Success(response)) => return Ok(response.result),
                Ok(RpcResponse::Error(response)) => {
                    let data = match &response.error.data {
                        Some(Value::String(data)) => Some(data.clone()),
                        _ => None,
                    };
                    return Err(EthClientError::RpcError {
                        method: method.to_owned(),
                        code: response.error.code,
                        message: response.error.message,
                        data,
                    });
                }
                Err(err) if attempt < max_attempts && (err.is_connect() || err.is_timeout()) => {
                    let backoff = self.config.base_backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(method, attempt, %err, ?backoff, "RPC request failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(EthClientError::Transport {
                        method: method.to_owned(),
                        url: self.url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    fn parse<T>(method: &str, result: Result<T, String>) -> Result<T, EthClientError> {
        result.map_err(|cause| EthClientError::ParseError {
            method: method.to_owned(),
            cause,
        })
    }

    pub async fn get_chain_id(&self) -> Result<u64, EthClientError> {
        let result = self.call("eth_chainId", vec![]).await?;
        Self::parse("eth_chainId", parse_json_hex(&result))
    }

    /// Transaction count including the pending block.
    pub async fn get_nonce(&self, address: Address) -> Result<u64, EthClientError> {
        let result = self
            .call(
                "eth_getTransactionCount",
                vec![json!(format!("{address:#x}")), json!("pending")],
            )
            .await?;
        Self::parse("eth_getTransactionCount", parse_json_hex(&result))
    }

    pub async fn get_gas_price(&self) -> Result<U256, EthClientError> {
        let result = self.call("eth_gasPrice", vec![]).await?;
        Self::parse("eth_gasPrice", parse_json_u256(&result))
    }

    /// Suggested tip. Nodes without `eth_maxPriorityFeePerGas` get 1 gwei.
    pub async fn get_max_priority_fee(&self) -> Result<U256, EthClientError> {
        match self.call("eth_maxPriorityFeePerGas", vec![]).await {
            Ok(result) => Self::parse("eth_maxPriorityFeePerGas", parse_json_u256(&result)),
            Err(EthClientError::RpcError { code: -32601, .. }) => Ok(U256::from(1_000_000_000u64)),
            Err(err) => Err(err),
        }
    }

    /// Estimates a contract creation from `from` with `data` as init code.
    pub async fn estimate_create_gas(
        &self,
        from: Address,
        data: &[u8],
    ) -> Result<u64, EthClientError> {
        let tx = json!({
            "from": format!("{from:#x}"),
            "data": format!("0x{}", hex::encode(data)),
        });
        match self.call("eth_estimateGas", vec![tx]).await {
            Ok(result) => Self::parse("eth_estimateGas", parse_json_hex(&result)),
            Err(EthClientError::RpcError {
                message,
                data: Some(data),
                ..
            }) if message.contains("revert") => Err(EthClientError::EstimateReverted(
                get_message_from_revert_data(&data).unwrap_or(data),
            )),
            Err(err) => Err(err),
        }
    }

    pub async fn send_raw_transaction(&self, encoded: &[u8]) -> Result<H256, EthClientError> {
        let result = self
            .call(
                "eth_sendRawTransaction",
                vec![json!(format!("0x{}", hex::encode(encoded)))],
            )
            .await?;
        Self::parse("eth_sendRawTransaction", parse_json_h256(&result))
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<RpcReceipt>, EthClientError> {
        let result = self
            .call(
                "eth_getTransactionReceipt",
                vec![json!(format!("{tx_hash:#x}"))],
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        Self::parse("eth_getTransactionReceipt", RpcReceipt::from_json(&result)).map(Some)
    }

    /// Polls until `tx_hash` is mined or the configured timeout elapses.
    pub async fn wait_for_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<RpcReceipt, EthClientError> {
        let deadline = tokio::time::Instant::now() + self.config.receipt_timeout;
        loop {
            if let Some(receipt) = self.get_transaction_receipt(tx_hash).await? {
                return Ok(receipt);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EthClientError::ReceiptTimeout {
                    tx_hash,
                    waited: self.config.receipt_timeout,
                });
            }
            debug!(tx_hash = %format!("{tx_hash:#x}"), "Receipt not available yet");
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    /// Builds, signs and submits a contract creation with `init_code`.
    ///
    /// `nonce` is taken as given so that callers stay in control of the
    /// account's nonce sequence.
    pub async fn send_create_transaction(
        &self,
        signer: &Signer,
        chain_id: u64,
        nonce: u64,
        init_code: Bytes,
    ) -> Result<H256, EthClientError> {
        let gas_limit = self.estimate_create_gas(signer.address(), &init_code).await?;
        let gas_price = self.get_gas_price().await?;
        let max_priority_fee_per_gas = self.get_max_priority_fee().await?.min(gas_price);
        let tx = Eip1559Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas,
            max_fee_per_gas: gas_price.saturating_mul(U256::from(2)),
            // 20% over the estimate.
            gas_limit: gas_limit.saturating_add(gas_limit / 5),
            to: None,
            value: U256::zero(),
            data: init_code,
        };
        let signed = tx.sign(signer)?;
        self.send_raw_transaction(&signed).await
    }
}
