pub mod eth;
pub mod etherscan;

use std::time::Duration;

use deploykit_common::H256;

pub use eth::{EthClient, RpcConfig, RpcReceipt};
pub use etherscan::{EtherscanClient, EtherscanResponse, VerifySourceRequest};

use crate::signer::SignerError;

#[derive(Debug, thiserror::Error)]
pub enum EthClientError {
    #[error("{method} request to {url} failed: {source}")]
    Transport {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} returned error {code}: {message}")]
    RpcError {
        method: String,
        code: i32,
        message: String,
        data: Option<String>,
    },
    #[error("{method} response could not be parsed: {cause}")]
    ParseError { method: String, cause: String },
    #[error("Gas estimation reverted: {0}")]
    EstimateReverted(String),
    #[error("Transaction {tx_hash:#x} was not mined within {waited:?}")]
    ReceiptTimeout { tx_hash: H256, waited: Duration },
    #[error("Failed to sign transaction: {0}")]
    Signer(#[from] SignerError),
    #[error("{0}")]
    Custom(String),
}
