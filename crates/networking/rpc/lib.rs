//! Ethereum JSON-RPC and block explorer clients used by the deployer.

pub mod clients;
pub mod signer;
pub mod types;
pub mod utils;

pub use clients::{
    EthClient, EthClientError, EtherscanClient, EtherscanResponse, RpcConfig, RpcReceipt,
    VerifySourceRequest,
};
pub use signer::{Signature, Signer, SignerError};
pub use types::Eip1559Transaction;
