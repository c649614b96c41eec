//! Durable, per-network record of deployed contracts.

pub mod error;
pub mod ledger;

pub use error::LedgerError;
pub use ledger::{DeploymentLedger, DeploymentRecord};
