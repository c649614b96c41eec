//! Deterministic contract addresses for `CREATE` deployments.

use ethereum_types::Address;
use serde::{Deserialize, Serialize};

use crate::rlp::Encoder;
use crate::utils::keccak;

/// Address of the contract created by `sender` with account nonce `nonce`:
/// the last 20 bytes of `keccak256(rlp([sender, nonce]))`.
pub fn calculate_create_address(sender: Address, nonce: u64) -> Address {
    let mut encoded = Vec::new();
    Encoder::new(&mut encoded)
        .encode_field(&sender)
        .encode_field(&nonce)
        .finish();
    Address::from_slice(&keccak(&encoded).as_bytes()[12..])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictedAddress {
    pub address: Address,
    pub nonce: u64,
}

/// Predicts addresses relative to a nonce snapshot taken once per run.
///
/// Offsets are counted from the snapshot, so offset `n` is the address of
/// the `n`-th creation transaction the sender submits after it was taken.
#[derive(Debug, Clone, Copy)]
pub struct AddressPredictor {
    sender: Address,
    base_nonce: u64,
}

impl AddressPredictor {
    pub fn new(sender: Address, base_nonce: u64) -> Self {
        Self { sender, base_nonce }
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn base_nonce(&self) -> u64 {
        self.base_nonce
    }

    pub fn predict(&self, offset: u64) -> PredictedAddress {
        let nonce = self.base_nonce.saturating_add(offset);
        PredictedAddress {
            address: calculate_create_address(self.sender, nonce),
            nonce,
        }
    }
}
