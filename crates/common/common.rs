pub use ethereum_types::{Address, H160, H256, U256};

pub mod abi;
pub mod address;
pub mod rlp;
pub mod serde_utils;

pub mod utils {
    use ethereum_types::H256;
    use sha3::{Digest, Keccak256};

    pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
        H256::from_slice(&Keccak256::digest(data.as_ref()))
    }

    /// Decodes a hex string with or without the `0x` prefix.
    pub fn decode_hex(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(s.trim().strip_prefix("0x").unwrap_or(s.trim()))
    }
}
