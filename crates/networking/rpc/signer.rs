use deploykit_common::{Address, H256, U256, utils::keccak};
use secp256k1::{Message, SecretKey};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),
    #[error("Signing failed: {0}")]
    Secp256k1(#[from] secp256k1::Error),
}

/// Recoverable ECDSA signature split into its transaction fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub y_parity: bool,
    pub r: U256,
    pub s: U256,
}

/// Local private key signer.
#[derive(Clone)]
pub struct Signer {
    secret_key: SecretKey,
    address: Address,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(secret_key: SecretKey) -> Self {
        let public = secret_key.public_key(secp256k1::SECP256K1);
        let hash = keccak(&public.serialize_uncompressed()[1..]);
        Self {
            secret_key,
            address: Address::from_slice(&hash[12..]),
        }
    }

    /// Parses a hex private key, with or without `0x`.
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let bytes = deploykit_common::utils::decode_hex(private_key)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self::new(secret_key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign_hash(&self, hash: H256) -> Result<Signature, SignerError> {
        let (recovery_id, signature) = secp256k1::SECP256K1
            .sign_ecdsa_recoverable(&Message::from_digest(hash.to_fixed_bytes()), &self.secret_key)
            .serialize_compact();
        let y_parity = match Into::<i32>::into(recovery_id) {
            0 => false,
            1 => true,
            _ => return Err(SignerError::Secp256k1(secp256k1::Error::InvalidRecoveryId)),
        };
        Ok(Signature {
            y_parity,
            r: U256::from_big_endian(&signature[..32]),
            s: U256::from_big_endian(&signature[32..]),
        })
    }
}

#[cfg(test)]
pub(crate) fn recover_address(signature: &Signature, hash: H256) -> Result<Address, secp256k1::Error> {
    use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};

    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(&signature.r.to_big_endian());
    compact[32..].copy_from_slice(&signature.s.to_big_endian());
    let signature = RecoverableSignature::from_compact(
        &compact,
        RecoveryId::try_from(i32::from(signature.y_parity))?,
    )?;
    let public = secp256k1::SECP256K1
        .recover_ecdsa(&Message::from_digest(hash.to_fixed_bytes()), &signature)?;
    let hash = keccak(&public.serialize_uncompressed()[1..]);
    Ok(Address::from_slice(&hash[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn derives_address_from_private_key() {
        let signer = Signer::from_hex(KEY).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            signer.address(),
            Address::from(hex!("2c7536e3605d9c16a7a3d7b1898e529396a65c23"))
        );
        let without_prefix = Signer::from_hex(KEY.trim_start_matches("0x"))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(without_prefix.address(), signer.address());
    }

    #[test]
    fn signature_recovers_to_signer() {
        let signer = Signer::from_hex(KEY).unwrap_or_else(|e| panic!("{e}"));
        let hash = keccak(b"deploykit");
        let signature = signer.sign_hash(hash).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(recover_address(&signature, hash).ok(), Some(signer.address()));
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(matches!(Signer::from_hex("0x1234"), Err(SignerError::InvalidKey(_))));
        assert!(matches!(Signer::from_hex("not hex"), Err(SignerError::InvalidKey(_))));
        assert!(matches!(
            Signer::from_hex(&format!("0x{}", "00".repeat(32))),
            Err(SignerError::InvalidKey(_))
        ));
    }
}
