use bytes::Bytes;
use deploykit_common::{
    Address, H256, U256,
    rlp::Encoder,
    utils::keccak,
};

use crate::signer::{Signature, Signer, SignerError};

const EIP1559_TX_TYPE: u8 = 0x02;

/// Typed (EIP-1559) transaction. `to: None` is a contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    pub gas_limit: u64,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
}

impl Eip1559Transaction {
    fn encode_fields<'a>(&self, encoder: Encoder<'a>) -> Encoder<'a> {
        let encoder = encoder
            .encode_field(&self.chain_id)
            .encode_field(&self.nonce)
            .encode_field(&self.max_priority_fee_per_gas)
            .encode_field(&self.max_fee_per_gas)
            .encode_field(&self.gas_limit);
        let encoder = match &self.to {
            Some(to) => encoder.encode_field(to),
            None => encoder.encode_field(&[] as &[u8]),
        };
        encoder
            .encode_field(&self.value)
            .encode_field(&self.data)
            // Empty access list.
            .encode_field(&Vec::<u64>::new())
    }

    /// `keccak256(0x02 || rlp([chain_id, ..., access_list]))`.
    pub fn signing_hash(&self) -> H256 {
        let mut buf = vec![EIP1559_TX_TYPE];
        self.encode_fields(Encoder::new(&mut buf)).finish();
        keccak(buf)
    }

    /// Envelope ready for `eth_sendRawTransaction`.
    pub fn encode_signed(&self, signature: &Signature) -> Vec<u8> {
        let mut buf = vec![EIP1559_TX_TYPE];
        self.encode_fields(Encoder::new(&mut buf))
            .encode_field(&signature.y_parity)
            .encode_field(&signature.r)
            .encode_field(&signature.s)
            .finish();
        buf
    }

    pub fn sign(&self, signer: &Signer) -> Result<Vec<u8>, SignerError> {
        let signature = signer.sign_hash(self.signing_hash())?;
        Ok(self.encode_signed(&signature))
    }
}

/// Hash under which a signed envelope is known to the network.
pub fn transaction_hash(encoded: &[u8]) -> H256 {
    keccak(encoded)
}
