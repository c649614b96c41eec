//! Minimal RLP encoder.
//!
//! Only the encoding direction is needed: contract address derivation hashes
//! `rlp([sender, nonce])` and signed transactions are submitted RLP-encoded.

use bytes::{BufMut, Bytes};
use ethereum_types::{Address, H256, U256};

const RLP_NULL: u8 = 0x80;
const RLP_EMPTY_LIST: u8 = 0xc0;

pub trait RLPEncode {
    fn encode(&self, buf: &mut dyn BufMut);

    fn length(&self) -> usize {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf.len()
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        buf
    }
}

/// Writes the header of a string or list payload of `payload_len` bytes.
fn encode_length(payload_len: usize, short_offset: u8, buf: &mut dyn BufMut) {
    if payload_len <= 55 {
        // payload_len fits in a single byte here
        buf.put_u8(short_offset + payload_len as u8);
    } else {
        let be = (payload_len as u64).to_be_bytes();
        let len_bytes = trimmed_be_bytes(&be);
        buf.put_u8(short_offset + 55 + len_bytes.len() as u8);
        buf.put_slice(len_bytes);
    }
}

fn trimmed_be_bytes(bytes: &[u8]) -> &[u8] {
    let first_non_zero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first_non_zero..]
}

pub fn encode_bytes(value: &[u8], buf: &mut dyn BufMut) {
    if let [single] = value
        && *single < RLP_NULL
    {
        buf.put_u8(*single);
        return;
    }
    encode_length(value.len(), RLP_NULL, buf);
    buf.put_slice(value);
}

/// Wraps an already-encoded sequence of items into a list.
pub fn encode_list_payload(payload: &[u8], buf: &mut dyn BufMut) {
    encode_length(payload.len(), RLP_EMPTY_LIST, buf);
    buf.put_slice(payload);
}

impl RLPEncode for u8 {
    fn encode(&self, buf: &mut dyn BufMut) {
        u64::from(*self).encode(buf)
    }
}

impl RLPEncode for bool {
    fn encode(&self, buf: &mut dyn BufMut) {
        u8::from(*self).encode(buf)
    }
}

impl RLPEncode for u64 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(trimmed_be_bytes(&self.to_be_bytes()), buf)
    }
}

impl RLPEncode for U256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        let bytes = self.to_big_endian();
        encode_bytes(trimmed_be_bytes(&bytes), buf)
    }
}

impl RLPEncode for Address {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl RLPEncode for H256 {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl RLPEncode for [u8] {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf)
    }
}

impl RLPEncode for Bytes {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self, buf)
    }
}

impl RLPEncode for str {
    fn encode(&self, buf: &mut dyn BufMut) {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl<T: RLPEncode> RLPEncode for Vec<T> {
    fn encode(&self, buf: &mut dyn BufMut) {
        let mut payload = Vec::new();
        for item in self {
            item.encode(&mut payload);
        }
        encode_list_payload(&payload, buf);
    }
}

impl<T: RLPEncode + ?Sized> RLPEncode for &T {
    fn encode(&self, buf: &mut dyn BufMut) {
        (*self).encode(buf)
    }
}

/// Encodes heterogeneous fields as a single RLP list.
///
/// ```
/// use deploykit_common::{Address, rlp::Encoder};
///
/// let mut buf = Vec::new();
/// Encoder::new(&mut buf)
///     .encode_field(&Address::zero())
///     .encode_field(&7u64)
///     .finish();
/// assert_eq!(buf[0], 0xc0 + 22);
/// ```
pub struct Encoder<'a> {
    buf: &'a mut dyn BufMut,
    payload: Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut dyn BufMut) -> Self {
        Self {
            buf,
            payload: Vec::new(),
        }
    }

    pub fn encode_field<T: RLPEncode + ?Sized>(mut self, value: &T) -> Self {
        value.encode(&mut self.payload);
        self
    }

    /// Appends bytes that are already RLP-encoded, such as a nested list.
    pub fn encode_raw(mut self, encoded: &[u8]) -> Self {
        self.payload.extend_from_slice(encoded);
        self
    }

    pub fn finish(self) {
        encode_list_payload(&self.payload, self.buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encodes_short_strings() {
        assert_eq!("dog".encode_to_vec(), vec![0x83, b'd', b'o', b'g']);
        assert_eq!("".encode_to_vec(), vec![0x80]);
        assert_eq!([0x7fu8].as_slice().encode_to_vec(), vec![0x7f]);
        assert_eq!([0x80u8].as_slice().encode_to_vec(), vec![0x81, 0x80]);
    }

    #[test]
    fn encodes_long_strings() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipisicing elit";
        let encoded = text.encode_to_vec();
        assert_eq!(&encoded[..2], &[0xb8, 0x38]);
        assert_eq!(&encoded[2..], text.as_bytes());
    }

    #[test]
    fn encodes_long_payload_headers() {
        // 1024 bytes needs a two byte length
        let blob = vec![0xaau8; 1024];
        let encoded = blob.as_slice().encode_to_vec();
        assert_eq!(&encoded[..3], &[0xb9, 0x04, 0x00]);
        assert_eq!(encoded.len(), 3 + 1024);

        let words = vec!["abcdefghij"; 6];
        let encoded = words.encode_to_vec();
        assert_eq!(&encoded[..2], &[0xf8, 66]);
        assert_eq!(encoded.len(), 2 + 66);
    }

    #[test]
    fn encodes_integers() {
        assert_eq!(0u64.encode_to_vec(), vec![0x80]);
        assert_eq!(15u64.encode_to_vec(), vec![0x0f]);
        assert_eq!(1024u64.encode_to_vec(), vec![0x82, 0x04, 0x00]);
        assert_eq!(U256::from(1024).encode_to_vec(), vec![0x82, 0x04, 0x00]);
        assert_eq!(U256::zero().encode_to_vec(), vec![0x80]);
    }

    #[test]
    fn encodes_lists() {
        let empty: Vec<u64> = vec![];
        assert_eq!(empty.encode_to_vec(), vec![0xc0]);

        let pets = vec!["cat", "dog"];
        assert_eq!(
            pets.encode_to_vec(),
            hex!("c88363617483646f67").to_vec()
        );
    }

    #[test]
    fn encoder_matches_vec_encoding() {
        let mut from_encoder = Vec::new();
        Encoder::new(&mut from_encoder)
            .encode_field("cat")
            .encode_field("dog")
            .finish();
        assert_eq!(from_encoder, vec!["cat", "dog"].encode_to_vec());
    }
}
