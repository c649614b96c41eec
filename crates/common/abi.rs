//! ABI values used as constructor arguments.
//!
//! Values are persisted with an explicit type tag so that a ledger written to
//! disk reads back identically (`"1000"` as a `uint` and `"1000"` as a
//! `string` stay distinct). Untagged JSON values, as found in ledgers written
//! by older tooling, are still accepted when reading.

use std::fmt;

use bytes::Bytes;
use ethereum_types::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, de::Error as _};

use crate::serde_utils::{bytes_hex, u256_dec};

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Value {
    Address(Address),
    Uint(#[serde(with = "u256_dec")] U256),
    /// Two's complement representation.
    Int(#[serde(with = "u256_dec")] U256),
    Bool(bool),
    String(String),
    Bytes(#[serde(with = "bytes_hex")] Bytes),
    FixedBytes(#[serde(with = "bytes_hex")] Bytes),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("fixed bytes value is {0} bytes long, at most 32 are allowed")]
    FixedBytesTooLong(usize),
}

/// Same layout as [`Value`]'s serialized form.
#[derive(Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
enum Tagged {
    Address(Address),
    Uint(#[serde(with = "u256_dec")] U256),
    Int(#[serde(with = "u256_dec")] U256),
    Bool(bool),
    String(String),
    Bytes(#[serde(with = "bytes_hex")] Bytes),
    FixedBytes(#[serde(with = "bytes_hex")] Bytes),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

impl From<Tagged> for Value {
    fn from(tagged: Tagged) -> Self {
        match tagged {
            Tagged::Address(v) => Value::Address(v),
            Tagged::Uint(v) => Value::Uint(v),
            Tagged::Int(v) => Value::Int(v),
            Tagged::Bool(v) => Value::Bool(v),
            Tagged::String(v) => Value::String(v),
            Tagged::Bytes(v) => Value::Bytes(v),
            Tagged::FixedBytes(v) => Value::FixedBytes(v),
            Tagged::Array(v) => Value::Array(v),
            Tagged::Tuple(v) => Value::Tuple(v),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let is_tagged = raw
            .as_object()
            .is_some_and(|o| o.len() == 2 && o.contains_key("type") && o.contains_key("value"));
        if is_tagged {
            return serde_json::from_value::<Tagged>(raw)
                .map(Value::from)
                .map_err(D::Error::custom);
        }
        Value::from_untagged(raw).map_err(D::Error::custom)
    }
}

impl Value {
    /// Best-effort typing of a plain JSON value.
    ///
    /// Strings holding a 20-byte hex address become addresses, other hex
    /// strings become bytes and strings of decimal digits become uints.
    /// Negative numbers become two's complement ints.
    pub fn from_untagged(raw: serde_json::Value) -> Result<Self, String> {
        match raw {
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Ok(Value::Uint(U256::from(v)))
                } else if let Some(v) = n.as_i64() {
                    let magnitude = U256::from(v.unsigned_abs());
                    Ok(Value::Int((!magnitude).overflowing_add(U256::one()).0))
                } else {
                    Err(format!("{n} is not an integer"))
                }
            }
            serde_json::Value::String(s) => Ok(Self::from_untagged_str(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(Self::from_untagged)
                .collect::<Result<_, _>>()
                .map(Value::Array),
            // ethers v5 BigNumber
            serde_json::Value::Object(o)
                if o.get("type").and_then(|t| t.as_str()) == Some("BigNumber") =>
            {
                o.get("hex")
                    .and_then(|h| h.as_str())
                    .ok_or_else(|| "BigNumber without hex".to_owned())
                    .and_then(u256_dec::parse)
                    .map(Value::Uint)
            }
            other => Err(format!("unsupported constructor argument {other}")),
        }
    }

    fn from_untagged_str(s: String) -> Self {
        if let Some(hex) = s.strip_prefix("0x")
            && let Ok(bytes) = hex::decode(hex)
        {
            return if bytes.len() == 20 {
                Value::Address(Address::from_slice(&bytes))
            } else {
                Value::Bytes(Bytes::from(bytes))
            };
        }
        if !s.is_empty()
            && s.bytes().all(|b| b.is_ascii_digit())
            && let Ok(v) = U256::from_dec_str(&s)
        {
            return Value::Uint(v);
        }
        Value::String(s)
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Value::Bytes(_) | Value::String(_) | Value::Array(_) => true,
            Value::Tuple(items) => items.iter().any(Value::is_dynamic),
            _ => false,
        }
    }

    /// Size of the value inside the head section of its enclosing tuple.
    fn head_size(&self) -> usize {
        match self {
            Value::Tuple(items) if !self.is_dynamic() => items.iter().map(Value::head_size).sum(),
            _ => WORD,
        }
    }
}

impl From<Address> for Value {
    fn from(address: Address) -> Self {
        Value::Address(address)
    }
}

impl From<U256> for Value {
    fn from(value: U256) -> Self {
        Value::Uint(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Uint(U256::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Address(address) => write!(f, "{address:#x}"),
            Value::Uint(value) => write!(f, "{value}"),
            Value::Int(value) => {
                if value.bit(255) {
                    let magnitude = (!*value).overflowing_add(U256::one()).0;
                    write!(f, "-{magnitude}")
                } else {
                    write!(f, "{value}")
                }
            }
            Value::Bool(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value}"),
            Value::Bytes(value) | Value::FixedBytes(value) => {
                write!(f, "0x{}", hex::encode(value))
            }
            Value::Array(items) | Value::Tuple(items) => {
                let (open, close) = if matches!(self, Value::Array(_)) {
                    ("[", "]")
                } else {
                    ("(", ")")
                };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
        }
    }
}

/// ABI-encodes `values` as the argument tuple of a constructor call.
///
/// The result is what gets appended to creation bytecode, and what explorers
/// expect as "constructor arguments".
pub fn encode(values: &[Value]) -> Result<Vec<u8>, AbiError> {
    encode_tuple(values)
}

fn encode_tuple(values: &[Value]) -> Result<Vec<u8>, AbiError> {
    let heads_len: usize = values.iter().map(Value::head_size).sum();
    let mut head = Vec::with_capacity(heads_len);
    let mut tail = Vec::new();

    for value in values {
        if value.is_dynamic() {
            head.extend_from_slice(&word(U256::from(heads_len + tail.len())));
            tail.extend(encode_value(value)?);
        } else {
            head.extend(encode_value(value)?);
        }
    }

    head.extend(tail);
    Ok(head)
}

fn encode_value(value: &Value) -> Result<Vec<u8>, AbiError> {
    let encoded = match value {
        Value::Address(address) => {
            let mut out = vec![0u8; WORD];
            out[WORD - 20..].copy_from_slice(address.as_bytes());
            out
        }
        Value::Uint(value) | Value::Int(value) => word(*value).to_vec(),
        Value::Bool(value) => word(U256::from(u8::from(*value))).to_vec(),
        Value::FixedBytes(bytes) => {
            if bytes.len() > WORD {
                return Err(AbiError::FixedBytesTooLong(bytes.len()));
            }
            let mut out = vec![0u8; WORD];
            out[..bytes.len()].copy_from_slice(bytes);
            out
        }
        Value::Bytes(bytes) => encode_dynamic_bytes(bytes),
        Value::String(s) => encode_dynamic_bytes(s.as_bytes()),
        Value::Array(items) => {
            let mut out = word(U256::from(items.len())).to_vec();
            out.extend(encode_tuple(items)?);
            out
        }
        Value::Tuple(items) => encode_tuple(items)?,
    };
    Ok(encoded)
}

fn encode_dynamic_bytes(bytes: &[u8]) -> Vec<u8> {
    let padded_len = bytes.len().div_ceil(WORD) * WORD;
    let mut out = word(U256::from(bytes.len())).to_vec();
    out.extend_from_slice(bytes);
    out.resize(WORD + padded_len, 0);
    out
}

fn word(value: U256) -> [u8; WORD] {
    value.to_big_endian()
}
