//! JSON-RPC envelope types and decoding helpers shared by the clients.

use deploykit_common::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clients::EthClientError;

/// JSON-RPC request identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RpcRequestId {
    Number(u64),
    String(String),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcRequest {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub method: String,
    pub params: Option<Vec<Value>>,
}

impl RpcRequest {
    pub fn new(method: &str, params: Option<Vec<Value>>) -> Self {
        RpcRequest {
            id: RpcRequestId::Number(1),
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcErrorMetadata {
    pub code: i32,
    /// Revert data for `execution reverted` errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcSuccessResponse {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub result: Value,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RpcErrorResponse {
    pub id: RpcRequestId,
    pub jsonrpc: String,
    pub error: RpcErrorMetadata,
}

/// A JSON-RPC 2.0 response, either success or error.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum RpcResponse {
    Success(RpcSuccessResponse),
    Error(RpcErrorResponse),
}

/// Decodes the `Error(string)` payload of a revert, if there is one.
pub fn get_message_from_revert_data(data: &str) -> Result<String, EthClientError> {
    if data == "0x" {
        return Ok("Execution reverted without a reason string.".to_owned());
    }
    // Bare 4 byte custom error selector.
    if data.len() == 10 {
        return Ok(data.to_owned());
    }
    let decoded = deploykit_common::utils::decode_hex(data)
        .map_err(|e| EthClientError::Custom(format!("Invalid revert data {data}: {e}")))?;
    let truncated = || EthClientError::Custom(format!("Truncated revert data {data}"));
    let length = U256::from_big_endian(decoded.get(36..68).ok_or_else(truncated)?);
    if length > U256::from(decoded.len()) {
        return Err(truncated());
    }
    let message = decoded
        .get(68..68 + length.as_usize())
        .ok_or_else(truncated)?;
    String::from_utf8(message.to_vec())
        .map_err(|_| EthClientError::Custom(format!("Revert reason is not UTF-8: {data}")))
}

pub fn parse_json_hex(hex: &Value) -> Result<u64, String> {
    if let Value::String(maybe_hex) = hex {
        let trimmed = maybe_hex.trim_start_matches("0x");
        u64::from_str_radix(trimmed, 16).map_err(|_| format!("Could not parse given hex {maybe_hex}"))
    } else {
        Err(format!("Could not parse given hex {hex}"))
    }
}

pub fn parse_json_u256(value: &Value) -> Result<U256, String> {
    let s = value
        .as_str()
        .ok_or_else(|| format!("Expected hex string, got {value}"))?;
    U256::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("Could not parse given hex {s}: {e}"))
}

pub fn parse_json_h256(value: &Value) -> Result<H256, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid hash {value}: {e}"))
}

pub fn parse_json_address(value: &Value) -> Result<Address, String> {
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid address {value}: {e}"))
}
