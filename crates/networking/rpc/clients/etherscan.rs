//! Client for the contract verification endpoints of Etherscan-compatible
//! explorers (Etherscan, Blockscout).
//!
//! Responses are returned as received. Interpreting their text is left to
//! the caller.

use deploykit_common::Address;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::EthClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifySourceRequest {
    pub address: Address,
    /// Fully qualified `path/File.sol:Name`.
    pub contract_name: String,
    /// Long compiler version, e.g. `v0.8.24+commit.e11b9ed9`.
    pub compiler_version: String,
    /// Solidity standard JSON input.
    pub source_code: String,
    /// ABI-encoded constructor arguments.
    pub constructor_arguments: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EtherscanResponse {
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub result: Value,
}

impl EtherscanResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "1"
    }

    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtherscanClient {
    client: Client,
    api_url: Url,
    api_key: Option<String>,
}

impl EtherscanClient {
    pub fn new(api_url: Url, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_url,
            api_key,
        }
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    /// `module=contract&action=verifysourcecode`. A successful submission
    /// carries the GUID to poll in `result`.
    pub async fn verify_source_code(
        &self,
        request: &VerifySourceRequest,
    ) -> Result<EtherscanResponse, EthClientError> {
        let address = format!("{:#x}", request.address);
        let constructor_arguments = hex::encode(&request.constructor_arguments);
        let mut form = vec![
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", request.source_code.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", request.contract_name.as_str()),
            ("compilerversion", request.compiler_version.as_str()),
            // Misspelled in the explorer API itself.
            ("constructorArguements", constructor_arguments.as_str()),
        ];
        if let Some(key) = &self.api_key {
            form.push(("apikey", key.as_str()));
        }
        debug!(address, contract = %request.contract_name, "Submitting source for verification");

        let response = self
            .client
            .post(self.api_url.as_str())
            .form(&form)
            .send()
            .await
            .map_err(|e| self.transport_error("verifysourcecode", e))?;
        self.decode("verifysourcecode", response).await
    }

    /// `module=contract&action=checkverifystatus`.
    pub async fn check_verify_status(&self, guid: &str) -> Result<EtherscanResponse, EthClientError> {
        let mut query = vec![
            ("module", "contract"),
            ("action", "checkverifystatus"),
            ("guid", guid),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.as_str()));
        }
        let response = self
            .client
            .get(self.api_url.as_str())
            .query(&query)
            .send()
            .await
            .map_err(|e| self.transport_error("checkverifystatus", e))?;
        self.decode("checkverifystatus", response).await
    }

    fn transport_error(&self, action: &str, source: reqwest::Error) -> EthClientError {
        EthClientError::Transport {
            method: action.to_owned(),
            url: self.api_url.to_string(),
            source,
        }
    }

    async fn decode(
        &self,
        action: &str,
        response: reqwest::Response,
    ) -> Result<EtherscanResponse, EthClientError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(action, e))?;
        serde_json::from_str(&body).map_err(|e| EthClientError::ParseError {
            method: action.to_owned(),
            cause: format!("HTTP {status}: {e}: {body}"),
        })
    }
}
