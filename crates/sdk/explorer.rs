//! [`Explorer`] backed by an Etherscan-compatible verification API.

use std::time::Duration;

use async_trait::async_trait;
use deploykit_common::abi;
use deploykit_deployer::{Explorer, ExplorerError, ExplorerOutcome, VerificationRequest};
use deploykit_rpc::{EtherscanClient, EtherscanResponse, VerifySourceRequest};
use tracing::{debug, info};

use crate::artifacts::{ArtifactError, ArtifactIndex};

/// What an explorer response means for the submission it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// Submission accepted, poll the GUID for the result.
    Accepted { guid: String },
    Pending,
    Verified,
    AlreadyVerified,
    Ambiguous { candidates: Vec<String> },
    Transient(String),
    Rejected(String),
}

/// Interprets the text of an explorer response.
///
/// This is the only place where explorer wording is inspected.
pub fn classify_response(response: &EtherscanResponse) -> ResponseKind {
    let result = response.result_text();
    let text = format!("{} {}", response.message, result).to_lowercase();

    if text.contains("already verified") {
        return ResponseKind::AlreadyVerified;
    }
    if text.contains("more than one contract") {
        return ResponseKind::Ambiguous {
            candidates: contract_paths(&result),
        };
    }
    if text.contains("pending in queue") || text.contains("in progress") {
        return ResponseKind::Pending;
    }
    if text.contains("pass - verified") {
        return ResponseKind::Verified;
    }
    if text.contains("fail - unable to verify") {
        return ResponseKind::Rejected(result);
    }
    const TRANSIENT: [&str; 7] = [
        "rate limit",
        "max calls per sec",
        "too many",
        "try again",
        "temporarily unavailable",
        "timeout",
        "unable to locate contractcode",
    ];
    if TRANSIENT.iter().any(|needle| text.contains(needle)) {
        return ResponseKind::Transient(result);
    }
    if response.is_ok() {
        return ResponseKind::Accepted { guid: result };
    }
    ResponseKind::Rejected(if result.is_empty() {
        response.message.clone()
    } else {
        result
    })
}

/// Fully qualified `path/File.sol:Name` tokens found in `text`.
fn contract_paths(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '"' || c == '\'')
        .map(|token| token.trim_matches(|c: char| !(c.is_alphanumeric() || c == '_' || c == '@')))
        .filter(|token| token.contains(".sol:"))
        .map(str::to_owned)
        .collect()
}

#[derive(Debug, Clone)]
pub struct EtherscanExplorer {
    client: EtherscanClient,
    artifacts: ArtifactIndex,
    poll_interval: Duration,
    max_polls: u32,
}

impl EtherscanExplorer {
    pub fn new(client: EtherscanClient, artifacts: ArtifactIndex) -> Self {
        Self {
            client,
            artifacts,
            poll_interval: Duration::from_secs(5),
            max_polls: 12,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = poll_interval;
        self.max_polls = max_polls;
        self
    }

    fn source_request(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerifySourceRequest, ExplorerError> {
        let lookup = request.contract_path.as_deref().unwrap_or(&request.contract);
        let artifact = self.artifacts.artifact(lookup).map_err(artifact_error)?;
        let build_info = self.artifacts.build_info(lookup).map_err(artifact_error)?;
        let constructor_arguments = abi::encode(&request.constructor_args)
            .map_err(|e| ExplorerError::Rejected(e.to_string()))?;
        Ok(VerifySourceRequest {
            address: request.address,
            contract_name: artifact.fully_qualified_name(),
            compiler_version: build_info.compiler_version(),
            source_code: build_info.standard_json_input(),
            constructor_arguments,
        })
    }

    async fn poll(&self, name: &str, guid: &str) -> Result<ExplorerOutcome, ExplorerError> {
        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .check_verify_status(guid)
                .await
                .map_err(|e| ExplorerError::Transient(e.to_string()))?;
            match classify_response(&response) {
                ResponseKind::Pending | ResponseKind::Accepted { .. } => {
                    debug!(name, guid, poll, "Verification pending");
                }
                kind => return outcome(kind),
            }
        }
        Err(ExplorerError::Transient(format!(
            "verification {guid} still pending after {} polls",
            self.max_polls
        )))
    }
}

fn artifact_error(err: ArtifactError) -> ExplorerError {
    match err {
        ArtifactError::Ambiguous { candidates, .. } => {
            ExplorerError::AmbiguousBytecode { candidates }
        }
        other => ExplorerError::Rejected(other.to_string()),
    }
}

fn outcome(kind: ResponseKind) -> Result<ExplorerOutcome, ExplorerError> {
    match kind {
        ResponseKind::Verified => Ok(ExplorerOutcome::Verified),
        ResponseKind::AlreadyVerified => Ok(ExplorerOutcome::AlreadyVerified),
        ResponseKind::Ambiguous { candidates } => {
            Err(ExplorerError::AmbiguousBytecode { candidates })
        }
        ResponseKind::Transient(reason) => Err(ExplorerError::Transient(reason)),
        ResponseKind::Rejected(reason) => Err(ExplorerError::Rejected(reason)),
        ResponseKind::Pending | ResponseKind::Accepted { .. } => {
            Err(ExplorerError::Transient("verification still pending".to_owned()))
        }
    }
}

#[async_trait]
impl Explorer for EtherscanExplorer {
    async fn verify(&self, request: &VerificationRequest) -> Result<ExplorerOutcome, ExplorerError> {
        let source = self.source_request(request)?;
        let response = self
            .client
            .verify_source_code(&source)
            .await
            .map_err(|e| ExplorerError::Transient(e.to_string()))?;
        match classify_response(&response) {
            ResponseKind::Accepted { guid } => {
                info!(name = %request.name, contract = %source.contract_name, %guid, "Verification submitted");
                self.poll(&request.name, &guid).await
            }
            kind => outcome(kind),
        }
    }
}
