#![allow(clippy::unwrap_used)]

use std::{fs, path::Path, time::Duration};

use deploykit_common::{Address, abi::Value};
use deploykit_deployer::{Explorer, ExplorerError, ExplorerOutcome, VerificationRequest};
use deploykit_rpc::EtherscanClient;
use deploykit_sdk::{ArtifactIndex, EtherscanExplorer};
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use tempfile::TempDir;
use url::Url;

const GUID: &str = "ezq878u486pzijkvvmerl6a9mzwhv6sefgvqi5tkwceejc7tvn";

fn write(path: &Path, value: serde_json::Value) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, value.to_string()).unwrap();
}

fn artifacts() -> TempDir {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("contracts/vault/Router.sol");
    write(
        &source.join("Router.json"),
        json!({
            "_format": "hh-sol-artifact-1",
            "contractName": "Router",
            "sourceName": "contracts/vault/Router.sol",
            "abi": [],
            "bytecode": "0x6080604052",
            "deployedBytecode": "0x",
            "linkReferences": {},
            "deployedLinkReferences": {}
        }),
    );
    write(
        &source.join("Router.dbg.json"),
        json!({"_format": "hh-sol-dbg-1", "buildInfo": "../../../build-info/4f2a.json"}),
    );
    write(
        &dir.path().join("build-info/4f2a.json"),
        json!({
            "_format": "hh-sol-build-info-1",
            "solcVersion": "0.8.24",
            "solcLongVersion": "0.8.24+commit.e11b9ed9",
            "input": {"language": "Solidity", "sources": {}},
            "output": {"contracts": {}}
        }),
    );
    dir
}

fn explorer(server: &ServerGuard, artifacts: &Path, max_polls: u32) -> EtherscanExplorer {
    EtherscanExplorer::new(
        EtherscanClient::new(Url::parse(&server.url()).unwrap(), Some("KEY".to_owned())),
        ArtifactIndex::load(artifacts).unwrap(),
    )
    .with_polling(Duration::ZERO, max_polls)
}

fn request() -> VerificationRequest {
    VerificationRequest {
        name: "Router".into(),
        contract: "Router".into(),
        address: Address::repeat_byte(0x22),
        constructor_args: vec![Value::Address(Address::repeat_byte(0x11))],
        contract_path: None,
    }
}

fn body(status: &str, message: &str, result: &str) -> String {
    json!({"status": status, "message": message, "result": result}).to_string()
}

async fn submission(server: &mut ServerGuard, response: String) -> Mock {
    server
        .mock("POST", "/")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("action".into(), "verifysourcecode".into()),
            Matcher::UrlEncoded(
                "contractname".into(),
                "contracts/vault/Router.sol:Router".into(),
            ),
            Matcher::UrlEncoded("compilerversion".into(), "v0.8.24+commit.e11b9ed9".into()),
            Matcher::UrlEncoded("apikey".into(), "KEY".into()),
        ]))
        .with_status(200)
        .with_body(response)
        .expect(1)
        .create_async()
        .await
}

async fn status(server: &mut ServerGuard, result: &str, hits: usize) -> Mock {
    server
        .mock("GET", "/")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("action".into(), "checkverifystatus".into()),
            Matcher::UrlEncoded("guid".into(), GUID.into()),
        ]))
        .with_status(200)
        .with_body(body("1", "OK", result))
        .expect(hits)
        .create_async()
        .await
}

#[tokio::test]
async fn accepted_submission_is_polled_until_verified() {
    let mut server = Server::new_async().await;
    let submitted = submission(&mut server, body("1", "OK", GUID)).await;
    let polled = status(&mut server, "Pass - Verified", 1).await;
    let artifacts = artifacts();

    let outcome = explorer(&server, artifacts.path(), 3)
        .verify(&request())
        .await
        .unwrap();

    assert_eq!(outcome, ExplorerOutcome::Verified);
    submitted.assert_async().await;
    polled.assert_async().await;
}

#[tokio::test]
async fn verification_pending_past_the_poll_budget_is_transient() {
    let mut server = Server::new_async().await;
    let _submitted = submission(&mut server, body("1", "OK", GUID)).await;
    let polled = status(&mut server, "Pending in queue", 3).await;
    let artifacts = artifacts();

    let err = explorer(&server, artifacts.path(), 3)
        .verify(&request())
        .await
        .unwrap_err();

    match err {
        ExplorerError::Transient(reason) => assert!(reason.contains("after 3 polls"), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    polled.assert_async().await;
}

#[tokio::test]
async fn already_verified_submission_is_not_polled() {
    let mut server = Server::new_async().await;
    let _submitted = submission(
        &mut server,
        body("0", "NOTOK", "Contract source code already verified"),
    )
    .await;
    let polled = status(&mut server, "Pass - Verified", 0).await;
    let artifacts = artifacts();

    let outcome = explorer(&server, artifacts.path(), 3)
        .verify(&request())
        .await
        .unwrap();

    assert_eq!(outcome, ExplorerOutcome::AlreadyVerified);
    polled.assert_async().await;
}

#[tokio::test]
async fn ambiguous_bytecode_reports_candidates() {
    let mut server = Server::new_async().await;
    let _submitted = submission(
        &mut server,
        body(
            "0",
            "NOTOK",
            "More than one contract was found to match the deployed bytecode. \
             Please use one of: contracts/vault/Router.sol:Router, contracts/mocks/RouterMock.sol:RouterMock",
        ),
    )
    .await;
    let artifacts = artifacts();

    let err = explorer(&server, artifacts.path(), 3)
        .verify(&request())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExplorerError::AmbiguousBytecode {
            candidates: vec![
                "contracts/vault/Router.sol:Router".into(),
                "contracts/mocks/RouterMock.sol:RouterMock".into(),
            ]
        }
    );
}

#[tokio::test]
async fn rejected_status_is_final() {
    let mut server = Server::new_async().await;
    let _submitted = submission(&mut server, body("1", "OK", GUID)).await;
    let _polled = server
        .mock("GET", "/")
        .match_query(Matcher::UrlEncoded("guid".into(), GUID.into()))
        .with_status(200)
        .with_body(body(
            "0",
            "NOTOK",
            "Fail - Unable to verify. Compiled contract deployment bytecode does NOT match",
        ))
        .create_async()
        .await;
    let artifacts = artifacts();

    let err = explorer(&server, artifacts.path(), 3)
        .verify(&request())
        .await
        .unwrap_err();

    assert!(matches!(err, ExplorerError::Rejected(ref reason) if reason.starts_with("Fail - Unable to verify")));
}
