use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    time::Duration,
};

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand};
use deploykit_common::{Address, address::AddressPredictor};
use deploykit_deployer::{
    DeploymentPipeline, MismatchPolicy, PipelineOptions, Redeploy, VerificationOptions,
    verify_all,
};
use deploykit_rpc::{EtherscanClient, Signer};
use deploykit_sdk::{EtherscanExplorer, RpcContractFactory};
use deploykit_storage::{DeploymentLedger, DeploymentRecord};
use eyre::OptionExt;
use tracing::{Level, info, warn};
use url::Url;

use crate::{
    config::NetworkConfig,
    deployer::{contract_path_hints, deployment_plan, non_critical, verification_priority},
    initializers::{init_artifacts, init_eth_client, init_tracing},
};

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "deploykit",
    version,
    about = "Deploys, records and verifies a suite of interdependent contracts"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "network",
        value_name = "NETWORK",
        default_value = "moksha",
        env = "DEPLOYKIT_NETWORK",
        global = true,
        help = "Network name, used for both the config file and the ledger file."
    )]
    pub network: String,
    #[arg(
        long = "rpc-url",
        value_name = "RPC_URL",
        env = "DEPLOYKIT_RPC_URL",
        global = true,
        help = "JSON-RPC endpoint. Defaults to the rpcUrl of the network config."
    )]
    pub rpc_url: Option<Url>,
    #[arg(
        long = "config-dir",
        value_name = "PATH",
        default_value = "config/networks",
        env = "DEPLOYKIT_CONFIG_DIR",
        global = true
    )]
    pub config_dir: PathBuf,
    #[arg(
        long = "deployments-dir",
        value_name = "PATH",
        default_value = "deployments",
        env = "DEPLOYKIT_DEPLOYMENTS_DIR",
        global = true
    )]
    pub deployments_dir: PathBuf,
    #[arg(
        long = "artifacts-dir",
        value_name = "PATH",
        default_value = "artifacts",
        env = "DEPLOYKIT_ARTIFACTS_DIR",
        global = true
    )]
    pub artifacts_dir: PathBuf,
    #[arg(
        long = "log-level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "DEPLOYKIT_LOG_LEVEL",
        global = true,
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error. RUST_LOG directives take precedence."
    )]
    pub log_level: Level,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(about = "Deploy every contract of the plan that is not in the ledger yet")]
    Deploy {
        #[arg(
            long = "phase",
            value_name = "PHASE",
            help = "Only run this phase. Can be repeated."
        )]
        phases: Vec<String>,
        #[arg(
            long = "redeploy",
            value_name = "NAME",
            conflicts_with = "redeploy_all",
            help = "Deploy this contract again even if the ledger has it. Can be repeated."
        )]
        redeploy: Vec<String>,
        #[arg(long = "redeploy-all", action = ArgAction::SetTrue)]
        redeploy_all: bool,
        #[arg(
            long = "abort-on-mismatch",
            action = ArgAction::SetTrue,
            help = "Stop when a contract lands somewhere other than its predicted address."
        )]
        abort_on_mismatch: bool,
        #[arg(
            long = "private-key",
            value_name = "PRIVATE_KEY",
            env = "DEPLOYKIT_PRIVATE_KEY",
            hide_env_values = true
        )]
        private_key: String,
    },
    #[command(about = "Verify every ledger entry on the network's block explorer")]
    Verify {
        #[arg(long, default_value_t = 3, value_name = "N", help = "Submissions per contract.")]
        max_retries: u32,
        #[arg(long, default_value_t = 1, value_name = "N")]
        concurrency: usize,
        #[arg(
            long = "poll-interval",
            default_value_t = 5,
            value_name = "SECONDS",
            help = "Wait between verification status checks."
        )]
        poll_interval: u64,
        #[arg(
            long = "max-polls",
            default_value_t = 12,
            value_name = "N",
            help = "Status checks before a pending verification counts as a transient failure."
        )]
        max_polls: u32,
        #[arg(
            long = "explorer-api-url",
            value_name = "URL",
            help = "Defaults to the explorerApiUrl of the network config."
        )]
        explorer_api_url: Option<Url>,
        #[arg(
            long = "explorer-api-key",
            value_name = "KEY",
            env = "DEPLOYKIT_EXPLORER_API_KEY",
            hide_env_values = true
        )]
        explorer_api_key: Option<String>,
    },
    #[command(about = "Show what the ledger holds")]
    Inspect {
        #[arg(long, value_name = "CONTRACT")]
        name: Option<String>,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    #[command(about = "Show the addresses the deployer's next creations will get")]
    Predict {
        #[arg(long, default_value_t = 4, value_name = "N")]
        count: u64,
        #[arg(
            long,
            value_name = "ADDRESS",
            required_unless_present = "private_key",
            help = "Deployer account. Taken from the private key when omitted."
        )]
        deployer: Option<Address>,
        #[arg(
            long = "private-key",
            value_name = "PRIVATE_KEY",
            env = "DEPLOYKIT_PRIVATE_KEY",
            hide_env_values = true
        )]
        private_key: Option<String>,
    },
}

impl Subcommand {
    /// Runs the command. `Ok(false)` means it completed but failed.
    pub async fn run(self, opts: &Options) -> eyre::Result<bool> {
        init_tracing(opts)?;

        match self {
            Subcommand::Deploy {
                phases,
                redeploy,
                redeploy_all,
                abort_on_mismatch,
                private_key,
            } => {
                let redeploy = if redeploy_all {
                    Redeploy::All
                } else if redeploy.is_empty() {
                    Redeploy::None
                } else {
                    Redeploy::Only(redeploy.into_iter().collect())
                };
                let mismatch_policy = if abort_on_mismatch {
                    MismatchPolicy::Abort
                } else {
                    MismatchPolicy::Warn
                };
                deploy(opts, phases, redeploy, mismatch_policy, &private_key).await
            }
            Subcommand::Verify {
                max_retries,
                concurrency,
                poll_interval,
                max_polls,
                explorer_api_url,
                explorer_api_key,
            } => {
                let options = VerificationOptions {
                    max_retries,
                    concurrency,
                    contract_path_hints: contract_path_hints(),
                    non_critical: non_critical(),
                    priority: verification_priority(),
                    ..Default::default()
                };
                verify(
                    opts,
                    options,
                    Duration::from_secs(poll_interval),
                    max_polls,
                    explorer_api_url,
                    explorer_api_key,
                )
                .await
            }
            Subcommand::Inspect { name, json } => {
                inspect(opts, name.as_deref(), json)?;
                Ok(true)
            }
            Subcommand::Predict {
                count,
                deployer,
                private_key,
            } => {
                let deployer = match (deployer, private_key) {
                    (Some(deployer), _) => deployer,
                    (None, Some(key)) => Signer::from_hex(&key)?.address(),
                    (None, None) => eyre::bail!("Either --deployer or --private-key is required"),
                };
                predict(opts, deployer, count).await?;
                Ok(true)
            }
        }
    }
}

async fn deploy(
    opts: &Options,
    phases: Vec<String>,
    redeploy: Redeploy,
    mismatch_policy: MismatchPolicy,
    private_key: &str,
) -> eyre::Result<bool> {
    let config = NetworkConfig::load(&opts.config_dir, &opts.network)?;
    let signer = Signer::from_hex(private_key)?;
    let client = init_eth_client(opts, &config)?;
    let artifacts = init_artifacts(opts)?;
    let mut ledger = DeploymentLedger::open(&opts.deployments_dir, &opts.network)?;

    let options = PipelineOptions {
        redeploy,
        phases: (!phases.is_empty()).then_some(phases),
        mismatch_policy,
        expected_chain_id: Some(config.chain_id),
    };
    let pipeline = DeploymentPipeline::new(deployment_plan(&config)?, options);
    info!(
        network = %opts.network,
        deployer = %format!("{:#x}", signer.address()),
        ledger = %ledger.path().display(),
        already_deployed = ledger.len(),
        "Starting deployment"
    );

    let factory = RpcContractFactory::new(client, signer, artifacts);
    let result = pipeline.run(&mut ledger, &factory, &factory).await?;

    println!("{}", result.summary());
    if let Some(err) = &result.abort {
        warn!(%err, "Deployment aborted");
    }
    Ok(result.is_success())
}

async fn verify(
    opts: &Options,
    options: VerificationOptions,
    poll_interval: Duration,
    max_polls: u32,
    explorer_api_url: Option<Url>,
    explorer_api_key: Option<String>,
) -> eyre::Result<bool> {
    let config = NetworkConfig::load(&opts.config_dir, &opts.network)?;
    let api_url = explorer_api_url
        .or(config.explorer_api_url)
        .ok_or_eyre("No explorer API URL, pass --explorer-api-url or set explorerApiUrl")?;
    let ledger = DeploymentLedger::open_read_only(&opts.deployments_dir, &opts.network)?;
    if ledger.is_empty() {
        warn!(ledger = %ledger.path().display(), "Nothing to verify, run deploy first");
        return Ok(true);
    }

    let explorer = EtherscanExplorer::new(
        EtherscanClient::new(api_url, explorer_api_key),
        init_artifacts(opts)?,
    )
    .with_polling(poll_interval, max_polls);
    info!(network = %opts.network, contracts = ledger.len(), "Starting verification");
    let report = verify_all(&ledger, &explorer, &options).await;

    println!("{}", report.summary());
    Ok(!report.is_fatal())
}

fn inspect(opts: &Options, name: Option<&str>, json: bool) -> eyre::Result<()> {
    let ledger = DeploymentLedger::open_read_only(&opts.deployments_dir, &opts.network)?;
    let records: Vec<&DeploymentRecord> = match name {
        Some(name) => vec![
            ledger
                .get(name)
                .ok_or_eyre(format!("{name} is not in the {} ledger", opts.network))?,
        ],
        None => ledger.all(),
    };

    if json {
        let by_name: BTreeMap<&str, &DeploymentRecord> =
            records.iter().map(|r| (r.name.as_str(), *r)).collect();
        println!("{}", serde_json::to_string_pretty(&by_name)?);
        return Ok(());
    }

    println!(
        "{} ({} contracts, last modified {})",
        ledger.network(),
        ledger.len(),
        ledger.last_modified()
    );
    for record in records {
        let alias = record
            .contract
            .as_deref()
            .map(|c| format!(" [{c}]"))
            .unwrap_or_default();
        println!("{}{alias} {:#x}", record.name, record.address);
        if let Some(tx_hash) = record.tx_hash {
            println!("  tx:   {tx_hash:#x}");
        }
        println!("  at:   {}", record.deployed_at);
        let args: Vec<String> = record
            .constructor_args
            .iter()
            .map(ToString::to_string)
            .collect();
        println!("  args: [{}]", args.join(", "));
    }
    Ok(())
}

/// Prints the next `count` creation addresses and, for those that the plan
/// would use, the contract expected there.
async fn predict(opts: &Options, deployer: Address, count: u64) -> eyre::Result<()> {
    let config = NetworkConfig::load(&opts.config_dir, &opts.network)?;
    let client = init_eth_client(opts, &config)?;
    let nonce = client.get_nonce(deployer).await?;
    let ledger = DeploymentLedger::open_read_only(&opts.deployments_dir, &opts.network)?;

    let deployed: BTreeSet<&str> = ledger.all().into_iter().map(|r| r.name.as_str()).collect();
    let pending: Vec<String> = deployment_plan(&config)?
        .iter()
        .flat_map(|phase| phase.steps.iter())
        .map(|step| step.name().to_owned())
        .filter(|name| !deployed.contains(name.as_str()))
        .collect();

    let predictor = AddressPredictor::new(deployer, nonce);
    println!(
        "deployer {:#x}, next nonce {}",
        predictor.sender(),
        predictor.base_nonce()
    );
    for offset in 0..count {
        let predicted = predictor.predict(offset);
        let step = usize::try_from(offset)
            .ok()
            .and_then(|i| pending.get(i))
            .map(String::as_str)
            .unwrap_or("-");
        println!(
            "  +{offset} nonce {} {:#x} {step}",
            predicted.nonce, predicted.address
        );
    }
    Ok(())
}
