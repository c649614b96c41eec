use deploykit_rpc::EthClient;
use deploykit_sdk::ArtifactIndex;
use eyre::{OptionExt, WrapErr};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::{cli::Options, config::NetworkConfig};

pub fn init_tracing(opts: &Options) -> eyre::Result<()> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_filter(log_filter);

    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .wrap_err("setting default subscriber failed")
}

/// `--rpc-url` wins over the network config.
pub fn init_eth_client(opts: &Options, config: &NetworkConfig) -> eyre::Result<EthClient> {
    let url = opts
        .rpc_url
        .clone()
        .or_else(|| config.rpc_url.clone())
        .ok_or_eyre("No RPC URL, pass --rpc-url or set DEPLOYKIT_RPC_URL")?;
    debug!(%url, "Using RPC endpoint");
    Ok(EthClient::new(url)?)
}

pub fn init_artifacts(opts: &Options) -> eyre::Result<ArtifactIndex> {
    let artifacts = ArtifactIndex::load(&opts.artifacts_dir)?;
    debug!(
        root = %artifacts.root().display(),
        contracts = artifacts.len(),
        "Loaded artifacts"
    );
    Ok(artifacts)
}
