//! Per-network settings read from `config/networks/<network>.json`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use deploykit_common::{Address, U256, serde_utils::u256_dec};
use eyre::WrapErr;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_ROUTER_VERSION: &str = "1.0.0";

/// Pause window used for pool factories that have no entry of their own.
pub const DEFAULT_POOL_PAUSE_WINDOW: u64 = 2_592_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    #[serde(default)]
    pub rpc_url: Option<Url>,
    /// Browser URL of the block explorer.
    #[serde(default)]
    pub explorer: Option<Url>,
    #[serde(default)]
    pub explorer_api_url: Option<Url>,
    #[serde(default)]
    pub tokens: BTreeMap<String, Address>,
    pub deployments: DeploymentsConfig,
    #[serde(default = "default_router_version")]
    pub router_version: String,
}

fn default_router_version() -> String {
    DEFAULT_ROUTER_VERSION.to_owned()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentsConfig {
    pub vault: VaultConfig,
    pub protocol_fees: ProtocolFeesConfig,
    #[serde(default)]
    pub pools: BTreeMap<String, PoolFactoryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    pub pause_window_duration: u64,
    pub buffer_period_duration: u64,
    #[serde(with = "u256_dec")]
    pub min_trade_amount: U256,
    #[serde(with = "u256_dec")]
    pub min_wrap_amount: U256,
}

/// Percentages as 18-decimal fixed point (`5e15` is 0.5%).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolFeesConfig {
    #[serde(with = "u256_dec")]
    pub initial_swap_fee_percentage: U256,
    #[serde(with = "u256_dec")]
    pub initial_yield_fee_percentage: U256,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolFactoryConfig {
    pub pause_window_duration: u64,
}

impl NetworkConfig {
    pub fn path_for(config_dir: &Path, network: &str) -> PathBuf {
        config_dir.join(format!("{network}.json"))
    }

    pub fn load(config_dir: &Path, network: &str) -> eyre::Result<Self> {
        let path = Self::path_for(config_dir, network);
        let content = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("Failed to read network config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .wrap_err_with(|| format!("Invalid network config {}", path.display()))?;
        if config.name != network {
            eyre::bail!(
                "{} describes network {:?}, expected {network:?}",
                path.display(),
                config.name
            );
        }
        Ok(config)
    }

    /// Token address by symbol, the zero address when the network has none.
    pub fn token(&self, symbol: &str) -> Address {
        self.tokens.get(symbol).copied().unwrap_or_default()
    }

    pub fn pool_pause_window(&self, factory: &str) -> Option<u64> {
        self.deployments
            .pools
            .get(factory)
            .map(|pool| pool.pause_window_duration)
    }
}
