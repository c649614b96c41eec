//! The Balancer V3 style deployment plan and the verification settings that
//! go with it.

use std::collections::{BTreeMap, BTreeSet};

use deploykit_common::{Address, abi::Value};
use deploykit_deployer::{DeployStep, PipelinePhase, ResolveError};
use eyre::OptionExt;

use crate::config::{DEFAULT_POOL_PAUSE_WINDOW, NetworkConfig};

pub const CORE: &str = "core";
pub const ROUTERS: &str = "routers";
pub const FACTORIES: &str = "factories";
pub const ADDITIONAL_FACTORIES: &str = "additional-factories";
pub const HOOKS: &str = "hooks";

/// Pool factories verified with an explicit path because their minimal
/// bytecode collides with other artifacts.
const STUB_FACTORIES: [&str; 4] = [
    "Gyro2CLPPoolFactory",
    "GyroECLPPoolFactory",
    "LBPoolFactory",
    "QuantAMMWeightedPoolFactory",
];

fn vault(r: &deploykit_deployer::Resolver<'_>) -> Result<Value, ResolveError> {
    Ok(r.address("Vault")?.into())
}

fn router(name: &str, config: &NetworkConfig) -> DeployStep {
    let weth = config.token("WETH");
    let version = config.router_version.clone();
    DeployStep::new(name, move |r| {
        Ok(vec![
            vault(r)?,
            weth.into(),
            // Permit2
            Address::zero().into(),
            version.as_str().into(),
        ])
    })
}

fn pool_factory(name: &str, pause_window: u64, factory_version: &str, pool_version: &str) -> DeployStep {
    let factory_version = factory_version.to_owned();
    let pool_version = pool_version.to_owned();
    DeployStep::new(name, move |r| {
        Ok(vec![
            vault(r)?,
            pause_window.into(),
            factory_version.as_str().into(),
            pool_version.as_str().into(),
        ])
    })
}

fn additional_factory(
    config: &NetworkConfig,
    name: &str,
    config_key: &str,
    factory_version: &str,
    pool_version: &str,
) -> DeployStep {
    let pause_window = config
        .pool_pause_window(config_key)
        .unwrap_or(DEFAULT_POOL_PAUSE_WINDOW);
    pool_factory(name, pause_window, factory_version, pool_version)
}

/// Phases in deployment order.
///
/// VaultAdmin, VaultExtension and ProtocolFeeController are built against the
/// Vault's predicted address; the Vault then takes their real addresses.
pub fn deployment_plan(config: &NetworkConfig) -> eyre::Result<Vec<PipelinePhase>> {
    let vault_config = config.deployments.vault.clone();
    let fees = config.deployments.protocol_fees.clone();

    let core = vec![
        DeployStep::new("VaultAdmin", move |r| {
            Ok(vec![
                vault(r)?,
                vault_config.pause_window_duration.into(),
                vault_config.buffer_period_duration.into(),
                vault_config.min_trade_amount.into(),
                vault_config.min_wrap_amount.into(),
            ])
        }),
        DeployStep::new("VaultExtension", |r| {
            Ok(vec![vault(r)?, r.address("VaultAdmin")?.into()])
        }),
        DeployStep::new("ProtocolFeeController", move |r| {
            Ok(vec![
                vault(r)?,
                fees.initial_swap_fee_percentage.into(),
                fees.initial_yield_fee_percentage.into(),
            ])
        }),
        DeployStep::new("Vault", |r| {
            Ok(vec![
                r.address("VaultExtension")?.into(),
                // Authorizer
                r.deployer().into(),
                r.address("ProtocolFeeController")?.into(),
            ])
        }),
    ];

    let routers = vec![router("Router", config), router("BatchRouter", config)];

    let pause_window = |key: &str| {
        config
            .pool_pause_window(key)
            .ok_or_eyre(format!("{} has no deployments.pools.{key} entry", config.name))
    };
    let factories = vec![
        pool_factory(
            "WeightedPoolFactory",
            pause_window("weightedPoolFactory")?,
            "Weighted Pool Factory V3",
            "Weighted Pool V3",
        ),
        pool_factory(
            "StablePoolFactory",
            pause_window("stablePoolFactory")?,
            "Stable Pool Factory V3",
            "Stable Pool V3",
        ),
    ];

    let additional_factories = vec![
        additional_factory(
            config,
            "ReClammPoolFactory",
            "reClammPoolFactory",
            "ReClamm Pool Factory",
            "ReClamm Pool",
        ),
        additional_factory(
            config,
            "Gyro2CLPPoolFactory",
            "gyro2CLPPoolFactory",
            "Gyro 2CLP Pool Factory",
            "Gyro 2CLP Pool",
        ),
        additional_factory(
            config,
            "GyroECLPPoolFactory",
            "gyroECLPPoolFactory",
            "Gyro ECLP Pool Factory",
            "Gyro ECLP Pool",
        ),
        additional_factory(
            config,
            "LBPoolFactory",
            "lbPoolFactory",
            "LB Pool Factory",
            "LB Pool",
        ),
        additional_factory(
            config,
            "QuantAMMWeightedPoolFactory",
            "quantAMMWeightedPoolFactory",
            "QuantAMM Weighted Pool Factory",
            "QuantAMM Weighted Pool",
        ),
        pool_factory(
            "StablePoolV2Factory",
            pause_window("stablePoolFactory")?,
            "Stable Pool Factory V3 (V2)",
            "Stable Pool V3 (V2)",
        )
        .artifact("StablePoolFactory"),
    ];

    let hooks = vec![
        DeployStep::new("StableSurgeHook", |r| Ok(vec![vault(r)?])),
        DeployStep::new("StableSurgeHookV2", |r| Ok(vec![vault(r)?])).artifact("StableSurgeHook"),
    ];

    Ok(vec![
        PipelinePhase::required(CORE, core),
        PipelinePhase::required(ROUTERS, routers),
        PipelinePhase::required(FACTORIES, factories),
        PipelinePhase::optional(ADDITIONAL_FACTORIES, additional_factories),
        PipelinePhase::optional(HOOKS, hooks),
    ])
}

/// Core infrastructure first, then routers, standard factories and the
/// factories that are hardest to verify.
pub fn verification_priority() -> Vec<String> {
    [
        "Vault",
        "VaultAdmin",
        "VaultExtension",
        "ProtocolFeeController",
        "Router",
        "BatchRouter",
        "WeightedPoolFactory",
        "StablePoolFactory",
        "ReClammPoolFactory",
    ]
    .into_iter()
    .chain(STUB_FACTORIES)
    .map(str::to_owned)
    .collect()
}

pub fn contract_path_hints() -> BTreeMap<String, String> {
    STUB_FACTORIES
        .into_iter()
        .chain(["ReClammPoolFactory"])
        .map(|name| {
            (
                name.to_owned(),
                format!("contracts/core/additional/factories/{name}.sol:{name}"),
            )
        })
        .collect()
}

/// Contracts whose verification failure does not fail the command.
pub fn non_critical() -> BTreeSet<String> {
    STUB_FACTORIES.into_iter().map(str::to_owned).collect()
}
