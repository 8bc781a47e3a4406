use crate::{
    address,
    types::{parse_address, Address, ChainId, ValidationError},
};
use providers::evm::{balancy::BASE_URL, BatchCapability, BatcherConfig};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable `{0}` has invalid value `{1}`")]
    InvalidValue(&'static str, String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Static facts about a network the tracker knows how to read.
#[derive(Debug, Clone)]
pub struct KnownChain {
    pub name: &'static str,
    pub chain_id: u64,
    pub capability: BatchCapability,
    pub staking_contract: Option<Address>,
    pub max_batch_size: usize,
}

impl KnownChain {
    fn new(name: &'static str, chain_id: u64, capability: BatchCapability) -> Self {
        Self {
            name,
            chain_id,
            capability,
            staking_contract: None,
            max_batch_size: 300,
        }
    }

    fn staking(mut self, contract: Address) -> Self {
        self.staking_contract = Some(contract);
        self
    }

    fn batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Name of the variable holding the chain's RPC url.
    pub fn rpc_var(&self) -> String {
        format!("{}_RPC", self.name)
    }
}

lazy_static::lazy_static! {
    static ref MULTICALL3: BatchCapability =
        BatchCapability::Aggregator(address!("0xcA11bde05977b3631167028862bE2a173976CA11"));

    pub static ref KNOWN_CHAINS: Vec<KnownChain> = vec![
        KnownChain::new("ETHEREUM", 1, *MULTICALL3)
            .staking(address!("0x4FEF9D741011476750A243aC70b9789a63dd47Df")),
        KnownChain::new("POLYGON", 137, *MULTICALL3),
        KnownChain::new("BSC", 56, *MULTICALL3),
        KnownChain::new("GNOSIS", 100, *MULTICALL3),
        KnownChain::new(
            "FANTOM",
            250,
            BatchCapability::BalanceChecker(address!("0x07f697424ABe762bB808c109860c04eC7f3B5bF5")),
        ),
        KnownChain::new("AVALANCHE", 43114, *MULTICALL3),
        KnownChain::new("ARBITRUM", 42161, *MULTICALL3),
        KnownChain::new("CELO", 42220, *MULTICALL3),
        KnownChain::new("HARMONY", 1666600000, *MULTICALL3).batch_size(100),
        KnownChain::new("GOERLI", 5, *MULTICALL3),
        KnownChain::new("OPTIMISM", 10, *MULTICALL3),
        KnownChain::new("MOONRIVER", 1285, *MULTICALL3),
        KnownChain::new("METIS", 1088, *MULTICALL3),
        KnownChain::new("CRONOS", 25, *MULTICALL3),
        KnownChain::new("BOBA", 288, *MULTICALL3),
        KnownChain::new("PALM", 11297108109, BatchCapability::None),
    ];
}

/// A known chain with an RPC endpoint.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: &'static str,
    pub chain_id: ChainId,
    pub rpc_url: String,
    pub batcher: BatcherConfig,
    pub staking_contract: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub chains: Vec<ChainConfig>,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
    pub balancy_enabled: bool,
    pub balancy_url: String,
    pub state_dir: Option<PathBuf>,
    pub accounts: Vec<Address>,
    pub auto_detect: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            chains: vec![],
            fetch_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(180),
            balancy_enabled: true,
            balancy_url: BASE_URL.to_string(),
            state_dir: None,
            accounts: vec![],
            auto_detect: true,
        }
    }
}

impl TrackerConfig {
    /// Reads the process environment; call `dotenv::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let chains = KNOWN_CHAINS
            .iter()
            .filter_map(|known| match var(&known.rpc_var()) {
                Some(rpc_url) if !rpc_url.trim().is_empty() => Some(ChainConfig {
                    name: known.name,
                    chain_id: ChainId::from(known.chain_id),
                    rpc_url: rpc_url.trim().to_string(),
                    batcher: BatcherConfig {
                        capability: known.capability,
                        max_batch_size: known.max_batch_size,
                        ..Default::default()
                    },
                    staking_contract: known.staking_contract,
                }),
                _ => {
                    log::warn!("`{}` is not set, {} is disabled", known.rpc_var(), known.name);
                    None
                }
            })
            .collect();

        let accounts = match var("TRACKED_ACCOUNTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_address)
                .collect::<Result<_, _>>()?,
            None => vec![],
        };

        Ok(Self {
            chains,
            fetch_timeout: secs(&var, "FETCH_TIMEOUT_SECS")?.unwrap_or(defaults.fetch_timeout),
            poll_interval: secs(&var, "POLL_INTERVAL_SECS")?.unwrap_or(defaults.poll_interval),
            balancy_enabled: flag(&var, "BALANCY_ENABLED")?.unwrap_or(defaults.balancy_enabled),
            balancy_url: var("BALANCY_URL").unwrap_or(defaults.balancy_url),
            state_dir: var("STATE_DIR").map(PathBuf::from),
            accounts,
            auto_detect: flag(&var, "AUTO_DETECT")?.unwrap_or(defaults.auto_detect),
        })
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.iter().map(|c| c.chain_id.clone()).collect()
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    var(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidValue(key, value))
        })
        .transpose()
}

fn flag(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    var(key)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key, value)),
        })
        .transpose()
}
