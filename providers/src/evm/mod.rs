pub mod balancy;
pub mod batcher;
pub mod client;
pub mod erc20;

pub use balancy::BalancyProvider;
pub use batcher::{BatchCapability, BatcherConfig, CallBatcher};
pub use client::{BlockTracker, RpcClient, Web3Client};

use serde::{de::Error as DeError, Deserialize, Deserializer};
use thiserror::Error;
use web3::{
    ethabi::Contract,
    types::{Address, H160, U256},
};

pub const ERC20_ABI: &[u8] = include_bytes!("../../abi/erc20.json");
pub const MULTICALL3_ABI: &[u8] = include_bytes!("../../abi/multicall3.json");
pub const BALANCE_CHECKER_ABI: &[u8] = include_bytes!("../../abi/balance_checker.json");
pub const STAKING_ABI: &[u8] = include_bytes!("../../abi/staking.json");

lazy_static::lazy_static! {
    pub static ref ERC20: Contract = Contract::load(ERC20_ABI).expect("Invalid ERC20 ABI");
    pub static ref MULTICALL3: Contract =
        Contract::load(MULTICALL3_ABI).expect("Invalid Multicall3 ABI");
    pub static ref BALANCE_CHECKER: Contract =
        Contract::load(BALANCE_CHECKER_ABI).expect("Invalid balance checker ABI");
    pub static ref STAKING: Contract = Contract::load(STAKING_ABI).expect("Invalid staking ABI");
}

/// The all-zero address stands for the chain's native coin.
pub const NATIVE_TOKEN: Address = H160([0u8; 20]);

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(transparent)]
    Web3(#[from] web3::Error),
    #[error(transparent)]
    Abi(#[from] web3::ethabi::Error),
    #[error("{0}")]
    Other(String),
}

/// Failure of a single balance request. Cloneable because one failed batch
/// call fans out to every request it carried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("call failed: {0}")]
    Call(String),
    #[error("sub-call reverted")]
    Reverted,
    #[error("unable to decode response: {0}")]
    Decode(String),
    #[error("expected {expected} results, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("request is not supported: {0}")]
    Unsupported(String),
}

impl From<web3::ethabi::Error> for BatchError {
    fn from(e: web3::ethabi::Error) -> Self {
        BatchError::Decode(e.to_string())
    }
}

impl From<ProviderError> for BatchError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Abi(e) => BatchError::Decode(e.to_string()),
            e => BatchError::Call(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Native,
    Erc20,
    Staked,
}

/// One `(account, token)` read. For [`AssetKind::Native`] the token is
/// [`NATIVE_TOKEN`], for [`AssetKind::Staked`] it is the staking contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceRequest {
    pub account: Address,
    pub token: Address,
    pub kind: AssetKind,
}

impl BalanceRequest {
    pub fn erc20(account: Address, token: Address) -> Self {
        Self {
            account,
            token,
            kind: AssetKind::Erc20,
        }
    }

    pub fn native(account: Address) -> Self {
        Self {
            account,
            token: NATIVE_TOKEN,
            kind: AssetKind::Native,
        }
    }

    pub fn staked(account: Address, staking_contract: Address) -> Self {
        Self {
            account,
            token: staking_contract,
            kind: AssetKind::Staked,
        }
    }
}

/// EIP-55 mixed-case rendering of an address.
pub fn to_checksum(address: &Address) -> String {
    let lower = format!("{address:x}");
    let hash = web3::signing::keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");

    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }

    out
}

pub fn u256_from_str<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(deserializer)?;

    U256::from_dec_str(s).map_err(D::Error::custom)
}

#[macro_export]
macro_rules! address {
    ($addr:expr) => {{
        use std::str::FromStr;
        $crate::Address::from_str($addr).expect(&format!("Invalid address {}", $addr))
    }};
}
