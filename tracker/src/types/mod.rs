mod balance;
mod token;

pub use balance::*;
pub use providers::{
    evm::{to_checksum, AssetKind, BalanceRequest, NATIVE_TOKEN},
    Address, ChainId, U256,
};
pub use token::*;

use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("`{0}` is not a valid address")]
    InvalidAddress(String),
    #[error("{0} address must not be the zero address")]
    ZeroAddress(&'static str),
    #[error("`{0}` is not a valid chain id")]
    InvalidChainId(String),
    #[error("Token {0} has an empty symbol")]
    EmptySymbol(String),
    #[error("Token {0} has invalid decimals `{1}`, must be at most {MAX_DECIMALS}")]
    InvalidDecimals(String, u8),
    #[error("`{0}` is not a valid amount")]
    InvalidAmount(String),
    #[error("Asset type `{0}` is not supported")]
    UnsupportedAssetType(String),
}

pub const MAX_DECIMALS: u8 = 36;

/// Parses a `0x`-prefixed, 40 hex digit address in any letter case.
pub fn parse_address(s: &str) -> Result<Address, ValidationError> {
    let s = s.trim();

    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) if hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            Address::from_str(hex).map_err(|_| ValidationError::InvalidAddress(s.to_string()))
        }
        _ => Err(ValidationError::InvalidAddress(s.to_string())),
    }
}

pub fn parse_chain_id(s: &str) -> Result<ChainId, ValidationError> {
    s.parse()
        .map_err(|_| ValidationError::InvalidChainId(s.to_string()))
}

/// Fixed-width hex rendering of amounts: `0x` followed by 64 digits.
pub mod hex_amount {
    use super::{ValidationError, U256};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn encode(amount: &U256) -> String {
        format!("0x{:0>64}", format!("{amount:x}"))
    }

    pub fn decode(s: &str) -> Result<U256, ValidationError> {
        match s.strip_prefix("0x") {
            Some(digits)
                if !digits.is_empty()
                    && digits.len() <= 64
                    && digits.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                U256::from_str(digits).map_err(|_| ValidationError::InvalidAmount(s.to_string()))
            }
            _ => Err(ValidationError::InvalidAmount(s.to_string())),
        }
    }

    pub fn serialize<S: Serializer>(amount: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(amount))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;

        decode(&s).map_err(D::Error::custom)
    }
}
