use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainIdError {
    #[error("Chain id `{0}` is empty")]
    Empty(String),
    #[error("Chain id `{0}` is not a valid hex number")]
    InvalidHex(String),
    #[error("Chain id `{0}` is neither numeric nor namespaced (`<namespace>:<reference>`)")]
    Unrecognized(String),
}

/// Opaque network identifier.
///
/// EVM chains are kept as lowercase hex without leading zeros (`0x1`,
/// `0x89`), everything else as a namespaced string (`solana:mainnet`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric id of an EVM chain, `None` for namespaced chains.
    pub fn as_u64(&self) -> Option<u64> {
        self.0
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(format!("{id:#x}"))
    }
}

impl FromStr for ChainId {
    type Err = ChainIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if s.is_empty() {
            return Err(ChainIdError::Empty(s.to_string()));
        }

        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(Self::from)
                .map_err(|_| ChainIdError::InvalidHex(s.to_string()));
        }

        if let Ok(id) = s.parse::<u64>() {
            return Ok(Self::from(id));
        }

        match s.split_once(':') {
            Some((namespace, reference)) if !namespace.is_empty() && !reference.is_empty() => {
                Ok(Self(s.to_string()))
            }
            _ => Err(ChainIdError::Unrecognized(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChainId {
    type Error = ChainIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
