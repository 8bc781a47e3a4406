pub mod types;

use crate::{
    evm::balancy::types::{AddressTokenResponse, BalancyError},
    Address, ChainId,
};
use reqwest::StatusCode;
use std::collections::HashSet;

// Balancy
pub const BASE_URL: &str = "https://balancy.guild.xyz/api";
const ADDRESS_TOKENS: &str = "addressTokens?address=";
const BALANCY_CHAIN: &str = "&chain=";

lazy_static::lazy_static! {
    /// Numeric ids of the chains Balancy indexes.
    pub static ref CHAIN_IDS: HashSet<u64> = HashSet::from([1, 56, 100, 137]);
}

/// Client of Balancy's `addressTokens` endpoint.
#[derive(Clone)]
pub struct BalancyProvider {
    client: reqwest::Client,
    base_url: String,
}

impl Default for BalancyProvider {
    fn default() -> Self {
        Self::new(BASE_URL)
    }
}

impl BalancyProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn supports(chain: &ChainId) -> bool {
        chain.as_u64().map_or(false, |id| CHAIN_IDS.contains(&id))
    }

    pub fn address_tokens_url(
        &self,
        chain: &ChainId,
        address: Address,
    ) -> Result<String, BalancyError> {
        match chain.as_u64().filter(|id| CHAIN_IDS.contains(id)) {
            None => Err(BalancyError::ChainNotSupported(chain.to_string())),
            Some(id) => Ok(format!(
                "{}/{ADDRESS_TOKENS}{:#x}{BALANCY_CHAIN}{id}",
                self.base_url, address
            )),
        }
    }

    pub async fn get_address_tokens(
        &self,
        chain: &ChainId,
        address: Address,
    ) -> Result<AddressTokenResponse, BalancyError> {
        let res = self
            .client
            .get(self.address_tokens_url(chain, address)?)
            .send()
            .await?;

        let status = res.status();

        match status {
            StatusCode::OK => Ok(res.json::<AddressTokenResponse>().await?),
            StatusCode::BAD_REQUEST => Err(BalancyError::InvalidBalancyRequest),
            StatusCode::TOO_MANY_REQUESTS => Err(BalancyError::TooManyRequests),
            _ => Err(BalancyError::Unknown(status.as_u16())),
        }
    }
}
