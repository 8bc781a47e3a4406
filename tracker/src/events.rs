use crate::types::{hex_amount, Address, ChainId, U256};
use serde::Serialize;

/// Capacity of each broadcast channel; slow subscribers lag instead of
/// blocking publishers.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Published by the balance cache.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BalanceEvent {
    #[serde(rename_all = "camelCase")]
    BalanceChanged {
        account: Address,
        chain_id: ChainId,
        token_address: Address,
        #[serde(with = "hex_amount")]
        previous_amount: U256,
        #[serde(with = "hex_amount")]
        new_amount: U256,
    },
    #[serde(rename_all = "camelCase")]
    NativeBalanceChanged {
        account: Address,
        chain_id: ChainId,
        #[serde(with = "hex_amount")]
        new_amount: U256,
    },
    #[serde(rename_all = "camelCase")]
    StakedBalanceChanged {
        account: Address,
        chain_id: ChainId,
        staking_contract: Address,
        #[serde(with = "hex_amount")]
        new_amount: U256,
    },
    AccountBalancesCleared { account: Address },
    #[serde(rename_all = "camelCase")]
    ChainBalancesCleared { chain_id: ChainId },
}

/// Published by the token registry after a successful mutation.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistryEvent {
    #[serde(rename_all = "camelCase")]
    TokensAdded {
        chain_id: ChainId,
        account: Address,
        addresses: Vec<Address>,
    },
    #[serde(rename_all = "camelCase")]
    TokensIgnored {
        chain_id: ChainId,
        account: Address,
        addresses: Vec<Address>,
    },
    #[serde(rename_all = "camelCase")]
    TokensDetected {
        chain_id: ChainId,
        account: Address,
        addresses: Vec<Address>,
    },
    IgnoredTokensCleared,
    AccountRemoved { account: Address },
    #[serde(rename_all = "camelCase")]
    ChainRemoved { chain_id: ChainId },
}

impl RegistryEvent {
    /// The chain whose balances the change affects, if it is a single one.
    pub fn chain_id(&self) -> Option<&ChainId> {
        match self {
            RegistryEvent::TokensAdded { chain_id, .. }
            | RegistryEvent::TokensIgnored { chain_id, .. }
            | RegistryEvent::TokensDetected { chain_id, .. } => Some(chain_id),
            _ => None,
        }
    }

    pub fn account(&self) -> Option<Address> {
        match self {
            RegistryEvent::TokensAdded { account, .. }
            | RegistryEvent::TokensIgnored { account, .. }
            | RegistryEvent::TokensDetected { account, .. } => Some(*account),
            _ => None,
        }
    }
}
