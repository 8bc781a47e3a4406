use super::{hex_amount, Address, AssetKind, BalanceRequest, ChainId, NATIVE_TOKEN, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Balances of one chain, keyed by token address.
pub type TokenBalances = HashMap<Address, U256>;
pub type ChainBalances = HashMap<ChainId, TokenBalances>;
/// `account -> chain -> token -> amount`
pub type BalanceMap = HashMap<Address, ChainBalances>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceEntry {
    pub account_address: Address,
    pub chain_id: ChainId,
    pub token_address: Address,
    #[serde(with = "hex_amount")]
    pub amount: U256,
    pub success: bool,
}

impl BalanceEntry {
    pub fn new(account: Address, chain_id: ChainId, token: Address, amount: U256) -> Self {
        Self {
            account_address: account,
            chain_id,
            token_address: token,
            amount,
            success: true,
        }
    }

    pub fn failed(account: Address, chain_id: ChainId, token: Address) -> Self {
        Self {
            account_address: account,
            chain_id,
            token_address: token,
            amount: U256::zero(),
            success: false,
        }
    }
}

/// Reserved token addresses: the zero address for the native coin on every
/// chain and the staking contract on chains that have one.
#[derive(Debug, Clone, Default)]
pub struct PseudoTokens {
    staking: HashMap<ChainId, Address>,
}

impl PseudoTokens {
    pub fn new(staking: HashMap<ChainId, Address>) -> Self {
        Self { staking }
    }

    pub fn staking_contract(&self, chain: &ChainId) -> Option<Address> {
        self.staking.get(chain).copied()
    }

    pub fn kind(&self, chain: &ChainId, token: &Address) -> AssetKind {
        if *token == NATIVE_TOKEN {
            AssetKind::Native
        } else if self.staking.get(chain) == Some(token) {
            AssetKind::Staked
        } else {
            AssetKind::Erc20
        }
    }

    pub fn is_pseudo(&self, chain: &ChainId, token: &Address) -> bool {
        self.kind(chain, token) != AssetKind::Erc20
    }

    /// Native and, where present, staked requests of `account`.
    pub fn requests(&self, chain: &ChainId, account: Address) -> Vec<BalanceRequest> {
        let mut requests = vec![BalanceRequest::native(account)];

        if let Some(staking) = self.staking_contract(chain) {
            requests.push(BalanceRequest::staked(account, staking));
        }

        requests
    }

    /// Request for `token`, classified by its address.
    pub fn request(&self, chain: &ChainId, account: Address, token: Address) -> BalanceRequest {
        match self.kind(chain, &token) {
            AssetKind::Native => BalanceRequest::native(account),
            AssetKind::Staked => BalanceRequest::staked(account, token),
            AssetKind::Erc20 => BalanceRequest::erc20(account, token),
        }
    }
}
