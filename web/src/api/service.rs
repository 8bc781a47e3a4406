use crate::api::error::ApiError;
use asset_tracker::{
    controller::{BalancesController, WatchAssetRequest},
    orchestrator::FetchReport,
    types::{hex_amount, parse_address, parse_chain_id, Address, BalanceMap, ChainId, Token},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `account -> chain -> token -> fixed-width hex amount`
pub type BalancesResponse = BTreeMap<Address, BTreeMap<ChainId, BTreeMap<Address, String>>>;

#[derive(Deserialize, Debug)]
pub struct BalancesQuery {
    /// Comma-separated accounts.
    pub accounts: String,
    /// Comma-separated chain ids; every chain when absent.
    pub chains: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub accounts: Vec<String>,
    pub chain_ids: Option<Vec<String>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub assignment: BTreeMap<ChainId, String>,
    pub unresolved: Vec<ChainId>,
    pub updated: usize,
    pub failed: usize,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TokensQuery {
    pub chain_id: String,
    pub account: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AddTokensRequest {
    pub chain_id: String,
    pub account: String,
    pub tokens: Vec<Token>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct IgnoreTokensRequest {
    pub chain_id: String,
    pub account: String,
    pub addresses: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub chain_id: String,
    pub account: String,
    #[serde(flatten)]
    pub asset: WatchAssetRequest,
}

fn split(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn render(balances: BalanceMap) -> BalancesResponse {
    balances
        .into_iter()
        .map(|(account, chains)| {
            let chains = chains
                .into_iter()
                .map(|(chain_id, tokens)| {
                    let tokens = tokens
                        .into_iter()
                        .map(|(token, amount)| (token, hex_amount::encode(&amount)))
                        .collect();
                    (chain_id, tokens)
                })
                .collect();
            (account, chains)
        })
        .collect()
}

pub fn get_balances(
    controller: &BalancesController,
    query: &BalancesQuery,
) -> Result<BalancesResponse, ApiError> {
    let chains = query.chains.as_deref().map(split);
    let balances = controller.get_balances(&split(&query.accounts), chains.as_deref())?;

    Ok(render(balances))
}

pub async fn refresh_balances(
    controller: &BalancesController,
    request: &RefreshRequest,
) -> Result<RefreshResponse, ApiError> {
    let FetchReport {
        assignment,
        unresolved,
        results,
        ..
    } = controller
        .refresh_balances(&request.accounts, request.chain_ids.as_deref())
        .await?;

    let failed = results.iter().filter(|e| !e.success).count();

    Ok(RefreshResponse {
        assignment,
        unresolved,
        updated: results.len() - failed,
        failed,
    })
}

pub fn remove_account(controller: &BalancesController, address: &str) -> Result<(), ApiError> {
    controller.on_account_removed(&parse_address(address)?);
    Ok(())
}

pub fn remove_chain(controller: &BalancesController, chain_id: &str) -> Result<(), ApiError> {
    controller.on_chain_removed(&parse_chain_id(chain_id)?);
    Ok(())
}
