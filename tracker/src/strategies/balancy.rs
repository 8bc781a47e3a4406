use super::{FetchRequest, FetchStrategy, StrategyError};
use crate::types::{Address, AssetKind, BalanceEntry, BalanceRequest, ChainId, U256};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use providers::{
    evm::{balancy::types::AddressTokenResponse, BalancyProvider},
    BalanceQuerier,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

pub const BALANCY_STRATEGY_ID: &str = "balancy";
const MAX_CONCURRENCY: usize = 5;

/// Reads ERC-20 holdings from the Balancy indexer, one request per
/// (chain, account). Native and staked balances, which Balancy does not
/// index, go through the chain's querier when one is configured.
pub struct BalancyStrategy {
    provider: BalancyProvider,
    queriers: HashMap<ChainId, Arc<dyn BalanceQuerier>>,
    priority: u32,
}

impl BalancyStrategy {
    pub fn new(
        provider: BalancyProvider,
        queriers: HashMap<ChainId, Arc<dyn BalanceQuerier>>,
    ) -> Self {
        Self {
            provider,
            queriers,
            priority: 100,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    async fn fetch_account(
        &self,
        chain_id: &ChainId,
        account: Address,
        requests: Vec<BalanceRequest>,
    ) -> Result<Vec<BalanceEntry>, StrategyError> {
        let response = self.provider.get_address_tokens(chain_id, account).await?;
        let mut entries = entries_from_response(chain_id, account, &requests, &response);

        let pseudo: Vec<BalanceRequest> = requests
            .into_iter()
            .filter(|r| r.kind != AssetKind::Erc20)
            .collect();

        if let (false, Some(querier)) = (pseudo.is_empty(), self.queriers.get(chain_id)) {
            let outcomes = querier.query_balances(&pseudo).await;

            entries.extend(pseudo.iter().zip(outcomes).map(|(request, outcome)| {
                match outcome {
                    Ok(amount) => {
                        BalanceEntry::new(account, chain_id.clone(), request.token, amount)
                    }
                    Err(_) => BalanceEntry::failed(account, chain_id.clone(), request.token),
                }
            }));
        }

        Ok(entries)
    }
}

/// Every ERC-20 the indexer reports, plus a zero entry for each requested
/// ERC-20 it did not list.
pub fn entries_from_response(
    chain_id: &ChainId,
    account: Address,
    requests: &[BalanceRequest],
    response: &AddressTokenResponse,
) -> Vec<BalanceEntry> {
    let mut amounts: BTreeMap<Address, U256> = BTreeMap::new();
    for token in &response.erc20 {
        let amount = amounts.entry(token.address).or_default();
        *amount = amount.saturating_add(token.amount);
    }

    let missing: Vec<Address> = requests
        .iter()
        .filter(|r| r.kind == AssetKind::Erc20 && !amounts.contains_key(&r.token))
        .map(|r| r.token)
        .collect();

    amounts
        .into_iter()
        .chain(missing.into_iter().map(|token| (token, U256::zero())))
        .map(|(token, amount)| BalanceEntry::new(account, chain_id.clone(), token, amount))
        .collect()
}

#[async_trait]
impl FetchStrategy for BalancyStrategy {
    fn id(&self) -> &str {
        BALANCY_STRATEGY_ID
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn supports(&self, chain_id: &ChainId) -> bool {
        BalancyProvider::supports(chain_id)
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError> {
        let mut jobs = Vec::new();
        for (chain_id, requests) in &request.chains {
            let mut by_account: BTreeMap<Address, Vec<BalanceRequest>> = BTreeMap::new();
            for request in requests {
                by_account.entry(request.account).or_default().push(*request);
            }
            jobs.extend(
                by_account
                    .into_iter()
                    .map(|(account, requests)| (chain_id.clone(), account, requests)),
            );
        }

        let outcomes: Vec<_> = stream::iter(jobs)
            .map(|(chain_id, account, requests)| async move {
                let outcome = self.fetch_account(&chain_id, account, requests).await;
                outcome.map_err(|e| (chain_id, account, e))
            })
            .buffer_unordered(MAX_CONCURRENCY)
            .collect()
            .await;

        let mut entries = Vec::new();
        let mut last_error = None;

        for outcome in outcomes {
            match outcome {
                Ok(chunk) => entries.extend(chunk),
                Err((chain_id, account, e)) => {
                    log::warn!("Balancy failed for {account:#x} on chain {chain_id}: {e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if entries.is_empty() => Err(e),
            _ => Ok(entries),
        }
    }
}
