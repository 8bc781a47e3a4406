use super::{FetchRequest, FetchStrategy, StrategyError};
use crate::types::{BalanceEntry, BalanceRequest, ChainId};
use async_trait::async_trait;
use futures::future::join_all;
use providers::BalanceQuerier;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

pub const RPC_STRATEGY_ID: &str = "rpc";

/// Last-resort strategy reading every balance straight from the chain's RPC
/// endpoint through its batcher.
pub struct RpcStrategy {
    queriers: HashMap<ChainId, Arc<dyn BalanceQuerier>>,
    priority: u32,
    reported: Mutex<HashSet<ChainId>>,
}

impl RpcStrategy {
    pub fn new(queriers: HashMap<ChainId, Arc<dyn BalanceQuerier>>) -> Self {
        Self {
            queriers,
            priority: 0,
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn querier(&self, chain_id: &ChainId) -> Option<Arc<dyn BalanceQuerier>> {
        self.queriers.get(chain_id).cloned()
    }

    fn report_missing(&self, chain_id: &ChainId) {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);

        if reported.insert(chain_id.clone()) {
            log::error!("No RPC endpoint configured for chain {chain_id}, skipping it");
        }
    }

    async fn fetch_chain(
        &self,
        chain_id: &ChainId,
        requests: &[BalanceRequest],
    ) -> Vec<BalanceEntry> {
        let querier = match self.queriers.get(chain_id) {
            Some(querier) => querier,
            None => {
                self.report_missing(chain_id);
                return vec![];
            }
        };

        let outcomes = querier.query_balances(requests).await;

        if outcomes.iter().all(Result::is_err) {
            if let Some(Err(e)) = outcomes.first() {
                log::warn!("Every balance read on chain {chain_id} failed: {e}");
            }
            return vec![];
        }

        requests
            .iter()
            .zip(outcomes)
            .map(|(request, outcome)| match outcome {
                Ok(amount) => {
                    BalanceEntry::new(request.account, chain_id.clone(), request.token, amount)
                }
                Err(e) => {
                    log::debug!(
                        "Balance of {:#x} for {:#x} on chain {chain_id} failed: {e}",
                        request.token,
                        request.account
                    );
                    BalanceEntry::failed(request.account, chain_id.clone(), request.token)
                }
            })
            .collect()
    }
}

#[async_trait]
impl FetchStrategy for RpcStrategy {
    fn id(&self) -> &str {
        RPC_STRATEGY_ID
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn supports(&self, _chain_id: &ChainId) -> bool {
        true
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError> {
        let chains = join_all(
            request
                .chains
                .iter()
                .filter(|(_, requests)| !requests.is_empty())
                .map(|(chain_id, requests)| self.fetch_chain(chain_id, requests)),
        )
        .await;

        Ok(chains.into_iter().flatten().collect())
    }
}
