pub mod balancy;
pub mod rpc;

pub use balancy::BalancyStrategy;
pub use rpc::RpcStrategy;

use crate::types::{BalanceEntry, BalanceRequest, ChainId};
use async_trait::async_trait;
use providers::evm::balancy::types::BalancyError;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error(transparent)]
    Balancy(#[from] BalancyError),
    #[error("{0}")]
    Other(String),
}

/// The balance reads one strategy invocation should answer, per chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub chains: BTreeMap<ChainId, Vec<BalanceRequest>>,
}

impl FetchRequest {
    pub fn chain_ids(&self) -> impl Iterator<Item = &ChainId> {
        self.chains.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.values().all(Vec::is_empty)
    }
}

/// A ranked source of balances.
///
/// A chain counts as resolved by a strategy when at least one returned entry
/// names it; returning nothing for a chain hands it to the next strategy.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn id(&self) -> &str;

    /// Higher runs first.
    fn priority(&self) -> u32;

    fn supports(&self, chain_id: &ChainId) -> bool;

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError>;
}
