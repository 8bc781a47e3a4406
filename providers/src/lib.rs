pub mod chain;
pub mod evm;

use async_trait::async_trait;

pub use chain::ChainId;
pub use evm::{AssetKind, BalanceRequest, BatchError};
pub use web3::types::{Address, U256, U64};

/// Something that can answer a list of balance requests for a single chain.
///
/// Implementations must return exactly one outcome per request, in request
/// order.
#[async_trait]
pub trait BalanceQuerier: Send + Sync {
    async fn query_balances(&self, requests: &[BalanceRequest]) -> Vec<Result<U256, BatchError>>;
}
