use crate::evm::ProviderError;
use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use web3::{
    transports::Http,
    types::{Address, BlockId, BlockNumber, Bytes, CallRequest, U256, U64},
    Web3,
};

/// The handful of JSON-RPC methods balance fetching needs.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn block_number(&self) -> Result<U64, ProviderError>;

    /// `eth_call` against `to`, at `block` or at the latest block.
    async fn call(
        &self,
        to: Address,
        data: Vec<u8>,
        block: Option<U64>,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn native_balance(&self, account: Address, block: U64) -> Result<U256, ProviderError>;
}

pub struct Web3Client {
    web3: Web3<Http>,
}

impl Web3Client {
    pub fn new(rpc_url: &str) -> Result<Self, ProviderError> {
        let transport = Http::new(rpc_url)?;

        Ok(Self {
            web3: Web3::new(transport),
        })
    }
}

#[async_trait]
impl RpcClient for Web3Client {
    async fn block_number(&self) -> Result<U64, ProviderError> {
        Ok(self.web3.eth().block_number().await?)
    }

    async fn call(
        &self,
        to: Address,
        data: Vec<u8>,
        block: Option<U64>,
    ) -> Result<Vec<u8>, ProviderError> {
        let request = CallRequest {
            to: Some(to),
            data: Some(Bytes(data)),
            ..Default::default()
        };
        let block = block.map(|n| BlockId::Number(BlockNumber::Number(n)));

        Ok(self.web3.eth().call(request, block).await?.0)
    }

    async fn native_balance(&self, account: Address, block: U64) -> Result<U256, ProviderError> {
        Ok(self
            .web3
            .eth()
            .balance(account, Some(BlockNumber::Number(block)))
            .await?)
    }
}

/// Latest known block height of one chain.
///
/// The value is only ever replaced by [`BlockTracker::refresh`]; callers that
/// need a consistent snapshot refresh once and pin every call to the result.
pub struct BlockTracker {
    client: Arc<dyn RpcClient>,
    latest: RwLock<Option<U64>>,
}

impl BlockTracker {
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self {
            client,
            latest: RwLock::new(None),
        }
    }

    pub fn latest(&self) -> Option<U64> {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the cached height and asks the node again.
    pub async fn refresh(&self) -> Result<U64, ProviderError> {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = None;

        let block = self.client.block_number().await?;
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(block);

        Ok(block)
    }
}
