use crate::{
    evm::{
        AssetKind, BalanceRequest, BatchError, BlockTracker, RpcClient, BALANCE_CHECKER, ERC20,
        MULTICALL3, STAKING,
    },
    BalanceQuerier,
};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use web3::{
    ethabi::{Function, Token},
    types::{Address, U256, U64},
};

type Outcome = Result<U256, BatchError>;

/// How balance reads on a chain can be aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCapability {
    /// Multicall3-compatible `aggregate3` contract.
    Aggregator(Address),
    /// Legacy `balances(address[],address[])` contract. Cannot read staked
    /// balances.
    BalanceChecker(Address),
    None,
}

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub capability: BatchCapability,
    /// Upper bound of sub-calls carried by a single `eth_call`.
    pub max_batch_size: usize,
    /// Upper bound of in-flight calls against the endpoint.
    pub max_concurrency: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            capability: BatchCapability::None,
            max_batch_size: 100,
            max_concurrency: 10,
        }
    }
}

struct SubCall {
    target: Address,
    data: Vec<u8>,
    decoder: &'static Function,
}

impl SubCall {
    fn new(
        target: Address,
        function: &'static Function,
        args: &[Token],
    ) -> Result<Self, BatchError> {
        Ok(Self {
            target,
            data: function.encode_input(args)?,
            decoder: function,
        })
    }
}

/// Reads balances of one chain with as few round-trips as the chain allows.
pub struct CallBatcher {
    client: Arc<dyn RpcClient>,
    blocks: BlockTracker,
    config: BatcherConfig,
}

impl CallBatcher {
    pub fn new(client: Arc<dyn RpcClient>, config: BatcherConfig) -> Self {
        Self {
            blocks: BlockTracker::new(Arc::clone(&client)),
            client,
            config,
        }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Block the last fetch was pinned to.
    pub fn latest_block(&self) -> Option<U64> {
        self.blocks.latest()
    }

    /// Returns one outcome per request, in request order.
    pub async fn fetch(&self, requests: &[BalanceRequest]) -> Vec<Outcome> {
        if requests.is_empty() {
            return Vec::new();
        }

        let block = match self.blocks.refresh().await {
            Ok(block) => block,
            Err(e) => {
                log::warn!("unable to refresh latest block: {e}");
                let error = BatchError::from(e);
                return requests.iter().map(|_| Err(error.clone())).collect();
            }
        };

        let (batched, individual): (Vec<usize>, Vec<usize>) =
            (0..requests.len()).partition(|&idx| self.can_batch(&requests[idx]));

        let mut resolved = match self.config.capability {
            BatchCapability::Aggregator(multicall) => {
                self.aggregate(multicall, requests, &batched, block).await
            }
            BatchCapability::BalanceChecker(checker) => {
                self.check_balances(checker, requests, &batched, block).await
            }
            BatchCapability::None => Vec::new(),
        };

        resolved.extend(self.fetch_individually(requests, &individual, block).await);

        let mut outcomes: Vec<Option<Outcome>> = vec![None; requests.len()];
        for (idx, outcome) in resolved {
            outcomes[idx] = Some(outcome);
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| Err(BatchError::Unsupported("no result".into())))
            })
            .collect()
    }

    fn can_batch(&self, request: &BalanceRequest) -> bool {
        match self.config.capability {
            BatchCapability::Aggregator(_) => true,
            BatchCapability::BalanceChecker(_) => request.kind != AssetKind::Staked,
            BatchCapability::None => false,
        }
    }

    fn batch_size(&self) -> usize {
        self.config.max_batch_size.max(1)
    }

    fn concurrency(&self) -> usize {
        self.config.max_concurrency.max(1)
    }

    async fn aggregate(
        &self,
        multicall: Address,
        requests: &[BalanceRequest],
        indices: &[usize],
        block: U64,
    ) -> Vec<(usize, Outcome)> {
        let mut resolved = Vec::with_capacity(indices.len());
        let mut calls = Vec::with_capacity(indices.len());

        for &idx in indices {
            match Self::first_sub_call(multicall, &requests[idx]) {
                Ok(call) => calls.push((idx, call)),
                Err(e) => resolved.push((idx, Err(e))),
            }
        }

        let mut conversions = Vec::new();
        for (idx, outcome) in self.run_aggregated(multicall, calls, block).await {
            match (requests[idx].kind, outcome) {
                (AssetKind::Staked, Ok(shares)) if !shares.is_zero() => {
                    match Self::conversion_call(requests[idx].token, shares) {
                        Ok(call) => conversions.push((idx, call)),
                        Err(e) => resolved.push((idx, Err(e))),
                    }
                }
                (_, outcome) => resolved.push((idx, outcome)),
            }
        }

        // shares -> assets must observe the same block as the shares read
        if !conversions.is_empty() {
            resolved.extend(self.run_aggregated(multicall, conversions, block).await);
        }

        resolved
    }

    fn first_sub_call(multicall: Address, request: &BalanceRequest) -> Result<SubCall, BatchError> {
        match request.kind {
            AssetKind::Native => SubCall::new(
                multicall,
                MULTICALL3.function("getEthBalance")?,
                &[Token::Address(request.account)],
            ),
            AssetKind::Erc20 => SubCall::new(
                request.token,
                ERC20.function("balanceOf")?,
                &[Token::Address(request.account)],
            ),
            AssetKind::Staked => SubCall::new(
                request.token,
                STAKING.function("getShares")?,
                &[Token::Address(request.account)],
            ),
        }
    }

    fn conversion_call(staking_contract: Address, shares: U256) -> Result<SubCall, BatchError> {
        SubCall::new(
            staking_contract,
            STAKING.function("convertToAssets")?,
            &[Token::Uint(shares)],
        )
    }

    async fn run_aggregated(
        &self,
        multicall: Address,
        calls: Vec<(usize, SubCall)>,
        block: U64,
    ) -> Vec<(usize, Outcome)> {
        let batches: Vec<Vec<(usize, SubCall)>> = {
            let mut batches = Vec::new();
            let mut calls = calls.into_iter().peekable();

            while calls.peek().is_some() {
                batches.push(calls.by_ref().take(self.batch_size()).collect());
            }

            batches
        };

        stream::iter(batches)
            .map(|batch| async move {
                let outcomes = match self.aggregate3(multicall, &batch, block).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        log::warn!(
                            "aggregate3 call of {} items at block {block} failed: {e}",
                            batch.len()
                        );
                        batch.iter().map(|_| Err(e.clone())).collect()
                    }
                };

                batch
                    .iter()
                    .map(|(idx, _)| *idx)
                    .zip(outcomes)
                    .collect::<Vec<_>>()
            })
            .buffered(self.concurrency())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    async fn aggregate3(
        &self,
        multicall: Address,
        batch: &[(usize, SubCall)],
        block: U64,
    ) -> Result<Vec<Outcome>, BatchError> {
        let aggregate3 = MULTICALL3.function("aggregate3")?;

        let calls = batch
            .iter()
            .map(|(_, call)| {
                Token::Tuple(vec![
                    Token::Address(call.target),
                    Token::Bool(true),
                    Token::Bytes(call.data.clone()),
                ])
            })
            .collect();

        let data = aggregate3.encode_input(&[Token::Array(calls)])?;
        let response = self.client.call(multicall, data, Some(block)).await?;

        let results = aggregate3
            .decode_output(&response)?
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| BatchError::Decode("aggregate3 returned no result array".into()))?;

        if results.len() != batch.len() {
            return Err(BatchError::LengthMismatch {
                expected: batch.len(),
                got: results.len(),
            });
        }

        Ok(batch
            .iter()
            .zip(results)
            .map(|((_, call), result)| {
                let (success, data) = match result {
                    Token::Tuple(fields) => match fields.as_slice() {
                        [Token::Bool(success), Token::Bytes(data)] => (*success, data.clone()),
                        _ => return Err(BatchError::Decode("malformed aggregate3 result".into())),
                    },
                    _ => return Err(BatchError::Decode("aggregate3 result is not a tuple".into())),
                };

                if !success {
                    return Err(BatchError::Reverted);
                }

                decode_uint(call.decoder, &data)
            })
            .collect())
    }

    async fn check_balances(
        &self,
        checker: Address,
        requests: &[BalanceRequest],
        indices: &[usize],
        block: U64,
    ) -> Vec<(usize, Outcome)> {
        let chunks: Vec<Vec<usize>> = indices
            .chunks(self.batch_size())
            .map(<[usize]>::to_vec)
            .collect();

        stream::iter(chunks)
            .map(|chunk| async move {
                let outcomes = match self.balances_call(checker, requests, &chunk, block).await {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        log::warn!(
                            "balance checker call of {} items at block {block} failed: {e}",
                            chunk.len()
                        );
                        chunk.iter().map(|_| Err(e.clone())).collect()
                    }
                };

                chunk.iter().copied().zip(outcomes).collect::<Vec<_>>()
            })
            .buffered(self.concurrency())
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// The checker answers the full `users x tokens` matrix, row-major by
    /// user; every request picks its own cell.
    async fn balances_call(
        &self,
        checker: Address,
        requests: &[BalanceRequest],
        chunk: &[usize],
        block: U64,
    ) -> Result<Vec<Outcome>, BatchError> {
        let mut users: Vec<Address> = Vec::new();
        let mut tokens: Vec<Address> = Vec::new();
        let mut user_idx: HashMap<Address, usize> = HashMap::new();
        let mut token_idx: HashMap<Address, usize> = HashMap::new();

        for &idx in chunk {
            let request = &requests[idx];

            user_idx.entry(request.account).or_insert_with(|| {
                users.push(request.account);
                users.len() - 1
            });
            token_idx.entry(request.token).or_insert_with(|| {
                tokens.push(request.token);
                tokens.len() - 1
            });
        }

        let balances = BALANCE_CHECKER.function("balances")?;
        let data = balances.encode_input(&[
            Token::Array(users.iter().copied().map(Token::Address).collect()),
            Token::Array(tokens.iter().copied().map(Token::Address).collect()),
        ])?;

        let response = self.client.call(checker, data, Some(block)).await?;
        let values = balances
            .decode_output(&response)?
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .ok_or_else(|| BatchError::Decode("balances returned no array".into()))?;

        if values.len() != users.len() * tokens.len() {
            return Err(BatchError::LengthMismatch {
                expected: users.len() * tokens.len(),
                got: values.len(),
            });
        }

        Ok(chunk
            .iter()
            .map(|&idx| {
                let request = &requests[idx];
                let cell = user_idx[&request.account] * tokens.len() + token_idx[&request.token];

                values[cell]
                    .clone()
                    .into_uint()
                    .ok_or_else(|| BatchError::Decode("balances item is not uint".into()))
            })
            .collect())
    }

    async fn fetch_individually(
        &self,
        requests: &[BalanceRequest],
        indices: &[usize],
        block: U64,
    ) -> Vec<(usize, Outcome)> {
        stream::iter(indices.iter().copied())
            .map(|idx| async move { (idx, self.fetch_one(&requests[idx], block).await) })
            .buffered(self.concurrency())
            .collect()
            .await
    }

    async fn fetch_one(&self, request: &BalanceRequest, block: U64) -> Outcome {
        match request.kind {
            AssetKind::Native => Ok(self.client.native_balance(request.account, block).await?),
            AssetKind::Erc20 => {
                let call = SubCall::new(
                    request.token,
                    ERC20.function("balanceOf")?,
                    &[Token::Address(request.account)],
                )?;
                self.call_uint(call, block).await
            }
            AssetKind::Staked => {
                let shares = SubCall::new(
                    request.token,
                    STAKING.function("getShares")?,
                    &[Token::Address(request.account)],
                )?;
                let shares = self.call_uint(shares, block).await?;

                if shares.is_zero() {
                    return Ok(shares);
                }

                let assets = Self::conversion_call(request.token, shares)?;
                self.call_uint(assets, block).await
            }
        }
    }

    async fn call_uint(&self, call: SubCall, block: U64) -> Outcome {
        let response = self.client.call(call.target, call.data, Some(block)).await?;

        decode_uint(call.decoder, &response)
    }
}

#[async_trait]
impl BalanceQuerier for CallBatcher {
    async fn query_balances(&self, requests: &[BalanceRequest]) -> Vec<Outcome> {
        self.fetch(requests).await
    }
}

fn decode_uint(function: &Function, data: &[u8]) -> Outcome {
    function
        .decode_output(data)?
        .into_iter()
        .next()
        .and_then(Token::into_uint)
        .ok_or_else(|| BatchError::Decode(format!("{} returned no uint", function.name)))
}
