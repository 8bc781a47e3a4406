use crate::{
    cache::{BalanceCache, BalanceCacheState},
    config::TrackerConfig,
    events::{BalanceEvent, RegistryEvent},
    orchestrator::{BalanceFetchOrchestrator, FetchReport},
    registry::{RegistryError, TokenRegistry, TokenRegistryReader, TokenSets},
    store::{FileStore, StateStore, StoreError, BALANCE_CACHE_KEY, TOKEN_SETS_KEY},
    strategies::{BalancyStrategy, FetchStrategy, RpcStrategy},
    types::{
        parse_address, parse_chain_id, Address, BalanceEntry, BalanceMap, ChainId, PseudoTokens,
        Token, TokenSet, ValidationError,
    },
};
use async_trait::async_trait;
use providers::{
    evm::{erc20::token_metadata, BalancyProvider, CallBatcher, RpcClient, Web3Client},
    BalanceQuerier,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("Request was rejected")]
    Rejected,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Source of the accounts whose balances are tracked.
pub trait AccountDirectory: Send + Sync {
    fn list_accounts(&self) -> Vec<Address>;

    fn selected_account(&self) -> Option<Address>;
}

/// Fixed account list; the first account is the selected one.
pub struct StaticAccounts {
    accounts: RwLock<Vec<Address>>,
}

impl StaticAccounts {
    pub fn new(accounts: Vec<Address>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }
}

impl AccountDirectory for StaticAccounts {
    fn list_accounts(&self) -> Vec<Address> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn selected_account(&self) -> Option<Address> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .first()
            .copied()
    }
}

/// Best-effort token metadata lookup for auto-detected tokens.
#[async_trait]
pub trait TokenMetadataSource: Send + Sync {
    async fn token_metadata(&self, chain_id: &ChainId, token: Address) -> Option<Token>;
}

/// Reads `symbol`, `decimals` and `name` from the token contract.
pub struct RpcMetadataSource {
    clients: HashMap<ChainId, Arc<dyn RpcClient>>,
}

impl RpcMetadataSource {
    pub fn new(clients: HashMap<ChainId, Arc<dyn RpcClient>>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl TokenMetadataSource for RpcMetadataSource {
    async fn token_metadata(&self, chain_id: &ChainId, token: Address) -> Option<Token> {
        let client = self.clients.get(chain_id)?;

        match token_metadata(client.as_ref(), token).await {
            Ok(metadata) => Some(Token {
                name: metadata.name,
                ..Token::new(token, &metadata.symbol, metadata.decimals)
            }),
            Err(e) => {
                log::debug!("No ERC-20 metadata for {token:#x} on chain {chain_id}: {e}");
                None
            }
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WatchAssetOptions {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    pub name: Option<String>,
    pub image: Option<String>,
}

/// A dapp's request to start tracking an asset.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct WatchAssetRequest {
    #[serde(rename = "type")]
    pub asset_type: String,
    pub options: WatchAssetOptions,
}

/// A validated watch request waiting for the user's decision.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAsset {
    pub chain_id: ChainId,
    pub account: Address,
    pub token: Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn request_approval(&self, request: &PendingAsset) -> ApprovalOutcome;
}

/// Approves everything. For surfaces where the caller already is the user.
pub struct ApproveAll;

#[async_trait]
impl ApprovalService for ApproveAll {
    async fn request_approval(&self, _request: &PendingAsset) -> ApprovalOutcome {
        ApprovalOutcome::Approved
    }
}

/// Entry point tying the registry, the cache and the fetch cycle together.
pub struct BalancesController {
    registry: Arc<TokenRegistry>,
    cache: Arc<BalanceCache>,
    orchestrator: BalanceFetchOrchestrator,
    pseudo: Arc<PseudoTokens>,
    chain_ids: RwLock<Vec<ChainId>>,
    metadata: Option<Arc<dyn TokenMetadataSource>>,
    approvals: Arc<dyn ApprovalService>,
    store: Option<Arc<dyn StateStore>>,
    /// Held from snapshot to write so overlapping saves land in order.
    persisting: Mutex<()>,
}

impl BalancesController {
    /// Restores the registry and the cache from `store` when one is given.
    pub fn new(
        chain_ids: Vec<ChainId>,
        strategies: Vec<Arc<dyn FetchStrategy>>,
        pseudo: PseudoTokens,
        accounts: Arc<dyn AccountDirectory>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Self, ControllerError> {
        let pseudo = Arc::new(pseudo);

        let token_sets: TokenSets = load(store.as_deref(), TOKEN_SETS_KEY)?.unwrap_or_default();
        let registry = Arc::new(TokenRegistry::with_state(token_sets));

        let cache_state: BalanceCacheState =
            load(store.as_deref(), BALANCE_CACHE_KEY)?.unwrap_or_default();
        let cache = Arc::new(BalanceCache::with_state(
            registry.clone(),
            pseudo.clone(),
            cache_state,
        )?);

        let orchestrator = BalanceFetchOrchestrator::new(
            registry.clone(),
            strategies,
            cache.clone(),
            pseudo.clone(),
            accounts,
        );

        Ok(Self {
            registry,
            cache,
            orchestrator,
            pseudo,
            chain_ids: RwLock::new(chain_ids),
            metadata: None,
            approvals: Arc::new(ApproveAll),
            store,
            persisting: Mutex::new(()),
        })
    }

    /// Wires RPC clients, batchers and strategies for every configured chain.
    pub fn from_config(config: &TrackerConfig) -> Result<Self, ControllerError> {
        let mut clients: HashMap<ChainId, Arc<dyn RpcClient>> = HashMap::new();
        let mut queriers: HashMap<ChainId, Arc<dyn BalanceQuerier>> = HashMap::new();
        let mut staking = HashMap::new();

        for chain in &config.chains {
            let client: Arc<dyn RpcClient> = match Web3Client::new(&chain.rpc_url) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    log::error!("Unable to create RPC client for {}: {e}", chain.name);
                    continue;
                }
            };

            queriers.insert(
                chain.chain_id.clone(),
                Arc::new(CallBatcher::new(client.clone(), chain.batcher.clone())),
            );
            clients.insert(chain.chain_id.clone(), client);

            if let Some(contract) = chain.staking_contract {
                staking.insert(chain.chain_id.clone(), contract);
            }
        }

        let mut strategies: Vec<Arc<dyn FetchStrategy>> =
            vec![Arc::new(RpcStrategy::new(queriers.clone()))];
        if config.balancy_enabled {
            strategies.push(Arc::new(BalancyStrategy::new(
                BalancyProvider::new(&config.balancy_url),
                queriers,
            )));
        }

        let store: Option<Arc<dyn StateStore>> = match &config.state_dir {
            Some(dir) => Some(Arc::new(FileStore::new(dir)?)),
            None => None,
        };

        let mut controller = Self::new(
            config.chain_ids(),
            strategies,
            PseudoTokens::new(staking),
            Arc::new(StaticAccounts::new(config.accounts.clone())),
            store,
        )?
        .with_fetch_timeout(config.fetch_timeout);

        if config.auto_detect {
            controller = controller.with_metadata_source(Arc::new(RpcMetadataSource::new(clients)));
        }

        Ok(controller)
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.orchestrator = self.orchestrator.with_timeout(timeout);
        self
    }

    /// Enables auto-detection of held tokens the registry does not know.
    pub fn with_metadata_source(mut self, metadata: Arc<dyn TokenMetadataSource>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalService>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn registry(&self) -> &Arc<TokenRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<BalanceCache> {
        &self.cache
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        self.chain_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_balances(&self) -> tokio::sync::broadcast::Receiver<BalanceEvent> {
        self.cache.subscribe()
    }

    pub fn subscribe_registry(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn get_balances(
        &self,
        accounts: &[String],
        chain_ids: Option<&[String]>,
    ) -> Result<BalanceMap, ControllerError> {
        let accounts = parse_addresses(accounts)?;
        let chain_ids = chain_ids.map(parse_chain_ids).transpose()?;

        Ok(self.cache.get_balances(&accounts, chain_ids.as_deref()))
    }

    /// One fetch cycle for `accounts` (the selected account when empty) over
    /// `chain_ids` (every configured chain when `None`).
    pub async fn refresh_balances(
        &self,
        accounts: &[String],
        chain_ids: Option<&[String]>,
    ) -> Result<FetchReport, ControllerError> {
        let accounts = parse_addresses(accounts)?;
        let chain_ids = match chain_ids {
            Some(chain_ids) => parse_chain_ids(chain_ids)?,
            None => self.chain_ids(),
        };

        Ok(self.refresh(&chain_ids, &accounts, false).await)
    }

    /// Every configured chain for every account of the directory.
    pub async fn refresh_all(&self) -> FetchReport {
        self.refresh(&self.chain_ids(), &[], true).await
    }

    async fn refresh(
        &self,
        chain_ids: &[ChainId],
        accounts: &[Address],
        query_all_accounts: bool,
    ) -> FetchReport {
        let report = self
            .orchestrator
            .refresh(chain_ids, accounts, query_all_accounts)
            .await;

        log::info!(
            "Refreshed {} chains, {} unresolved, {} balances",
            report.assignment.len(),
            report.unresolved.len(),
            report.results.len()
        );

        self.detect_tokens(&report).await;
        self.persist();

        report
    }

    /// Moves held tokens the registry has never seen into `detected` and
    /// caches their balances.
    async fn detect_tokens(&self, report: &FetchReport) {
        let metadata = match &self.metadata {
            Some(metadata) => metadata,
            None => return,
        };

        let mut unknown: BTreeMap<(ChainId, Address), Vec<Address>> = BTreeMap::new();
        for entry in &report.results {
            if entry.success
                && !entry.amount.is_zero()
                && !self.pseudo.is_pseudo(&entry.chain_id, &entry.token_address)
                && !self.registry.is_known(
                    &entry.chain_id,
                    &entry.account_address,
                    &entry.token_address,
                )
            {
                unknown
                    .entry((entry.chain_id.clone(), entry.account_address))
                    .or_default()
                    .push(entry.token_address);
            }
        }

        for ((chain_id, account), tokens) in unknown {
            if self.cache.removed_since(report.generation, &account, &chain_id) {
                continue;
            }

            let mut detected = Vec::new();
            for token in tokens {
                match metadata.token_metadata(&chain_id, token).await {
                    Some(token) if token.validate().is_ok() => detected.push(token),
                    _ => log::debug!("Skipping undescribed token {token:#x} on chain {chain_id}"),
                }
            }

            if detected.is_empty() {
                continue;
            }

            match self
                .registry
                .add_detected_tokens(&chain_id, account, detected)
            {
                Ok(kept) if !kept.is_empty() => {
                    log::info!(
                        "Detected {} new tokens for {account:#x} on chain {chain_id}",
                        kept.len()
                    );

                    let entries: Vec<BalanceEntry> = report
                        .results
                        .iter()
                        .filter(|e| {
                            e.chain_id == chain_id
                                && e.account_address == account
                                && kept.contains(&e.token_address)
                        })
                        .cloned()
                        .collect();
                    self.cache.merge_since(report.generation, &[], &entries);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Unable to store detected tokens: {e}"),
            }
        }
    }

    pub fn token_set(&self, chain_id: &str, account: &str) -> Result<TokenSet, ControllerError> {
        Ok(self
            .registry
            .token_set(&parse_chain_id(chain_id)?, &parse_address(account)?))
    }

    pub fn add_tokens(
        &self,
        chain_id: &str,
        account: &str,
        tokens: Vec<Token>,
    ) -> Result<(), ControllerError> {
        self.registry
            .add_tokens(&parse_chain_id(chain_id)?, parse_address(account)?, tokens)?;
        self.persist();

        Ok(())
    }

    pub fn ignore_tokens(
        &self,
        chain_id: &str,
        account: &str,
        addresses: &[String],
    ) -> Result<(), ControllerError> {
        self.registry.ignore_tokens(
            &parse_chain_id(chain_id)?,
            parse_address(account)?,
            &parse_addresses(addresses)?,
        )?;
        self.persist();

        Ok(())
    }

    pub fn clear_ignored_tokens(&self) {
        self.registry.clear_ignored_tokens();
        self.persist();
    }

    /// Validates the request, asks for approval and tracks the token.
    pub async fn watch_asset(
        &self,
        chain_id: &str,
        account: &str,
        request: WatchAssetRequest,
    ) -> Result<(), ControllerError> {
        if request.asset_type != "ERC20" {
            return Err(ValidationError::UnsupportedAssetType(request.asset_type).into());
        }

        let options = request.options;
        let token = Token {
            name: options.name,
            image: options.image,
            ..Token::new(
                parse_address(&options.address)?,
                options.symbol.trim(),
                options.decimals,
            )
        };
        token.validate()?;

        let pending = PendingAsset {
            chain_id: parse_chain_id(chain_id)?,
            account: parse_address(account)?,
            token,
        };

        match self.approvals.request_approval(&pending).await {
            ApprovalOutcome::Approved => {
                self.registry
                    .add_token(&pending.chain_id, pending.account, pending.token)?;
                self.persist();
                Ok(())
            }
            ApprovalOutcome::Rejected => Err(ControllerError::Rejected),
        }
    }

    /// Purges every token list and balance of `account`.
    pub fn on_account_removed(&self, account: &Address) {
        self.registry.remove_account(account);
        self.cache.remove_account(account);
        self.persist();
    }

    /// Purges the chain and stops refreshing it.
    pub fn on_chain_removed(&self, chain_id: &ChainId) {
        self.chain_ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| c != chain_id);
        self.registry.remove_chain(chain_id);
        self.cache.remove_chain(chain_id);
        self.persist();
    }

    /// Refreshes everything every `interval`, starting immediately.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                controller.refresh_all().await;
            }
        })
    }

    /// Refreshes the affected chain, and only that, after each registry
    /// change.
    pub fn spawn_registry_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        let mut events = self.registry.subscribe();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Registry listener skipped {skipped} events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let chain_id = match event.chain_id() {
                    Some(chain_id) if controller.chain_ids().contains(chain_id) => chain_id,
                    _ => continue,
                };

                let accounts: Vec<Address> = event.account().into_iter().collect();
                controller
                    .refresh(std::slice::from_ref(chain_id), &accounts, false)
                    .await;
            }
        })
    }

    fn persist(&self) {
        let store = match &self.store {
            Some(store) => store,
            None => return,
        };

        let _persisting = self
            .persisting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Err(e) = save(store.as_ref(), TOKEN_SETS_KEY, &self.registry.snapshot())
            .and_then(|_| save(store.as_ref(), BALANCE_CACHE_KEY, &self.cache.snapshot()))
        {
            log::error!("Unable to persist state: {e}");
        }
    }
}

fn load<T: for<'de> Deserialize<'de>>(
    store: Option<&dyn StateStore>,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.map(|store| store.get(key)).transpose()?.flatten() {
        Some(value) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

fn save<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<(), StoreError> {
    store.set(key, &serde_json::to_string(value)?)
}

fn parse_addresses(addresses: &[String]) -> Result<Vec<Address>, ValidationError> {
    addresses.iter().map(|a| parse_address(a)).collect()
}

fn parse_chain_ids(chain_ids: &[String]) -> Result<Vec<ChainId>, ValidationError> {
    chain_ids.iter().map(|c| parse_chain_id(c)).collect()
}

#[cfg(test)]
mod test {
    use super::{
        ApprovalOutcome, ApprovalService, BalancesController, ControllerError, PendingAsset,
        StaticAccounts, TokenMetadataSource, WatchAssetOptions, WatchAssetRequest,
    };
    use crate::{
        events::BalanceEvent,
        store::{MemoryStore, StateStore, StoreError, BALANCE_CACHE_KEY, TOKEN_SETS_KEY},
        strategies::{FetchRequest, FetchStrategy, StrategyError},
        types::{to_checksum, Address, BalanceEntry, ChainId, PseudoTokens, Token, U256},
    };
    use async_trait::async_trait;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    /// Answers every request with 5 and reports `extra` as held on every
    /// chain.
    struct MockStrategy {
        extra: Option<Address>,
    }

    #[async_trait]
    impl FetchStrategy for MockStrategy {
        fn id(&self) -> &str {
            "mock"
        }

        fn priority(&self) -> u32 {
            1
        }

        fn supports(&self, _chain_id: &ChainId) -> bool {
            true
        }

        async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError> {
            let mut entries = Vec::new();

            for (chain_id, requests) in &request.chains {
                for r in requests {
                    entries.push(BalanceEntry::new(
                        r.account,
                        chain_id.clone(),
                        r.token,
                        U256::from(5),
                    ));
                }
                if let (Some(extra), Some(r)) = (self.extra, requests.first()) {
                    entries.push(BalanceEntry::new(
                        r.account,
                        chain_id.clone(),
                        extra,
                        U256::from(9),
                    ));
                }
            }

            Ok(entries)
        }
    }

    /// Answers 5 for every request after `delay`.
    struct SlowStrategy {
        delay: Duration,
    }

    #[async_trait]
    impl FetchStrategy for SlowStrategy {
        fn id(&self) -> &str {
            "slow"
        }

        fn priority(&self) -> u32 {
            1
        }

        fn supports(&self, _chain_id: &ChainId) -> bool {
            true
        }

        async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError> {
            tokio::time::sleep(self.delay).await;

            Ok(request
                .chains
                .iter()
                .flat_map(|(chain_id, requests)| {
                    requests.iter().map(|r| {
                        BalanceEntry::new(r.account, chain_id.clone(), r.token, U256::from(5))
                    })
                })
                .collect())
        }
    }

    /// Records the order of writes; each write takes a moment.
    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<String>>,
    }

    impl StateStore for RecordingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn set(&self, key: &str, _value: &str) -> Result<(), StoreError> {
            std::thread::sleep(Duration::from_millis(2));
            self.writes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    struct MockMetadata;

    #[async_trait]
    impl TokenMetadataSource for MockMetadata {
        async fn token_metadata(&self, _chain_id: &ChainId, token: Address) -> Option<Token> {
            Some(Token::new(token, "HELD", 6))
        }
    }

    struct Reject;

    #[async_trait]
    impl ApprovalService for Reject {
        async fn request_approval(&self, _request: &PendingAsset) -> ApprovalOutcome {
            ApprovalOutcome::Rejected
        }
    }

    fn account() -> Address {
        Address::from_low_u64_be(0x1)
    }

    fn token() -> Address {
        Address::from_low_u64_be(0xf1)
    }

    fn controller_with(
        extra: Option<Address>,
        store: Option<Arc<dyn StateStore>>,
    ) -> BalancesController {
        BalancesController::new(
            vec![ChainId::from(1), ChainId::from(137)],
            vec![Arc::new(MockStrategy { extra }) as Arc<dyn FetchStrategy>],
            PseudoTokens::default(),
            Arc::new(StaticAccounts::new(vec![account()])),
            store,
        )
        .unwrap()
        .with_fetch_timeout(Duration::from_secs(1))
    }

    fn watch(asset_type: &str, address: Address) -> WatchAssetRequest {
        WatchAssetRequest {
            asset_type: asset_type.to_string(),
            options: WatchAssetOptions {
                address: to_checksum(&address),
                symbol: "TKN".to_string(),
                decimals: 18,
                name: None,
                image: Some("https://token.example/logo.png".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn removed_account_has_no_balances() {
        let controller = controller_with(None, None);
        let account = to_checksum(&account());

        controller.refresh_balances(&[], None).await.unwrap();
        assert_eq!(
            controller.get_balances(&[account.clone()], None).unwrap().len(),
            1
        );

        controller.on_account_removed(&self::account());

        assert!(controller.get_balances(&[account], None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_chain_is_no_longer_refreshed() {
        let controller = controller_with(None, None);
        controller.refresh_balances(&[], None).await.unwrap();

        controller.on_chain_removed(&ChainId::from(137));
        let report = controller.refresh_all().await;

        assert_eq!(controller.chain_ids(), vec![ChainId::from(1)]);
        assert_eq!(report.assignment.len(), 1);
        let balances = controller
            .get_balances(&[to_checksum(&account())], None)
            .unwrap();
        assert!(!balances[&account()].contains_key(&ChainId::from(137)));
    }

    #[tokio::test]
    async fn watch_asset_flow() {
        let controller = controller_with(None, None);
        let account = to_checksum(&account());

        let unsupported = controller.watch_asset("0x1", &account, watch("ERC721", token())).await;
        assert!(matches!(unsupported, Err(ControllerError::Validation(_))));

        let zero = controller
            .watch_asset("0x1", &account, watch("ERC20", Address::zero()))
            .await;
        assert!(matches!(zero, Err(ControllerError::Validation(_))));

        controller
            .watch_asset("1", &account, watch("ERC20", token()))
            .await
            .unwrap();
        let set = controller.token_set("0x1", &account).unwrap();
        assert_eq!(set.tracked().len(), 1);
        assert_eq!(
            set.tracked()[0].image.as_deref(),
            Some("https://token.example/logo.png")
        );

        let rejecting = controller_with(None, None).with_approvals(Arc::new(Reject));
        let rejected = rejecting.watch_asset("0x1", &account, watch("ERC20", token())).await;
        assert!(matches!(rejected, Err(ControllerError::Rejected)));
        assert!(rejecting.token_set("0x1", &account).unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_unknown_tokens_are_detected() {
        let held = Address::from_low_u64_be(0xd1);
        let controller =
            controller_with(Some(held), None).with_metadata_source(Arc::new(MockMetadata));
        let account = to_checksum(&account());
        controller
            .ignore_tokens("0x89", &account, &[to_checksum(&held)])
            .unwrap();

        controller.refresh_balances(&[], None).await.unwrap();

        let mainnet = controller.token_set("0x1", &account).unwrap();
        assert_eq!(mainnet.detected().len(), 1);
        assert_eq!(mainnet.detected()[0].symbol, "HELD");
        let polygon = controller.token_set("0x89", &account).unwrap();
        assert!(polygon.detected().is_empty());
        assert!(polygon.is_ignored(&held));

        let balances = controller.get_balances(&[account], None).unwrap();
        let balances = &balances[&self::account()];
        assert_eq!(balances[&ChainId::from(1)][&held], U256::from(9));
        assert!(!balances[&ChainId::from(137)].contains_key(&held));
    }

    #[tokio::test]
    async fn ignored_and_unknown_tokens_are_not_cached() {
        let held = Address::from_low_u64_be(0xd1);
        let controller = controller_with(Some(held), None);
        let account = to_checksum(&account());
        controller
            .ignore_tokens("0x89", &account, &[to_checksum(&held)])
            .unwrap();

        let report = controller.refresh_balances(&[], None).await.unwrap();

        assert!(report.results.iter().any(|e| e.token_address == held));
        let balances = controller.get_balances(&[account.clone()], None).unwrap();
        let balances = &balances[&self::account()];
        assert!(!balances[&ChainId::from(137)].contains_key(&held));
        assert!(!balances[&ChainId::from(1)].contains_key(&held));
        assert!(controller.token_set("0x1", &account).unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_during_a_refresh_sticks() {
        let controller = Arc::new(
            BalancesController::new(
                vec![ChainId::from(1)],
                vec![Arc::new(SlowStrategy {
                    delay: Duration::from_millis(200),
                }) as Arc<dyn FetchStrategy>],
                PseudoTokens::default(),
                Arc::new(StaticAccounts::new(vec![account()])),
                None,
            )
            .unwrap(),
        );

        let refresh = tokio::spawn({
            let controller = controller.clone();
            async move { controller.refresh_balances(&[], None).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.on_account_removed(&account());
        let report = refresh.await.unwrap().unwrap();

        assert!(!report.results.is_empty());
        assert!(controller
            .get_balances(&[to_checksum(&account())], None)
            .unwrap()
            .is_empty());

        controller.refresh_balances(&[], None).await.unwrap();
        assert_eq!(
            controller
                .get_balances(&[to_checksum(&account())], None)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn overlapping_saves_write_whole_snapshots() {
        let store = Arc::new(RecordingStore::default());
        let controller = controller_with(None, Some(store.clone() as Arc<dyn StateStore>));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| controller.clear_ignored_tokens());
            }
        });

        let writes = store.writes.lock().unwrap();
        assert_eq!(writes.len(), 8);
        for pair in writes.chunks(2) {
            assert_eq!(pair, [TOKEN_SETS_KEY, BALANCE_CACHE_KEY]);
        }
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let account = to_checksum(&account());

        let controller = controller_with(None, Some(store.clone()));
        controller
            .add_tokens("0x1", &account, vec![Token::new(token(), "TKN", 18)])
            .unwrap();
        controller.refresh_balances(&[], None).await.unwrap();
        assert!(store.get(TOKEN_SETS_KEY).unwrap().is_some());

        let restarted = controller_with(None, Some(store));
        assert_eq!(
            restarted.token_set("0x1", &account).unwrap().tracked().len(),
            1
        );
        assert_eq!(
            restarted.get_balances(&[account], None).unwrap()[&self::account()]
                [&ChainId::from(1)][&token()],
            U256::from(5)
        );
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let controller = controller_with(None, None);

        assert!(controller.get_balances(&["0x12".to_string()], None).is_err());
        assert!(controller
            .refresh_balances(&[], Some(&["".to_string()]))
            .await
            .is_err());
        assert!(controller
            .add_tokens(
                "0x1",
                &to_checksum(&account()),
                vec![Token::new(token(), "", 18)]
            )
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registry_changes_refresh_the_affected_chain() {
        let controller = Arc::new(controller_with(None, None));
        let mut balances = controller.subscribe_balances();
        let listener = controller.spawn_registry_listener();

        controller
            .add_tokens(
                "0x89",
                &to_checksum(&account()),
                vec![Token::new(token(), "TKN", 18)],
            )
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(BalanceEvent::BalanceChanged {
                    chain_id,
                    token_address,
                    ..
                }) = balances.recv().await
                {
                    if token_address == token() {
                        return chain_id;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(event, ChainId::from(137));
        assert!(!controller
            .get_balances(&[to_checksum(&account())], None)
            .unwrap()[&account()]
            .contains_key(&ChainId::from(1)));

        listener.abort();
    }
}
