use crate::{
    events::{BalanceEvent, EVENT_CHANNEL_CAPACITY},
    registry::TokenRegistryReader,
    types::{
        hex_amount, Address, AssetKind, BalanceEntry, BalanceMap, ChainBalances, ChainId,
        PseudoTokens, ValidationError, U256,
    },
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tokio::sync::broadcast;

/// Persisted form: `account -> chain -> token -> fixed-width hex amount`.
pub type BalanceCacheState = BTreeMap<Address, BTreeMap<ChainId, BTreeMap<Address, String>>>;

#[derive(Default)]
struct CacheState {
    accounts: HashMap<Address, Arc<ChainBalances>>,
    /// Bumped by every removal.
    generation: u64,
    removed_accounts: HashMap<Address, u64>,
    removed_chains: HashMap<ChainId, u64>,
}

impl CacheState {
    fn removed_since(&self, generation: u64, account: &Address, chain_id: &ChainId) -> bool {
        self.removed_accounts
            .get(account)
            .map_or(false, |removed| *removed > generation)
            || self
                .removed_chains
                .get(chain_id)
                .map_or(false, |removed| *removed > generation)
    }
}

/// Account balances, copy-on-write per account: readers holding an
/// `Arc<ChainBalances>` keep their snapshot while a merge replaces it.
///
/// Removals are remembered by generation, so a fetch cycle started before an
/// account or chain was removed cannot bring its balances back.
pub struct BalanceCache {
    state: RwLock<CacheState>,
    registry: Arc<dyn TokenRegistryReader>,
    pseudo: Arc<PseudoTokens>,
    events: broadcast::Sender<BalanceEvent>,
}

impl BalanceCache {
    pub fn new(registry: Arc<dyn TokenRegistryReader>, pseudo: Arc<PseudoTokens>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state: RwLock::new(CacheState::default()),
            registry,
            pseudo,
            events,
        }
    }

    pub fn with_state(
        registry: Arc<dyn TokenRegistryReader>,
        pseudo: Arc<PseudoTokens>,
        state: BalanceCacheState,
    ) -> Result<Self, ValidationError> {
        let mut restored = HashMap::new();

        for (account, chains) in state {
            let mut balances = ChainBalances::new();
            for (chain_id, tokens) in chains {
                let tokens = tokens
                    .into_iter()
                    .map(|(token, amount)| Ok((token, hex_amount::decode(&amount)?)))
                    .collect::<Result<_, ValidationError>>()?;
                balances.insert(chain_id, tokens);
            }
            restored.insert(account, Arc::new(balances));
        }

        let cache = Self::new(registry, pseudo);
        cache.write().accounts = restored;

        Ok(cache)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceEvent> {
        self.events.subscribe()
    }

    /// Current removal generation. Take it before fetching and hand it to
    /// [`BalanceCache::merge_since`].
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Whether `account` or `chain_id` was removed after `generation`.
    pub fn removed_since(&self, generation: u64, account: &Address, chain_id: &ChainId) -> bool {
        self.read().removed_since(generation, account, chain_id)
    }

    /// Merges `results`, scoped to the account/chain pairs they mention.
    pub fn merge(&self, results: &[BalanceEntry]) -> Vec<BalanceEvent> {
        self.merge_scoped(&[], results)
    }

    pub fn merge_scoped(
        &self,
        scope: &[(Address, ChainId)],
        results: &[BalanceEntry],
    ) -> Vec<BalanceEvent> {
        self.apply(None, scope, results)
    }

    /// Seeds zero balances for the tracked and detected tokens of every pair
    /// in `scope` (and of every pair `results` mention), applies the
    /// successful entries and publishes one event per changed amount.
    ///
    /// Pairs whose account or chain was removed after `generation` are
    /// skipped.
    pub fn merge_since(
        &self,
        generation: u64,
        scope: &[(Address, ChainId)],
        results: &[BalanceEntry],
    ) -> Vec<BalanceEvent> {
        self.apply(Some(generation), scope, results)
    }

    fn apply(
        &self,
        generation: Option<u64>,
        scope: &[(Address, ChainId)],
        results: &[BalanceEntry],
    ) -> Vec<BalanceEvent> {
        let pairs: BTreeSet<(Address, ChainId)> = scope
            .iter()
            .cloned()
            .chain(
                results
                    .iter()
                    .map(|e| (e.account_address, e.chain_id.clone())),
            )
            .collect();

        // registry lock is taken and released before the cache lock
        let seeds: Vec<(Address, ChainId, Vec<Address>)> = pairs
            .into_iter()
            .map(|(account, chain_id)| {
                let tokens = self.registry.balance_tokens(&chain_id, &account);
                (account, chain_id, tokens)
            })
            .collect();

        let mut events = Vec::new();
        let mut stale = 0;
        {
            let mut state = self.write();
            let removed = |state: &CacheState, account: &Address, chain_id: &ChainId| {
                generation.map_or(false, |g| state.removed_since(g, account, chain_id))
            };

            for (account, chain_id, tokens) in seeds {
                if removed(&*state, &account, &chain_id) {
                    continue;
                }

                let balances = Arc::make_mut(state.accounts.entry(account).or_default());
                let chain = balances.entry(chain_id).or_default();

                for token in tokens {
                    chain.entry(token).or_insert_with(U256::zero);
                }
            }

            for entry in results.iter().filter(|e| e.success) {
                if removed(&*state, &entry.account_address, &entry.chain_id) {
                    stale += 1;
                    continue;
                }

                let balances =
                    Arc::make_mut(state.accounts.entry(entry.account_address).or_default());
                let previous = balances
                    .entry(entry.chain_id.clone())
                    .or_default()
                    .insert(entry.token_address, entry.amount)
                    .unwrap_or_default();

                if previous != entry.amount {
                    self.change_events(entry, previous, &mut events);
                }
            }
        }

        for event in &events {
            let _ = self.events.send(event.clone());
        }

        if stale > 0 {
            log::debug!("dropped {stale} balances of removed accounts or chains");
        }
        if !events.is_empty() {
            log::debug!("balance cache merged {} changes", events.len());
        }

        events
    }

    fn change_events(&self, entry: &BalanceEntry, previous: U256, events: &mut Vec<BalanceEvent>) {
        events.push(BalanceEvent::BalanceChanged {
            account: entry.account_address,
            chain_id: entry.chain_id.clone(),
            token_address: entry.token_address,
            previous_amount: previous,
            new_amount: entry.amount,
        });

        match self.pseudo.kind(&entry.chain_id, &entry.token_address) {
            AssetKind::Native => events.push(BalanceEvent::NativeBalanceChanged {
                account: entry.account_address,
                chain_id: entry.chain_id.clone(),
                new_amount: entry.amount,
            }),
            AssetKind::Staked => events.push(BalanceEvent::StakedBalanceChanged {
                account: entry.account_address,
                chain_id: entry.chain_id.clone(),
                staking_contract: entry.token_address,
                new_amount: entry.amount,
            }),
            AssetKind::Erc20 => {}
        }
    }

    /// Read-only view of `accounts`, optionally restricted to `chain_ids`.
    /// Unknown accounts are left out.
    pub fn get_balances(&self, accounts: &[Address], chain_ids: Option<&[ChainId]>) -> BalanceMap {
        let state = self.read();

        accounts
            .iter()
            .filter_map(|account| {
                let balances = state.accounts.get(account)?;
                let chains: ChainBalances = balances
                    .iter()
                    .filter(|(chain_id, _)| chain_ids.map_or(true, |ids| ids.contains(*chain_id)))
                    .map(|(chain_id, tokens)| (chain_id.clone(), tokens.clone()))
                    .collect();

                Some((*account, chains))
            })
            .collect()
    }

    pub fn account_balances(&self, account: &Address) -> Option<Arc<ChainBalances>> {
        self.read().accounts.get(account).cloned()
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.read().accounts.keys().copied().collect()
    }

    pub fn remove_account(&self, account: &Address) -> bool {
        let removed = {
            let mut state = self.write();
            state.generation += 1;
            let generation = state.generation;
            state.removed_accounts.insert(*account, generation);
            state.accounts.remove(account).is_some()
        };

        if removed {
            let _ = self
                .events
                .send(BalanceEvent::AccountBalancesCleared { account: *account });
        }

        removed
    }

    pub fn remove_chain(&self, chain_id: &ChainId) -> bool {
        let removed = {
            let mut state = self.write();
            state.generation += 1;
            let generation = state.generation;
            state.removed_chains.insert(chain_id.clone(), generation);

            let mut removed = false;
            for balances in state.accounts.values_mut() {
                if balances.contains_key(chain_id) {
                    Arc::make_mut(balances).remove(chain_id);
                    removed = true;
                }
            }

            state.accounts.retain(|_, balances| !balances.is_empty());
            removed
        };

        if removed {
            let _ = self.events.send(BalanceEvent::ChainBalancesCleared {
                chain_id: chain_id.clone(),
            });
        }

        removed
    }

    pub fn snapshot(&self) -> BalanceCacheState {
        self.read()
            .accounts
            .iter()
            .map(|(account, chains)| {
                let chains = chains
                    .iter()
                    .map(|(chain_id, tokens)| {
                        let tokens = tokens
                            .iter()
                            .map(|(token, amount)| (*token, hex_amount::encode(amount)))
                            .collect();
                        (chain_id.clone(), tokens)
                    })
                    .collect();
                (*account, chains)
            })
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
