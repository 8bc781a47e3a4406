use crate::{
    cache::BalanceCache,
    controller::AccountDirectory,
    registry::TokenRegistryReader,
    strategies::{FetchRequest, FetchStrategy},
    types::{Address, BalanceEntry, BalanceRequest, ChainId, PseudoTokens},
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::time::timeout;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Which strategy resolved each chain in one cycle.
pub type FetchAssignment = BTreeMap<ChainId, String>;

#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub assignment: FetchAssignment,
    /// Requested chains no strategy resolved; their balances stay as they
    /// were.
    pub unresolved: Vec<ChainId>,
    /// Everything the strategies returned, including held tokens the
    /// registry does not know. Only pseudo, tracked and detected tokens are
    /// merged into the cache.
    pub results: Vec<BalanceEntry>,
    /// Cache generation the cycle started at.
    pub generation: u64,
}

/// Chains of `remaining` the strategy can serve, in order.
pub fn assign_chains(remaining: &[ChainId], strategy: &dyn FetchStrategy) -> Vec<ChainId> {
    remaining
        .iter()
        .filter(|chain_id| strategy.supports(chain_id))
        .cloned()
        .collect()
}

/// Runs fetch cycles: every requested chain goes to the highest ranked
/// strategy that supports it, and chains a strategy leaves unresolved move
/// on to the next one.
pub struct BalanceFetchOrchestrator {
    registry: Arc<dyn TokenRegistryReader>,
    strategies: Vec<Arc<dyn FetchStrategy>>,
    cache: Arc<BalanceCache>,
    pseudo: Arc<PseudoTokens>,
    accounts: Arc<dyn AccountDirectory>,
    timeout: Duration,
}

impl BalanceFetchOrchestrator {
    pub fn new(
        registry: Arc<dyn TokenRegistryReader>,
        mut strategies: Vec<Arc<dyn FetchStrategy>>,
        cache: Arc<BalanceCache>,
        pseudo: Arc<PseudoTokens>,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Self {
        // stable, so equal priorities keep their given order
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        Self {
            registry,
            strategies,
            cache,
            pseudo,
            accounts,
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn strategy_ids(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.id()).collect()
    }

    pub async fn refresh(
        &self,
        chain_ids: &[ChainId],
        accounts: &[Address],
        query_all_accounts: bool,
    ) -> FetchReport {
        let generation = self.cache.generation();
        let accounts = self.target_accounts(accounts, query_all_accounts);

        let mut remaining: Vec<ChainId> = Vec::new();
        for chain_id in chain_ids {
            if !remaining.contains(chain_id) {
                remaining.push(chain_id.clone());
            }
        }

        if accounts.is_empty() || remaining.is_empty() {
            return FetchReport {
                unresolved: remaining,
                generation,
                ..Default::default()
            };
        }

        let universe: BTreeMap<ChainId, Vec<BalanceRequest>> = remaining
            .iter()
            .map(|chain_id| (chain_id.clone(), self.requests(chain_id, &accounts)))
            .collect();

        let scope: Vec<(Address, ChainId)> = remaining
            .iter()
            .flat_map(|chain_id| accounts.iter().map(move |a| (*a, chain_id.clone())))
            .collect();

        let mut assignment = FetchAssignment::new();
        let mut results = Vec::new();

        for strategy in &self.strategies {
            if remaining.is_empty() {
                break;
            }

            let assigned = assign_chains(&remaining, strategy.as_ref());
            if assigned.is_empty() {
                continue;
            }

            let request = FetchRequest {
                chains: assigned
                    .iter()
                    .map(|chain_id| (chain_id.clone(), universe[chain_id].clone()))
                    .collect(),
            };

            let entries = self.run(strategy.as_ref(), &request).await;

            let resolved: HashSet<ChainId> = entries
                .iter()
                .filter(|e| assigned.contains(&e.chain_id))
                .map(|e| e.chain_id.clone())
                .collect();

            log::debug!(
                "strategy {} resolved {}/{} chains",
                strategy.id(),
                resolved.len(),
                assigned.len()
            );

            results.extend(
                entries
                    .into_iter()
                    .filter(|e| resolved.contains(&e.chain_id)),
            );
            for chain_id in &resolved {
                assignment.insert(chain_id.clone(), strategy.id().to_string());
            }
            remaining.retain(|chain_id| !resolved.contains(chain_id));
        }

        if !remaining.is_empty() {
            log::warn!(
                "No strategy resolved chains {}",
                remaining
                    .iter()
                    .map(ChainId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        self.cache.merge_since(generation, &scope, &self.balance_entries(&results));

        FetchReport {
            assignment,
            unresolved: remaining,
            results,
            generation,
        }
    }

    /// Entries of pseudo-tokens and of tokens the registry tracks or has
    /// detected, as of now.
    fn balance_entries(&self, results: &[BalanceEntry]) -> Vec<BalanceEntry> {
        let mut known: HashMap<(Address, ChainId), HashSet<Address>> = HashMap::new();

        results
            .iter()
            .filter(|e| {
                self.pseudo.is_pseudo(&e.chain_id, &e.token_address)
                    || known
                        .entry((e.account_address, e.chain_id.clone()))
                        .or_insert_with(|| {
                            self.registry
                                .balance_tokens(&e.chain_id, &e.account_address)
                                .into_iter()
                                .collect()
                        })
                        .contains(&e.token_address)
            })
            .cloned()
            .collect()
    }

    async fn run(&self, strategy: &dyn FetchStrategy, request: &FetchRequest) -> Vec<BalanceEntry> {
        match timeout(self.timeout, strategy.fetch(request)).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                log::warn!("Strategy {} failed: {e}", strategy.id());
                vec![]
            }
            Err(_) => {
                log::warn!(
                    "Strategy {} timed out after {:?}",
                    strategy.id(),
                    self.timeout
                );
                vec![]
            }
        }
    }

    fn target_accounts(&self, accounts: &[Address], query_all_accounts: bool) -> Vec<Address> {
        let accounts: Vec<Address> = if query_all_accounts {
            self.accounts.list_accounts()
        } else if !accounts.is_empty() {
            accounts.to_vec()
        } else {
            self.accounts.selected_account().into_iter().collect()
        };

        let mut seen = BTreeSet::new();
        accounts.into_iter().filter(|a| seen.insert(*a)).collect()
    }

    /// Pseudo-tokens first, then tracked and detected tokens.
    fn requests(&self, chain_id: &ChainId, accounts: &[Address]) -> Vec<BalanceRequest> {
        let mut requests = Vec::new();
        let mut seen = HashSet::new();

        for account in accounts {
            let tokens = self.registry.balance_tokens(chain_id, account);

            for request in self
                .pseudo
                .requests(chain_id, *account)
                .into_iter()
                .chain(
                    tokens
                        .into_iter()
                        .map(|token| self.pseudo.request(chain_id, *account, token)),
                )
            {
                if seen.insert((request.account, request.token)) {
                    requests.push(request);
                }
            }
        }

        requests
    }
}

#[cfg(test)]
mod test {
    use super::{assign_chains, BalanceFetchOrchestrator};
    use crate::{
        cache::BalanceCache,
        controller::StaticAccounts,
        registry::TokenRegistry,
        strategies::{FetchRequest, FetchStrategy, StrategyError},
        types::{Address, AssetKind, BalanceEntry, ChainId, PseudoTokens, Token, U256},
    };
    use async_trait::async_trait;
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
        time::Duration,
    };

    #[derive(Clone, Copy)]
    enum Behavior {
        Answer,
        Fail,
        Hang,
    }

    struct MockStrategy {
        id: &'static str,
        priority: u32,
        supported: HashSet<ChainId>,
        answers: HashSet<ChainId>,
        behavior: Behavior,
        calls: Mutex<Vec<FetchRequest>>,
    }

    impl MockStrategy {
        fn new(id: &'static str, priority: u32, supported: &[u64], answers: &[u64]) -> Self {
            Self {
                id,
                priority,
                supported: supported.iter().map(|c| ChainId::from(*c)).collect(),
                answers: answers.iter().map(|c| ChainId::from(*c)).collect(),
                behavior: Behavior::Answer,
                calls: Mutex::new(vec![]),
            }
        }

        fn behaving(mut self, behavior: Behavior) -> Self {
            self.behavior = behavior;
            self
        }

        fn called_chains(&self) -> Vec<Vec<ChainId>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.chain_ids().cloned().collect())
                .collect()
        }
    }

    #[async_trait]
    impl FetchStrategy for MockStrategy {
        fn id(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn supports(&self, chain_id: &ChainId) -> bool {
            self.supported.contains(chain_id)
        }

        async fn fetch(&self, request: &FetchRequest) -> Result<Vec<BalanceEntry>, StrategyError> {
            self.calls.lock().unwrap().push(request.clone());

            match self.behavior {
                Behavior::Fail => return Err(StrategyError::Other("boom".to_string())),
                Behavior::Hang => tokio::time::sleep(Duration::from_secs(10)).await,
                Behavior::Answer => {}
            }

            Ok(request
                .chains
                .iter()
                .filter(|(chain_id, _)| self.answers.contains(chain_id))
                .flat_map(|(chain_id, requests)| {
                    requests.iter().map(|r| {
                        BalanceEntry::new(r.account, chain_id.clone(), r.token, U256::from(7))
                    })
                })
                .collect())
        }
    }

    fn account() -> Address {
        Address::from_low_u64_be(0x1)
    }

    fn chains(ids: &[u64]) -> Vec<ChainId> {
        ids.iter().map(|c| ChainId::from(*c)).collect()
    }

    fn orchestrator(
        registry: Arc<TokenRegistry>,
        strategies: Vec<Arc<dyn FetchStrategy>>,
    ) -> (BalanceFetchOrchestrator, Arc<BalanceCache>) {
        let pseudo = Arc::new(PseudoTokens::new(HashMap::from([(
            ChainId::from(1),
            Address::from_low_u64_be(0x5a),
        )])));
        let cache = Arc::new(BalanceCache::new(registry.clone(), pseudo.clone()));
        let orchestrator = BalanceFetchOrchestrator::new(
            registry,
            strategies,
            cache.clone(),
            pseudo,
            Arc::new(StaticAccounts::new(vec![account()])),
        )
        .with_timeout(Duration::from_millis(50));

        (orchestrator, cache)
    }

    #[tokio::test]
    async fn unresolved_chains_cascade_to_lower_priority() {
        let a = Arc::new(MockStrategy::new("a", 100, &[1, 2], &[1]));
        let b = Arc::new(MockStrategy::new("b", 50, &[1, 2, 3], &[1, 2, 3]));
        let (orchestrator, _) = orchestrator(
            Arc::new(TokenRegistry::new()),
            vec![b.clone() as Arc<dyn FetchStrategy>, a.clone()],
        );

        let report = orchestrator.refresh(&chains(&[1, 2, 3]), &[], false).await;

        assert_eq!(orchestrator.strategy_ids(), vec!["a", "b"]);
        assert_eq!(report.assignment[&ChainId::from(1)], "a");
        assert_eq!(report.assignment[&ChainId::from(2)], "b");
        assert_eq!(report.assignment[&ChainId::from(3)], "b");
        assert!(report.unresolved.is_empty());
        assert_eq!(a.called_chains(), vec![chains(&[1, 2])]);
        assert_eq!(b.called_chains(), vec![chains(&[2, 3])]);
    }

    #[tokio::test]
    async fn timeouts_and_errors_are_absorbed() {
        let hanging =
            Arc::new(MockStrategy::new("hang", 100, &[1, 2], &[1, 2]).behaving(Behavior::Hang));
        let failing =
            Arc::new(MockStrategy::new("fail", 75, &[2], &[2]).behaving(Behavior::Fail));
        let fallback = Arc::new(MockStrategy::new("rpc", 0, &[1, 2, 3], &[1]));
        let (orchestrator, _) = orchestrator(
            Arc::new(TokenRegistry::new()),
            vec![
                hanging as Arc<dyn FetchStrategy>,
                failing.clone(),
                fallback.clone(),
            ],
        );

        let report = orchestrator.refresh(&chains(&[1, 2]), &[], false).await;

        assert_eq!(report.assignment.len(), 1);
        assert_eq!(report.assignment[&ChainId::from(1)], "rpc");
        assert_eq!(report.unresolved, chains(&[2]));
        assert_eq!(failing.called_chains(), vec![chains(&[2])]);
        assert_eq!(fallback.called_chains(), vec![chains(&[1, 2])]);
    }

    #[tokio::test]
    async fn cascade_stops_once_everything_is_resolved() {
        let a = Arc::new(MockStrategy::new("a", 100, &[1, 2], &[1, 2]));
        let b = Arc::new(MockStrategy::new("b", 50, &[1, 2], &[1, 2]));
        let (orchestrator, _) = orchestrator(
            Arc::new(TokenRegistry::new()),
            vec![a as Arc<dyn FetchStrategy>, b.clone()],
        );

        let report = orchestrator.refresh(&chains(&[1, 2]), &[], false).await;

        assert_eq!(report.assignment.len(), 2);
        assert!(b.called_chains().is_empty());
    }

    #[tokio::test]
    async fn request_universe_and_merge() {
        let registry = Arc::new(TokenRegistry::new());
        let token = Address::from_low_u64_be(0xf1);
        registry
            .add_token(&ChainId::from(1), account(), Token::new(token, "TKN", 18))
            .unwrap();
        let a = Arc::new(MockStrategy::new("a", 100, &[1, 10], &[1, 10]));
        let (orchestrator, cache) =
            orchestrator(registry, vec![a.clone() as Arc<dyn FetchStrategy>]);
        let mut events = cache.subscribe();

        let report = orchestrator.refresh(&chains(&[1, 10]), &[], true).await;

        let calls = a.calls.lock().unwrap().clone();
        let mainnet = &calls[0].chains[&ChainId::from(1)];
        assert_eq!(
            mainnet.iter().map(|r| r.kind).collect::<Vec<_>>(),
            vec![AssetKind::Native, AssetKind::Staked, AssetKind::Erc20]
        );
        assert_eq!(calls[0].chains[&ChainId::from(10)].len(), 1);
        assert_eq!(report.results.len(), 4);

        let balances = cache.get_balances(&[account()], None);
        assert_eq!(balances[&account()][&ChainId::from(1)][&token], U256::from(7));
        assert!(events.try_recv().is_ok());
    }

    #[tokio::test]
    async fn no_accounts_means_no_fetch() {
        let a = Arc::new(MockStrategy::new("a", 100, &[1], &[1]));
        let pseudo = Arc::new(PseudoTokens::default());
        let registry = Arc::new(TokenRegistry::new());
        let orchestrator = BalanceFetchOrchestrator::new(
            registry.clone(),
            vec![a.clone() as Arc<dyn FetchStrategy>],
            Arc::new(BalanceCache::new(registry, pseudo.clone())),
            pseudo,
            Arc::new(StaticAccounts::new(vec![])),
        );

        let report = orchestrator.refresh(&chains(&[1]), &[], false).await;

        assert_eq!(report.unresolved, chains(&[1]));
        assert!(a.called_chains().is_empty());
    }

    #[test]
    fn assignment_is_intersection_in_order() {
        let strategy = MockStrategy::new("a", 1, &[137, 1], &[]);

        assert_eq!(
            assign_chains(&chains(&[1, 10, 137]), &strategy),
            chains(&[1, 137])
        );
        assert!(assign_chains(&chains(&[10]), &strategy).is_empty());
    }
}
