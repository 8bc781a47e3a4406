use crate::{
    events::{RegistryEvent, EVENT_CHANNEL_CAPACITY},
    types::{Address, ChainId, Token, TokenSet, ValidationError, NATIVE_TOKEN},
};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use tokio::sync::broadcast;

/// `chain -> account -> tokens`
pub type TokenSets = HashMap<ChainId, HashMap<Address, TokenSet>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Read access to the registry for components that only need to know which
/// tokens want balances.
pub trait TokenRegistryReader: Send + Sync {
    /// Tracked then detected token addresses.
    fn balance_tokens(&self, chain_id: &ChainId, account: &Address) -> Vec<Address>;

    /// Whether the token is tracked, ignored or detected.
    fn is_known(&self, chain_id: &ChainId, account: &Address, token: &Address) -> bool;

    fn accounts(&self, chain_id: &ChainId) -> Vec<Address>;
}

/// Per-chain, per-account token lists.
///
/// One mutex guards the whole structure and is held for the full
/// read-modify-write of every operation; events are published after it is
/// released.
pub struct TokenRegistry {
    state: Mutex<TokenSets>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::with_state(TokenSets::new())
    }

    pub fn with_state(state: TokenSets) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            state: Mutex::new(state),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn add_token(
        &self,
        chain_id: &ChainId,
        account: Address,
        token: Token,
    ) -> Result<(), RegistryError> {
        self.add_tokens(chain_id, account, vec![token])
    }

    pub fn add_tokens(
        &self,
        chain_id: &ChainId,
        account: Address,
        tokens: Vec<Token>,
    ) -> Result<(), RegistryError> {
        validate_account(&account)?;
        for token in &tokens {
            token.validate()?;
        }

        if tokens.is_empty() {
            return Ok(());
        }

        let addresses = tokens.iter().map(|t| t.address).collect();

        self.update(chain_id, account, |set| {
            for token in tokens {
                set.track(token);
            }
        });

        self.publish(RegistryEvent::TokensAdded {
            chain_id: chain_id.clone(),
            account,
            addresses,
        });

        Ok(())
    }

    pub fn ignore_tokens(
        &self,
        chain_id: &ChainId,
        account: Address,
        addresses: &[Address],
    ) -> Result<(), RegistryError> {
        validate_account(&account)?;
        if addresses.contains(&NATIVE_TOKEN) {
            return Err(ValidationError::ZeroAddress("Token").into());
        }

        if addresses.is_empty() {
            return Ok(());
        }

        self.update(chain_id, account, |set| {
            for address in addresses {
                set.ignore(*address);
            }
        });

        self.publish(RegistryEvent::TokensIgnored {
            chain_id: chain_id.clone(),
            account,
            addresses: addresses.to_vec(),
        });

        Ok(())
    }

    /// Returns the addresses that were kept, i.e. not dropped for being
    /// ignored.
    pub fn add_detected_tokens(
        &self,
        chain_id: &ChainId,
        account: Address,
        tokens: Vec<Token>,
    ) -> Result<Vec<Address>, RegistryError> {
        validate_account(&account)?;
        for token in &tokens {
            token.validate()?;
        }

        let kept = self.update(chain_id, account, |set| {
            tokens
                .into_iter()
                .filter_map(|token| {
                    let address = token.address;
                    set.detect(token).then_some(address)
                })
                .collect::<Vec<_>>()
        });

        if !kept.is_empty() {
            self.publish(RegistryEvent::TokensDetected {
                chain_id: chain_id.clone(),
                account,
                addresses: kept.clone(),
            });
        }

        Ok(kept)
    }

    pub fn clear_ignored_tokens(&self) {
        {
            let mut state = self.lock();

            for sets in state.values_mut() {
                for set in sets.values_mut() {
                    set.clear_ignored();
                }
            }

            prune(&mut state);
        }

        self.publish(RegistryEvent::IgnoredTokensCleared);
    }

    /// Returns whether anything was removed.
    pub fn remove_account(&self, account: &Address) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state
                .values_mut()
                .fold(false, |removed, sets| sets.remove(account).is_some() || removed);

            prune(&mut state);
            removed
        };

        self.publish(RegistryEvent::AccountRemoved { account: *account });

        removed
    }

    /// Returns whether anything was removed.
    pub fn remove_chain(&self, chain_id: &ChainId) -> bool {
        let removed = self.lock().remove(chain_id).is_some();

        self.publish(RegistryEvent::ChainRemoved {
            chain_id: chain_id.clone(),
        });

        removed
    }

    pub fn token_set(&self, chain_id: &ChainId, account: &Address) -> TokenSet {
        self.lock()
            .get(chain_id)
            .and_then(|sets| sets.get(account))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut chain_ids: Vec<ChainId> = self.lock().keys().cloned().collect();
        chain_ids.sort();
        chain_ids
    }

    pub fn snapshot(&self) -> TokenSets {
        self.lock().clone()
    }

    fn update<R>(
        &self,
        chain_id: &ChainId,
        account: Address,
        f: impl FnOnce(&mut TokenSet) -> R,
    ) -> R {
        let mut state = self.lock();
        let result = f(state
            .entry(chain_id.clone())
            .or_default()
            .entry(account)
            .or_default());

        prune(&mut state);
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TokenSets> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: RegistryEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl TokenRegistryReader for TokenRegistry {
    fn balance_tokens(&self, chain_id: &ChainId, account: &Address) -> Vec<Address> {
        self.lock()
            .get(chain_id)
            .and_then(|sets| sets.get(account))
            .map(|set| set.balance_tokens().collect())
            .unwrap_or_default()
    }

    fn is_known(&self, chain_id: &ChainId, account: &Address, token: &Address) -> bool {
        self.lock()
            .get(chain_id)
            .and_then(|sets| sets.get(account))
            .map_or(false, |set| set.contains(token))
    }

    fn accounts(&self, chain_id: &ChainId) -> Vec<Address> {
        self.lock()
            .get(chain_id)
            .map(|sets| sets.keys().copied().collect())
            .unwrap_or_default()
    }
}

fn validate_account(account: &Address) -> Result<(), ValidationError> {
    if *account == NATIVE_TOKEN {
        return Err(ValidationError::ZeroAddress("Account"));
    }

    Ok(())
}

fn prune(state: &mut TokenSets) {
    for sets in state.values_mut() {
        sets.retain(|_, set| !set.is_empty());
    }
    state.retain(|_, sets| !sets.is_empty());
}

#[cfg(test)]
mod test {
    use super::{RegistryError, TokenRegistry, TokenRegistryReader};
    use crate::{
        events::RegistryEvent,
        types::{Address, ChainId, Token, TokenSet, ValidationError},
    };
    use std::{collections::HashSet, sync::Arc};

    fn account() -> Address {
        Address::from_low_u64_be(0x1)
    }

    fn chain() -> ChainId {
        ChainId::from(1)
    }

    fn token(n: u64) -> Token {
        Token::new(Address::from_low_u64_be(0xf000 + n), &format!("T{n}"), 18)
    }

    fn assert_disjoint(set: &TokenSet) {
        let tracked: HashSet<Address> = set.tracked().iter().map(|t| t.address).collect();
        let detected: HashSet<Address> = set.detected().iter().map(|t| t.address).collect();
        let ignored: HashSet<Address> = set.ignored().iter().copied().collect();

        assert_eq!(tracked.len(), set.tracked().len());
        assert_eq!(detected.len(), set.detected().len());
        assert_eq!(ignored.len(), set.ignored().len());
        assert!(tracked.is_disjoint(&detected));
        assert!(tracked.is_disjoint(&ignored));
        assert!(detected.is_disjoint(&ignored));
    }

    #[test]
    fn lists_stay_disjoint_under_any_sequence() {
        let registry = TokenRegistry::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..2000 {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let token = token((seed >> 33) % 5);

            match (seed >> 60) % 4 {
                0 => registry.add_token(&chain(), account(), token).unwrap(),
                1 => registry
                    .ignore_tokens(&chain(), account(), &[token.address])
                    .unwrap(),
                2 => {
                    registry
                        .add_detected_tokens(&chain(), account(), vec![token])
                        .unwrap();
                }
                _ => registry
                    .add_tokens(&chain(), account(), vec![token.clone(), token])
                    .unwrap(),
            }

            assert_disjoint(&registry.token_set(&chain(), &account()));
        }
    }

    #[test]
    fn ignore_is_idempotent() {
        let registry = TokenRegistry::new();
        registry.add_token(&chain(), account(), token(1)).unwrap();

        registry
            .ignore_tokens(&chain(), account(), &[token(1).address])
            .unwrap();
        let once = registry.token_set(&chain(), &account());
        registry
            .ignore_tokens(&chain(), account(), &[token(1).address])
            .unwrap();

        assert_eq!(registry.token_set(&chain(), &account()), once);
        assert_eq!(once.ignored(), &[token(1).address]);
        assert!(once.tracked().is_empty());
    }

    #[test]
    fn add_ignore_add_restores_tracked() {
        let registry = TokenRegistry::new();

        registry.add_token(&chain(), account(), token(1)).unwrap();
        registry
            .ignore_tokens(&chain(), account(), &[token(1).address])
            .unwrap();
        registry.add_token(&chain(), account(), token(1)).unwrap();

        let set = registry.token_set(&chain(), &account());
        assert_eq!(set.tracked(), &[token(1)]);
        assert!(set.ignored().is_empty());
        assert!(set.detected().is_empty());
    }

    #[test]
    fn duplicate_adds_update_in_place() {
        let registry = TokenRegistry::new();
        let mut renamed = token(1);
        renamed.symbol = "NEW".into();

        registry
            .add_tokens(&chain(), account(), vec![token(1), token(2)])
            .unwrap();
        registry.add_token(&chain(), account(), renamed.clone()).unwrap();

        assert_eq!(
            registry.token_set(&chain(), &account()).tracked(),
            &[renamed, token(2)]
        );
    }

    #[test]
    fn detection_respects_tracked_and_ignored() {
        let registry = TokenRegistry::new();
        registry.add_token(&chain(), account(), token(1)).unwrap();
        registry
            .ignore_tokens(&chain(), account(), &[token(2).address])
            .unwrap();

        let mut enriched = token(1);
        enriched.name = Some("Token One".into());

        let kept = registry
            .add_detected_tokens(&chain(), account(), vec![enriched, token(2), token(3)])
            .unwrap();

        let set = registry.token_set(&chain(), &account());
        assert_eq!(kept, vec![token(1).address, token(3).address]);
        assert_eq!(set.tracked()[0].name.as_deref(), Some("Token One"));
        assert_eq!(set.detected(), &[token(3)]);
        assert_eq!(set.ignored(), &[token(2).address]);

        registry.add_token(&chain(), account(), token(3)).unwrap();
        let set = registry.token_set(&chain(), &account());
        assert!(set.detected().is_empty());
        assert_eq!(set.tracked().len(), 2);
    }

    #[test]
    fn invalid_input_changes_nothing() {
        let registry = TokenRegistry::new();
        let mut bad = token(2);
        bad.decimals = 99;

        assert_eq!(
            registry.add_tokens(&chain(), account(), vec![token(1), bad]),
            Err(RegistryError::Validation(ValidationError::InvalidDecimals(
                crate::types::to_checksum(&token(2).address),
                99
            )))
        );
        assert!(registry
            .add_token(&chain(), Address::zero(), token(1))
            .is_err());
        assert!(registry
            .ignore_tokens(&chain(), account(), &[Address::zero()])
            .is_err());
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn removal_and_clearing() {
        let registry = TokenRegistry::new();
        let other = Address::from_low_u64_be(0x2);

        registry.add_token(&chain(), account(), token(1)).unwrap();
        registry.add_token(&ChainId::from(137), account(), token(1)).unwrap();
        registry.add_token(&chain(), other, token(1)).unwrap();
        registry
            .ignore_tokens(&ChainId::from(137), other, &[token(2).address])
            .unwrap();

        registry.clear_ignored_tokens();
        assert!(registry.accounts(&ChainId::from(137)) == vec![account()]);

        assert!(registry.remove_account(&account()));
        assert!(registry.balance_tokens(&chain(), &account()).is_empty());
        assert!(registry.chain_ids() == vec![chain()]);

        assert!(registry.remove_chain(&chain()));
        assert!(registry.snapshot().is_empty());
        assert!(!registry.remove_chain(&chain()));
    }

    #[tokio::test]
    async fn mutations_are_published() {
        let registry = TokenRegistry::new();
        let mut events = registry.subscribe();

        registry.add_token(&chain(), account(), token(1)).unwrap();
        registry
            .add_detected_tokens(&chain(), account(), vec![token(1)])
            .unwrap();
        registry
            .ignore_tokens(&chain(), account(), &[token(1).address])
            .unwrap();
        registry
            .add_detected_tokens(&chain(), account(), vec![token(1)])
            .unwrap();

        let added = events.recv().await.unwrap();
        assert_eq!(added.chain_id(), Some(&chain()));
        assert!(matches!(added, RegistryEvent::TokensAdded { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::TokensDetected { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::TokensIgnored { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_do_not_interleave() {
        let registry = Arc::new(TokenRegistry::new());

        let tasks: Vec<_> = (0..8u64)
            .map(|n| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    for i in 0..50 {
                        let token = token((n + i) % 6);
                        if i % 3 == 0 {
                            registry
                                .ignore_tokens(&chain(), account(), &[token.address])
                                .unwrap();
                        } else {
                            registry.add_token(&chain(), account(), token).unwrap();
                        }
                    }
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_disjoint(&registry.token_set(&chain(), &account()));
    }
}
