use super::{to_checksum, Address, ValidationError, MAX_DECIMALS, NATIVE_TOKEN};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeSet;

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    pub name: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub aggregator_tags: BTreeSet<String>,
    pub is_non_fungible: Option<bool>,
}

impl Token {
    pub fn new(address: Address, symbol: &str, decimals: u8) -> Self {
        Self {
            address,
            symbol: symbol.to_string(),
            decimals,
            name: None,
            image: None,
            aggregator_tags: BTreeSet::new(),
            is_non_fungible: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.address == NATIVE_TOKEN {
            return Err(ValidationError::ZeroAddress("Token"));
        }

        if self.symbol.trim().is_empty() {
            return Err(ValidationError::EmptySymbol(to_checksum(&self.address)));
        }

        if self.decimals > MAX_DECIMALS {
            return Err(ValidationError::InvalidDecimals(
                to_checksum(&self.address),
                self.decimals,
            ));
        }

        Ok(())
    }

    /// Takes the newer metadata, keeping optional fields the update lacks.
    fn update_metadata(&mut self, update: Token) {
        self.symbol = update.symbol;
        self.decimals = update.decimals;

        if update.name.is_some() {
            self.name = update.name;
        }
        if update.image.is_some() {
            self.image = update.image;
        }
        if !update.aggregator_tags.is_empty() {
            self.aggregator_tags = update.aggregator_tags;
        }
        if update.is_non_fungible.is_some() {
            self.is_non_fungible = update.is_non_fungible;
        }
    }
}

/// Tokens of one account on one chain.
///
/// The three lists are disjoint and keyed by address. Every mutation goes
/// through [`TokenSet::track`], [`TokenSet::ignore`] or [`TokenSet::detect`],
/// each of which removes the address from the other lists first, and
/// deserialization replays the lists through them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(from = "RawTokenSet")]
pub struct TokenSet {
    tracked: Vec<Token>,
    ignored: Vec<Address>,
    detected: Vec<Token>,
}

#[derive(Deserialize)]
struct RawTokenSet {
    #[serde(default)]
    tracked: Vec<Token>,
    #[serde(default)]
    ignored: Vec<Address>,
    #[serde(default)]
    detected: Vec<Token>,
}

impl From<RawTokenSet> for TokenSet {
    fn from(raw: RawTokenSet) -> Self {
        let mut set = TokenSet::default();

        for address in raw.ignored {
            set.ignore(address);
        }
        for token in raw.tracked {
            set.track(token);
        }
        for token in raw.detected {
            set.detect(token);
        }

        set
    }
}

impl TokenSet {
    pub fn tracked(&self) -> &[Token] {
        &self.tracked
    }

    pub fn ignored(&self) -> &[Address] {
        &self.ignored
    }

    pub fn detected(&self) -> &[Token] {
        &self.detected
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty() && self.ignored.is_empty() && self.detected.is_empty()
    }

    pub fn is_tracked(&self, address: &Address) -> bool {
        self.tracked.iter().any(|t| t.address == *address)
    }

    pub fn is_ignored(&self, address: &Address) -> bool {
        self.ignored.contains(address)
    }

    pub fn is_detected(&self, address: &Address) -> bool {
        self.detected.iter().any(|t| t.address == *address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.is_tracked(address) || self.is_ignored(address) || self.is_detected(address)
    }

    /// Tokens that need a balance: tracked first, then detected.
    pub fn balance_tokens(&self) -> impl Iterator<Item = Address> + '_ {
        self.tracked
            .iter()
            .chain(self.detected.iter())
            .map(|t| t.address)
    }

    pub(crate) fn track(&mut self, token: Token) {
        self.ignored.retain(|a| *a != token.address);
        self.detected.retain(|t| t.address != token.address);
        upsert(&mut self.tracked, token);
    }

    /// Returns `false` if the address was already ignored.
    pub(crate) fn ignore(&mut self, address: Address) -> bool {
        self.tracked.retain(|t| t.address != address);
        self.detected.retain(|t| t.address != address);

        if self.ignored.contains(&address) {
            return false;
        }

        self.ignored.push(address);
        true
    }

    /// Returns `false` if the token was dropped because it is ignored.
    pub(crate) fn detect(&mut self, token: Token) -> bool {
        if self.is_ignored(&token.address) {
            return false;
        }

        if let Some(tracked) = self
            .tracked
            .iter_mut()
            .find(|t| t.address == token.address)
        {
            tracked.update_metadata(token);
            return true;
        }

        upsert(&mut self.detected, token);
        true
    }

    pub(crate) fn clear_ignored(&mut self) -> bool {
        let had_ignored = !self.ignored.is_empty();
        self.ignored.clear();
        had_ignored
    }
}

fn upsert(list: &mut Vec<Token>, token: Token) {
    match list.iter_mut().find(|t| t.address == token.address) {
        Some(existing) => *existing = token,
        None => list.push(token),
    }
}
