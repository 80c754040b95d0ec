//! Lock-guarded token map owned by the token store.
//!
//! The map and the registered invalidation callback live under one
//! `RwLock`: every mutation is a single map operation taken under the write
//! lock, so readers never observe a partially replaced record.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::dispatch::{Invalidation, InvalidationCallback};
use super::record::{TokenError, TokenRecord};

struct CacheState {
    on_invalid: Option<InvalidationCallback>,
    tokens: HashMap<String, TokenRecord>,
}

pub(crate) struct TokenCache {
    region: String,
    state: RwLock<CacheState>,
}

impl TokenCache {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: RwLock::new(CacheState {
                on_invalid: None,
                tokens: HashMap::new(),
            }),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_callback(&self, callback: InvalidationCallback) {
        self.write().on_invalid = Some(callback);
    }

    /// Replace the whole map. Returns invalidations for tokens that were
    /// valid before and are now invalid or gone.
    pub fn replace_all(&self, tokens: HashMap<String, TokenRecord>) -> Vec<Invalidation> {
        let mut state = self.write();
        let previous = std::mem::replace(&mut state.tokens, tokens);

        let Some(callback) = state.on_invalid.clone() else {
            return Vec::new();
        };
        previous
            .into_values()
            .filter(|old| old.is_valid_for(&self.region))
            .filter(|old| {
                !state
                    .tokens
                    .get(&old.token)
                    .is_some_and(|new| new.is_valid_for(&self.region))
            })
            .map(|old| Invalidation::new(old.token, callback.clone()))
            .collect()
    }

    /// Insert or replace a record. Returns an invalidation when a valid
    /// token became invalid.
    pub fn apply_put(&self, record: TokenRecord) -> Option<Invalidation> {
        let mut state = self.write();
        let is_valid_now = record.is_valid_for(&self.region);
        let token = record.token.clone();
        let was_valid = state
            .tokens
            .insert(token.clone(), record)
            .is_some_and(|old| old.is_valid_for(&self.region));

        if was_valid && !is_valid_now {
            state
                .on_invalid
                .clone()
                .map(|callback| Invalidation::new(token, callback))
        } else {
            None
        }
    }

    /// Remove a record. Returns an invalidation when the removed token was
    /// valid.
    pub fn apply_delete(&self, token: &str) -> Option<Invalidation> {
        let mut state = self.write();
        let removed = state.tokens.remove(token)?;
        if !removed.is_valid_for(&self.region) {
            return None;
        }
        state
            .on_invalid
            .clone()
            .map(|callback| Invalidation::new(removed.token, callback))
    }

    pub fn get_valid(&self, token: &str) -> Option<TokenRecord> {
        self.read()
            .tokens
            .get(token)
            .filter(|record| record.is_valid_for(&self.region))
            .cloned()
    }

    pub fn validate(&self, token: &str) -> Result<TokenRecord, TokenError> {
        let state = self.read();
        let record = state.tokens.get(token).ok_or(TokenError::NotFound)?;
        record.check(&self.region)?;
        Ok(record.clone())
    }

    pub fn len(&self) -> usize {
        self.read().tokens.len()
    }

    /// Scan valid records under one shared lock, in unspecified order, and
    /// return the first one `matches` accepts.
    pub fn find_valid<F>(&self, mut matches: F) -> Option<TokenRecord>
    where
        F: FnMut(&TokenRecord) -> bool,
    {
        let state = self.read();
        state
            .tokens
            .values()
            .filter(|record| record.enabled)
            .filter(|record| record.region == self.region)
            .find(|record| matches(record))
            .cloned()
    }

    pub fn valid_tokens(&self) -> Vec<TokenRecord> {
        self.read()
            .tokens
            .values()
            .filter(|record| record.is_valid_for(&self.region))
            .cloned()
            .collect()
    }
}
