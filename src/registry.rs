use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::models::{HeldLock, OwnershipToken};

/// Process-local record of the locks this instance believes it owns.
///
/// The backing store stays authoritative. Entries are only written after the
/// store has granted a lock and are only consulted to supply the token for
/// the store's compare-and-act operations.
#[derive(Clone, Default)]
pub struct OwnershipRegistry {
    entries: Arc<DashMap<String, HeldLock>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a granted lock, replacing whatever was stored for the key.
    pub fn insert(&self, held: HeldLock) {
        self.entries.insert(held.key.clone(), held);
    }

    pub fn get(&self, key: &str) -> Option<HeldLock> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn token(&self, key: &str) -> Option<OwnershipToken> {
        self.entries.get(key).map(|entry| entry.token)
    }

    /// Moves the local expiry estimate after a successful extend. Returns
    /// `false` when the entry is gone or now carries a different token.
    pub fn refresh(&self, key: &str, token: OwnershipToken, ttl: Duration) -> bool {
        match self.entries.get_mut(key) {
            Some(mut held) if held.token == token => {
                held.refresh(ttl);
                true
            }
            _ => false,
        }
    }

    /// Removes the entry only if it still carries `token`, so a concurrent
    /// re-acquire of the same key is never clobbered.
    pub fn remove_if_token(&self, key: &str, token: OwnershipToken) -> bool {
        self.entries
            .remove_if(key, |_, held| held.token == token)
            .is_some()
    }

    /// Snapshot of the held keys. Collected eagerly so no shard guard is
    /// held across an await point.
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
