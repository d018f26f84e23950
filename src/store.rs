use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{task::JoinHandle, time};
use tracing::{debug, info};

use crate::error::StoreError;

/// Minimum capability set the lock protocol needs from a keyed store with
/// expiring entries.
///
/// Each method is a single atomic operation on the store side. The
/// compare-and-act calls must never be emulated with a read followed by a
/// write, since an expiry and re-acquire by another instance can land in
/// between.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Creates `key -> value` expiring after `ttl` only if `key` is absent.
    /// Returns `true` iff this call created the record.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently holds `expected`. Returns the
    /// number of records deleted (0 or 1).
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<u64, StoreError>;

    /// Resets the expiry of `key` to `ttl` only if it currently holds
    /// `expected`. Returns 1 iff the expiry was refreshed.
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Short label used in log lines.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    value: String,
    expires_at: Instant,
}

// Ceiling for absurd TTLs that would overflow `Instant`
const MAX_RECORD_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl.min(MAX_RECORD_TTL)).unwrap_or(now)
}

impl StoredRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process backing store with per-entry expiry.
///
/// Clones share the same map, so several lock managers built from clones of
/// one `MemoryBackend` behave like independent instances talking to a single
/// server. Expired entries are ignored on access and can additionally be
/// swept by [`MemoryBackend::start_expiry_task`].
#[derive(Clone, Default)]
pub struct MemoryBackend {
    records: Arc<DashMap<String, StoredRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for `key`, if present and unexpired.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.value.clone())
    }

    /// Remaining time to live for `key`, if present and unexpired.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.expires_at - now)
    }

    /// Number of stored records, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn start_expiry_task(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            info!("Started lock record expiry task ({:?} interval)", every);

            loop {
                interval.tick().await;
                store.cleanup_expired();
            }
        })
    }

    /// Drops every expired record and returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|key, record| {
            let keep = !record.is_expired(now);
            if !keep {
                debug!("Expired lock record: {}", key);
            }
            keep
        });
        before.saturating_sub(self.records.len())
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let record = StoredRecord {
            value: value.to_string(),
            expires_at: expiry_deadline(now, ttl),
        };

        match self.records.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now) {
                    entry.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let removed = self
            .records
            .remove_if(key, |_, record| record.value == expected && !record.is_expired(now));
        Ok(removed.map_or(0, |_| 1))
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        match self.records.get_mut(key) {
            Some(mut record) if record.value == expected && !record.is_expired(now) => {
                record.expires_at = expiry_deadline(now, ttl);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
