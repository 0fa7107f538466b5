use super::KeyValueStore;
use crate::clock::SharedClock;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store for single-node deployments and tests.
///
/// Each operation runs under the shard lock of its entry, which makes
/// `increment` and `compare_and_swap` atomic with respect to each other.
///
/// Expired entries are dropped when read and by a sweep that runs every
/// [`SWEEP_EVERY`] writes, so keys nobody reads again (old rate-limit windows)
/// do not accumulate.
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: SharedClock,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| !stored.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "Purged expired store entries");
        }
        removed
    }

    /// Must not be called while an entry guard is held.
    fn record_write(&self) {
        let count = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| self.clock.now() + ttl)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, stored| stored.is_expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };
        self.entries.insert(key.to_string(), stored);
        self.record_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, ttl_seconds: u64) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        let fresh = || StoredValue {
            value: "1".to_string(),
            expires_at: self.expiry(ttl),
        };

        let count = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                    1
                } else {
                    let current: u64 = occupied.get().value.parse().map_err(|_| {
                        StoreError::UnexpectedValue {
                            key: key.to_string(),
                            value: occupied.get().value.clone(),
                        }
                    })?;
                    let next = current.saturating_add(1);
                    occupied.get_mut().value = next.to_string();
                    next
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                1
            }
        };

        self.record_write();
        Ok(count)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);

        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired(now) {
                    None
                } else {
                    Some(occupied.get().value.as_str())
                };
                if current != expected {
                    false
                } else {
                    match new {
                        Some(value) => {
                            occupied.insert(StoredValue {
                                value: value.to_string(),
                                expires_at,
                            });
                        }
                        None => {
                            occupied.remove();
                        }
                    }
                    true
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    false
                } else {
                    if let Some(value) = new {
                        vacant.insert(StoredValue {
                            value: value.to_string(),
                            expires_at,
                        });
                    }
                    true
                }
            }
        };

        if swapped {
            self.record_write();
        }
        Ok(swapped)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
