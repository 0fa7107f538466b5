//! Permission Cache over the shared key-value store.
//!
//! Keys embed two counters so invalidation never has to scan:
//!
//! * `authz:perm_ver:<tenant>` - bumped by [`PermissionCache::invalidate_tenant`]
//! * `authz:perm_gen:<tenant>:<principal>` - bumped by [`PermissionCache::invalidate`]
//!
//! An entry lives at `authz:perm:<tenant>:v<version>:<principal>:g<generation>`.
//! A resolver reads the stamp before loading from the directory and writes under
//! that stamp, so a write racing an invalidation lands on a key nobody reads.

use crate::models::PermissionSet;
use serde::{Deserialize, Serialize};
use service_core::error::StoreError;
use service_core::store::{with_timeout, SharedStore};
use std::time::Duration;
use uuid::Uuid;

/// Cached outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAccess {
    pub permissions: PermissionSet,
    /// The principal has 2FA enabled; sessions need a verified second factor.
    pub requires_second_factor: bool,
}

impl ResolvedAccess {
    pub fn denied() -> Self {
        Self {
            permissions: PermissionSet::empty(),
            requires_second_factor: false,
        }
    }
}

/// Counter values an entry was computed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStamp {
    version: u64,
    generation: u64,
}

#[derive(Debug)]
pub enum CacheLookup {
    Hit(ResolvedAccess),
    Miss(CacheStamp),
}

pub struct PermissionCache {
    store: SharedStore,
    ttl: Duration,
    timeout: Duration,
}

impl PermissionCache {
    pub fn new(store: SharedStore, ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn version_key(tenant_id: Uuid) -> String {
        format!("authz:perm_ver:{}", tenant_id)
    }

    fn generation_key(tenant_id: Uuid, principal_id: Uuid) -> String {
        format!("authz:perm_gen:{}:{}", tenant_id, principal_id)
    }

    fn entry_key(tenant_id: Uuid, principal_id: Uuid, stamp: CacheStamp) -> String {
        format!(
            "authz:perm:{}:v{}:{}:g{}",
            tenant_id, stamp.version, principal_id, stamp.generation
        )
    }

    async fn read_counter(&self, key: &str) -> Result<u64, StoreError> {
        match with_timeout(self.timeout, self.store.get(key)).await? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| StoreError::UnexpectedValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    async fn stamp(&self, tenant_id: Uuid, principal_id: Uuid) -> Result<CacheStamp, StoreError> {
        Ok(CacheStamp {
            version: self.read_counter(&Self::version_key(tenant_id)).await?,
            generation: self
                .read_counter(&Self::generation_key(tenant_id, principal_id))
                .await?,
        })
    }

    /// Hit, or the stamp a recomputed value must be written under.
    pub async fn lookup(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<CacheLookup, StoreError> {
        let stamp = self.stamp(tenant_id, principal_id).await?;
        let key = Self::entry_key(tenant_id, principal_id, stamp);

        let Some(raw) = with_timeout(self.timeout, self.store.get(&key)).await? else {
            return Ok(CacheLookup::Miss(stamp));
        };

        match serde_json::from_str::<ResolvedAccess>(&raw) {
            Ok(access) => Ok(CacheLookup::Hit(access)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding unreadable permission cache entry");
                Ok(CacheLookup::Miss(stamp))
            }
        }
    }

    pub async fn put_stamped(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        stamp: CacheStamp,
        access: &ResolvedAccess,
    ) -> Result<(), StoreError> {
        let key = Self::entry_key(tenant_id, principal_id, stamp);
        let value = serde_json::to_string(access)?;
        with_timeout(self.timeout, self.store.set(&key, &value, Some(self.ttl))).await
    }

    /// `None` on miss or expiry.
    pub async fn get(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Option<ResolvedAccess>, StoreError> {
        match self.lookup(tenant_id, principal_id).await? {
            CacheLookup::Hit(access) => Ok(Some(access)),
            CacheLookup::Miss(_) => Ok(None),
        }
    }

    /// Unconditional overwrite under the current stamp.
    pub async fn put(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        access: &ResolvedAccess,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let stamp = self.stamp(tenant_id, principal_id).await?;
        let key = Self::entry_key(tenant_id, principal_id, stamp);
        let value = serde_json::to_string(access)?;
        with_timeout(self.timeout, self.store.set(&key, &value, Some(ttl))).await
    }

    /// Idempotent. Bumps the principal generation, then drops the old entry.
    pub async fn invalidate(&self, tenant_id: Uuid, principal_id: Uuid) -> Result<(), StoreError> {
        let previous = self.stamp(tenant_id, principal_id).await?;
        let generation_key = Self::generation_key(tenant_id, principal_id);
        with_timeout(self.timeout, self.store.increment(&generation_key, 0)).await?;

        let stale = Self::entry_key(tenant_id, principal_id, previous);
        if let Err(e) = with_timeout(self.timeout, self.store.delete(&stale)).await {
            tracing::debug!(key = %stale, error = %e, "Stale cache entry left to expire");
        }

        tracing::debug!(%tenant_id, %principal_id, "Permission cache entry invalidated");
        Ok(())
    }

    /// Orphans every entry of the tenant in one increment.
    pub async fn invalidate_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        let version =
            with_timeout(self.timeout, self.store.increment(&Self::version_key(tenant_id), 0))
                .await?;
        tracing::info!(%tenant_id, version, "Permission cache invalidated for tenant");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::clock::ManualClock;
    use service_core::store::MemoryStore;
    use std::sync::Arc;

    fn cache_with_clock() -> (PermissionCache, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let cache = PermissionCache::new(store, Duration::from_secs(1800), Duration::from_secs(1));
        (cache, clock)
    }

    fn access(names: &[&str]) -> ResolvedAccess {
        ResolvedAccess {
            permissions: names.iter().copied().collect(),
            requires_second_factor: false,
        }
    }

    #[tokio::test]
    async fn put_then_get_until_expiry() {
        let (cache, clock) = cache_with_clock();
        let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());
        let value = access(&["posts:read"]);

        cache.put(tenant, principal, &value, cache.ttl()).await.unwrap();
        assert_eq!(cache.get(tenant, principal).await.unwrap(), Some(value));

        clock.advance(Duration::from_secs(1801));
        assert_eq!(cache.get(tenant, principal).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_is_idempotent_and_scoped() {
        let (cache, _) = cache_with_clock();
        let tenant = Uuid::new_v4();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        cache.put(tenant, alice, &access(&["a:b"]), cache.ttl()).await.unwrap();
        cache.put(tenant, bob, &access(&["c:d"]), cache.ttl()).await.unwrap();

        cache.invalidate(tenant, alice).await.unwrap();
        cache.invalidate(tenant, alice).await.unwrap();

        assert_eq!(cache.get(tenant, alice).await.unwrap(), None);
        assert!(cache.get(tenant, bob).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tenant_invalidation_orphans_every_entry() {
        let (cache, _) = cache_with_clock();
        let (tenant, other) = (Uuid::new_v4(), Uuid::new_v4());
        let principal = Uuid::new_v4();
        cache.put(tenant, principal, &access(&["a:b"]), cache.ttl()).await.unwrap();
        cache.put(other, principal, &access(&["a:b"]), cache.ttl()).await.unwrap();

        cache.invalidate_tenant(tenant).await.unwrap();

        assert_eq!(cache.get(tenant, principal).await.unwrap(), None);
        assert!(cache.get(other, principal).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_under_old_stamp_is_never_served() {
        let (cache, _) = cache_with_clock();
        let (tenant, principal) = (Uuid::new_v4(), Uuid::new_v4());

        let CacheLookup::Miss(stamp) = cache.lookup(tenant, principal).await.unwrap() else {
            panic!("expected miss");
        };
        cache.invalidate(tenant, principal).await.unwrap();
        cache
            .put_stamped(tenant, principal, stamp, &access(&["stale:write"]))
            .await
            .unwrap();

        assert_eq!(cache.get(tenant, principal).await.unwrap(), None);
    }
}
