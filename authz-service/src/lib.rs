pub mod config;
pub mod db;
pub mod models;
pub mod services;

use crate::config::AuthzConfig;
use crate::services::{
    AccessAdmin, ApiKeyService, AuthorizationGate, BreakerSnapshot, CircuitBreaker, PermissionCache,
    PermissionResolver, PgDirectory, RateLimitStats, RateLimiter, SecretCodec, SharedDirectory,
    TotpEngine,
};
use serde::Serialize;
use service_core::clock::{SharedClock, SystemClock};
use service_core::error::CoreError;
use service_core::store::{RedisStore, SharedStore};
use std::sync::Arc;

/// Name of the breaker guarding directory reads.
pub const DIRECTORY_BREAKER: &str = "directory";

/// Fully wired authorization core. Cheap to clone; share one per process.
#[derive(Clone)]
pub struct AuthzCore {
    pub config: Arc<AuthzConfig>,
    pub store: SharedStore,
    pub directory: SharedDirectory,
    pub gate: Arc<AuthorizationGate>,
    pub totp: Arc<TotpEngine>,
    pub resolver: Arc<PermissionResolver>,
    pub cache: Arc<PermissionCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub directory_breaker: Arc<CircuitBreaker>,
    pub admin: Arc<AccessAdmin>,
    pub api_keys: Arc<ApiKeyService>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub rate_limit: RateLimitStats,
    pub directory_breaker: BreakerSnapshot,
}

impl AuthzCore {
    /// Wire the components over existing collaborators.
    pub fn new(
        config: AuthzConfig,
        store: SharedStore,
        directory: SharedDirectory,
        clock: SharedClock,
    ) -> Result<Self, CoreError> {
        let codec = SecretCodec::from_base64(&config.encryption_key)
            .map_err(|e| CoreError::ConfigError(anyhow::anyhow!(e)))?;
        let codec = Arc::new(codec);

        let cache = Arc::new(PermissionCache::new(
            store.clone(),
            config.cache.permission_ttl,
            config.store_timeout,
        ));
        let directory_breaker = Arc::new(CircuitBreaker::new(
            DIRECTORY_BREAKER,
            store.clone(),
            clock.clone(),
            config.breaker.clone(),
            config.store_timeout,
        ));
        let resolver = Arc::new(PermissionResolver::new(
            directory.clone(),
            cache.clone(),
            directory_breaker.clone(),
            config.directory_timeout,
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock.clone(),
            config.rate_limit.clone(),
            config.store_timeout,
        ));
        let totp = Arc::new(TotpEngine::new(
            directory.clone(),
            store.clone(),
            codec.clone(),
            cache.clone(),
            rate_limiter.clone(),
            clock.clone(),
            config.totp.clone(),
            config.store_timeout,
        ));
        let api_keys = Arc::new(ApiKeyService::new(
            directory.clone(),
            resolver.clone(),
            rate_limiter.clone(),
            clock,
        ));
        let gate = Arc::new(AuthorizationGate::new(
            rate_limiter.clone(),
            resolver.clone(),
            api_keys.clone(),
        ));
        let admin = Arc::new(AccessAdmin::new(directory.clone(), cache.clone()));

        Ok(Self {
            config: Arc::new(config),
            store,
            directory,
            gate,
            totp,
            resolver,
            cache,
            rate_limiter,
            directory_breaker,
            admin,
            api_keys,
        })
    }

    /// Connect to Redis and PostgreSQL, apply migrations and wire the core.
    pub async fn connect(config: AuthzConfig) -> Result<Self, CoreError> {
        tracing::info!("Initializing authorization core");

        let store = RedisStore::connect(&config.redis.url).await?;
        let pool = db::connect(&config.database, config.directory_timeout)
            .await
            .map_err(|e| CoreError::InternalError(anyhow::anyhow!(e)))?;

        Self::new(
            config,
            Arc::new(store),
            Arc::new(PgDirectory::new(pool)),
            Arc::new(SystemClock),
        )
    }

    pub async fn health_check(&self) -> Result<(), CoreError> {
        self.store.health_check().await?;
        self.directory
            .health_check()
            .await
            .map_err(|e| CoreError::InternalError(anyhow::anyhow!(e)))?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<CoreStats, CoreError> {
        Ok(CoreStats {
            rate_limit: self.rate_limiter.stats().await?,
            directory_breaker: self.directory_breaker.state().await?,
        })
    }
}
