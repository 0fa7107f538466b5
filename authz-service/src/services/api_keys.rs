//! API keys: issue, authenticate, rotate and revoke machine credentials.
//!
//! A key is stored only as its SHA-256 hash and looked up by that hash. An
//! authenticated key grants the intersection of its scopes with the owner's
//! currently resolved permissions, so revoking a role from the owner also
//! narrows every key they issued. Each key has its own rate-limit window.

use crate::config::{EndpointLimit, API_KEY_CLASS};
use crate::models::{
    parse_scopes, ApiKey, CallerContext, PermissionSet, API_KEY_PREFIX, DISPLAY_PREFIX_LEN,
};
use crate::services::codec::hash_api_key;
use crate::services::directory::SharedDirectory;
use crate::services::error::{ApiKeyError, DirectoryError, ResolveError};
use crate::services::rate_limit::{RateDecision, RateLimiter};
use crate::services::resolver::PermissionResolver;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use service_core::clock::SharedClock;
use std::sync::Arc;
use uuid::Uuid;

const KEY_BYTES: usize = 32;
const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub name: String,
    pub scopes: Vec<String>,
    pub rate_limit_per_minute: Option<u64>,
    pub expires_utc: Option<DateTime<Utc>>,
}

impl NewApiKey {
    pub fn new<S: Into<String>>(name: impl Into<String>, scopes: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            rate_limit_per_minute: None,
            expires_utc: None,
        }
    }

    pub fn with_rate_limit(mut self, per_minute: u64) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn expiring_at(mut self, expires_utc: DateTime<Utc>) -> Self {
        self.expires_utc = Some(expires_utc);
        self
    }
}

/// A freshly issued key. `secret` is shown once and cannot be recovered.
pub struct IssuedApiKey {
    pub api_key: ApiKey,
    pub secret: String,
}

impl std::fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("api_key", &self.api_key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// What an authenticated key may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyAccess {
    pub api_key_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub permissions: PermissionSet,
}

fn generate_secret() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", API_KEY_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

pub struct ApiKeyService {
    directory: SharedDirectory,
    resolver: Arc<PermissionResolver>,
    rate_limiter: Arc<RateLimiter>,
    clock: SharedClock,
}

impl ApiKeyService {
    pub fn new(
        directory: SharedDirectory,
        resolver: Arc<PermissionResolver>,
        rate_limiter: Arc<RateLimiter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            directory,
            resolver,
            rate_limiter,
            clock,
        }
    }

    fn issue(&self, template: &ApiKey) -> IssuedApiKey {
        let secret = generate_secret();
        let api_key = ApiKey {
            api_key_id: Uuid::new_v4(),
            key_hash: hash_api_key(&secret),
            key_prefix: secret.chars().take(DISPLAY_PREFIX_LEN).collect(),
            is_active: true,
            created_utc: self.clock.now(),
            last_used_utc: None,
            ..template.clone()
        };
        IssuedApiKey { api_key, secret }
    }

    async fn key_in(&self, tenant_id: Uuid, api_key_id: Uuid) -> Result<ApiKey, ApiKeyError> {
        let api_key = self
            .directory
            .load_api_key(api_key_id)
            .await?
            .ok_or_else(|| ApiKeyError::NotFound(format!("api key {}", api_key_id)))?;
        if api_key.tenant_id != tenant_id {
            return Err(ApiKeyError::TenantMismatch);
        }
        Ok(api_key)
    }

    #[tracing::instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        tenant_id: Uuid,
        owner_id: Uuid,
        request: NewApiKey,
    ) -> Result<IssuedApiKey, ApiKeyError> {
        let name = request.name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(ApiKeyError::InvalidRequest(format!(
                "Name must be 1 to {} characters",
                MAX_NAME_LEN
            )));
        }
        let scopes = parse_scopes(&request.scopes).map_err(ApiKeyError::InvalidRequest)?;
        if request.rate_limit_per_minute == Some(0) {
            return Err(ApiKeyError::InvalidRequest(
                "Rate limit must be at least one request per minute".to_string(),
            ));
        }
        let now = self.clock.now();
        if request.expires_utc.is_some_and(|at| at <= now) {
            return Err(ApiKeyError::InvalidRequest(
                "Expiry must be in the future".to_string(),
            ));
        }

        let owner = self
            .directory
            .load_principal(owner_id)
            .await?
            .ok_or_else(|| ApiKeyError::NotFound(format!("principal {}", owner_id)))?;
        if owner.tenant_id != tenant_id {
            return Err(ApiKeyError::TenantMismatch);
        }
        if !owner.is_active {
            return Err(ApiKeyError::InvalidRequest(
                "Owner is not active".to_string(),
            ));
        }

        let issued = self.issue(&ApiKey {
            api_key_id: Uuid::nil(),
            tenant_id,
            owner_id,
            name: name.to_string(),
            key_hash: String::new(),
            key_prefix: String::new(),
            scopes,
            rate_limit_per_minute: request.rate_limit_per_minute,
            expires_utc: request.expires_utc,
            is_active: true,
            created_utc: now,
            last_used_utc: None,
        });
        self.directory.insert_api_key(&issued.api_key).await?;

        tracing::info!(
            api_key_id = %issued.api_key.api_key_id,
            key_prefix = %issued.api_key.key_prefix,
            "API key created"
        );
        Ok(issued)
    }

    /// Resolve a presented key to what it may do. Unknown, revoked, expired and
    /// malformed keys all fail with [`ApiKeyError::InvalidKey`].
    pub async fn authenticate(&self, presented: &str) -> Result<ApiKeyAccess, ApiKeyError> {
        let presented = presented.trim();
        if !presented.starts_with(API_KEY_PREFIX) {
            return Err(ApiKeyError::InvalidKey);
        }

        let key_hash = hash_api_key(presented);
        let directory = self.directory.clone();
        let api_key = self
            .resolver
            .guarded(|| async move { directory.find_api_key_by_hash(&key_hash).await })
            .await?
            .ok_or(ApiKeyError::InvalidKey)?;

        let now = self.clock.now();
        if !api_key.is_usable(now) {
            tracing::info!(
                api_key_id = %api_key.api_key_id,
                is_active = api_key.is_active,
                "Unusable API key presented"
            );
            return Err(ApiKeyError::InvalidKey);
        }

        let identity = api_key.api_key_id.to_string();
        let decision = match api_key.rate_limit_per_minute {
            Some(per_minute) => {
                self.rate_limiter
                    .check_with_limit(API_KEY_CLASS, &identity, EndpointLimit::new(per_minute, 60))
                    .await
            }
            None => {
                self.rate_limiter
                    .check_and_increment(API_KEY_CLASS, &identity)
                    .await
            }
        };
        if let RateDecision::Deny {
            retry_after_seconds,
        } = decision
        {
            return Err(ApiKeyError::RateLimited {
                retry_after_seconds,
            });
        }

        let owner = self
            .resolver
            .resolve_access(
                api_key.tenant_id,
                api_key.owner_id,
                &CallerContext::tenant_scoped(),
            )
            .await
            .map_err(|e| {
                if matches!(e, ResolveError::PrincipalNotFound | ResolveError::TenantMismatch) {
                    tracing::warn!(api_key_id = %api_key.api_key_id, error = %e, "API key owner no longer valid");
                    ApiKeyError::InvalidKey
                } else {
                    ApiKeyError::Resolve(e)
                }
            })?;

        if let Err(e) = self.directory.touch_api_key(api_key.api_key_id, now).await {
            tracing::warn!(api_key_id = %api_key.api_key_id, error = %e, "Failed to record API key use");
        }

        Ok(ApiKeyAccess {
            api_key_id: api_key.api_key_id,
            tenant_id: api_key.tenant_id,
            owner_id: api_key.owner_id,
            permissions: api_key.effective_permissions(&owner.permissions),
        })
    }

    /// Replace a key with a new secret carrying the same settings. The old key
    /// stops working at once.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self, tenant_id: Uuid, api_key_id: Uuid) -> Result<IssuedApiKey, ApiKeyError> {
        let current = self.key_in(tenant_id, api_key_id).await?;
        if !current.is_active {
            return Err(ApiKeyError::Revoked);
        }
        if current.is_expired(self.clock.now()) {
            return Err(ApiKeyError::InvalidRequest(
                "Expired keys cannot be rotated".to_string(),
            ));
        }

        let issued = self.issue(&current);
        match self
            .directory
            .replace_api_key(api_key_id, &issued.api_key)
            .await
        {
            Ok(()) => {}
            // Revoked or rotated by someone else in the meantime.
            Err(DirectoryError::Conflict(_)) => return Err(ApiKeyError::Revoked),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            replacement_id = %issued.api_key.api_key_id,
            "API key rotated"
        );
        Ok(issued)
    }

    /// Idempotent; `true` only when this call deactivated the key.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, tenant_id: Uuid, api_key_id: Uuid) -> Result<bool, ApiKeyError> {
        self.key_in(tenant_id, api_key_id).await?;
        let revoked = self.directory.deactivate_api_key(api_key_id).await?;
        if revoked {
            tracing::info!("API key revoked");
        }
        Ok(revoked)
    }

    pub async fn get(&self, tenant_id: Uuid, api_key_id: Uuid) -> Result<ApiKey, ApiKeyError> {
        self.key_in(tenant_id, api_key_id).await
    }

    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, ApiKeyError> {
        Ok(self.directory.list_api_keys(tenant_id).await?)
    }
}
