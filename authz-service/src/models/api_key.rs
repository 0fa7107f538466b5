//! API key model - a long-lived machine credential owned by a principal.

use crate::models::{PermissionName, PermissionSet, WILDCARD_PERMISSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every issued key starts with this marker.
pub const API_KEY_PREFIX: &str = "authz_";
/// Characters of the key kept in clear for display.
pub const DISPLAY_PREFIX_LEN: usize = 12;

/// A key acts for its owner, narrowed to `scopes`. Only the hash of the
/// secret is stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub api_key_id: Uuid,
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    /// Permission names the key may exercise. `*` delegates the owner's whole set.
    pub scopes: Vec<String>,
    /// Requests per minute; `None` falls back to the `api_key` class.
    pub rate_limit_per_minute: Option<u64>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
    pub last_used_utc: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc.is_some_and(|at| at <= now)
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired(now)
    }

    pub fn delegates_everything(&self) -> bool {
        self.scopes.iter().any(|scope| scope == WILDCARD_PERMISSION)
    }

    /// Permissions the key grants: its scopes that the owner still holds.
    pub fn effective_permissions(&self, owner: &PermissionSet) -> PermissionSet {
        if self.delegates_everything() {
            return owner.clone();
        }
        self.scopes
            .iter()
            .filter(|scope| owner.contains(scope))
            .map(String::as_str)
            .collect()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("api_key_id", &self.api_key_id)
            .field("tenant_id", &self.tenant_id)
            .field("owner_id", &self.owner_id)
            .field("name", &self.name)
            .field("key_prefix", &self.key_prefix)
            .field("scopes", &self.scopes)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .field("expires_utc", &self.expires_utc)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Validate requested scopes: `*` or `resource:action` names, at least one.
pub fn parse_scopes<S: AsRef<str>>(scopes: &[S]) -> Result<Vec<String>, String> {
    if scopes.is_empty() {
        return Err("An API key needs at least one scope".to_string());
    }

    let mut parsed: Vec<String> = Vec::with_capacity(scopes.len());
    for scope in scopes {
        let scope = scope.as_ref().trim();
        let name = if scope == WILDCARD_PERMISSION {
            scope.to_string()
        } else {
            PermissionName::parse(scope)?.to_string()
        };
        if !parsed.contains(&name) {
            parsed.push(name);
        }
    }
    Ok(parsed)
}
