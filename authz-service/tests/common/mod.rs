//! Shared harness for authz-service integration tests.
//!
//! Wires a full core over the in-memory store and directory with a manually
//! driven clock.

#![allow(dead_code)]

use authz_service::config::AuthzConfig;
use authz_service::models::{Principal, Role, Tenant};
use authz_service::services::{Directory, MemoryDirectory, TotpSetup};
use authz_service::AuthzCore;
use async_trait::async_trait;
use service_core::clock::{Clock, ManualClock, SharedClock};
use service_core::config::Config as CoreConfig;
use service_core::error::StoreError;
use service_core::store::{KeyValueStore, MemoryStore, SharedStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use totp_rs::TOTP;

/// Base64 of the bytes 0..32.
pub const TEST_ENCRYPTION_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";

/// Start of a 30s TOTP step and a 60s rate-limit window.
pub const START_UNIX: i64 = 1_700_000_040;

pub struct TestApp {
    pub core: AuthzCore,
    pub clock: ManualClock,
    pub directory: Arc<MemoryDirectory>,
}

pub fn test_config(overrides: &[(&str, &str)]) -> AuthzConfig {
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("AUTHZ_ENCRYPTION_KEY".into(), TEST_ENCRYPTION_KEY.into());
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let mut config = AuthzConfig::from_lookup(CoreConfig::default(), |key| vars.get(key).cloned())
        .expect("test configuration should be valid");
    config
        .rate_limit
        .apply_overrides(vars.clone())
        .expect("rate limit overrides should parse");
    config
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(&[])
    }

    pub fn spawn_with(overrides: &[(&str, &str)]) -> Self {
        let clock = ManualClock::at_unix(START_UNIX);
        let shared_clock: SharedClock = Arc::new(clock.clone());
        let store: SharedStore = Arc::new(MemoryStore::new(shared_clock.clone()));
        Self::spawn_over(overrides, store, clock)
    }

    /// Core over a caller-supplied key-value store.
    pub fn spawn_over(overrides: &[(&str, &str)], store: SharedStore, clock: ManualClock) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let core = AuthzCore::new(
            test_config(overrides),
            store,
            directory.clone(),
            Arc::new(clock.clone()),
        )
        .expect("core should wire");

        Self {
            core,
            clock,
            directory,
        }
    }

    pub async fn create_tenant(&self) -> Tenant {
        let tenant = Tenant::new();
        self.directory.insert_tenant(&tenant).await.unwrap();
        tenant
    }

    pub async fn create_principal(&self, tenant: &Tenant) -> Principal {
        let principal = Principal::new(tenant.tenant_id);
        self.directory.insert_principal(&principal).await.unwrap();
        principal
    }

    pub async fn create_superadmin(&self, tenant: &Tenant) -> Principal {
        let mut principal = Principal::new(tenant.tenant_id);
        principal.is_superadmin = true;
        self.directory.insert_principal(&principal).await.unwrap();
        principal
    }

    pub async fn create_role(&self, tenant: &Tenant, name: &str, permissions: &[&str]) -> Role {
        self.core
            .admin
            .create_role(tenant.tenant_id, name, permissions)
            .await
            .unwrap()
    }

    pub async fn create_system_role(&self, name: &str, permissions: &[&str]) -> Role {
        let role = Role::system(name);
        self.directory.insert_role(&role).await.unwrap();
        for permission in permissions {
            let permission = authz_service::models::PermissionName::parse(permission).unwrap();
            self.directory
                .grant_permission(role.role_id, &permission)
                .await
                .unwrap();
        }
        role
    }

    /// Tenant with one principal holding `editor` (`posts:create`, `posts:read`).
    pub async fn editor(&self) -> (Tenant, Principal, Role) {
        let tenant = self.create_tenant().await;
        let principal = self.create_principal(&tenant).await;
        let role = self
            .create_role(&tenant, "editor", &["posts:create", "posts:read"])
            .await;
        self.core
            .admin
            .assign_role(tenant.tenant_id, principal.principal_id, role.role_id)
            .await
            .unwrap();
        (tenant, principal, role)
    }

    /// Code an authenticator app would show now, shifted by `steps` periods.
    pub fn totp_code(&self, setup: &TotpSetup, steps: i64) -> String {
        let totp = TOTP::from_url(&setup.provisioning_uri).unwrap();
        let at = self.clock.unix_seconds() + steps * totp.step as i64;
        totp.generate(at as u64)
    }

    /// Set up and confirm TOTP; the current step is consumed by the confirmation.
    pub async fn enable_totp(&self, principal: &Principal) -> TotpSetup {
        let setup = self
            .core
            .totp
            .begin_setup(principal.principal_id)
            .await
            .unwrap();
        let code = self.totp_code(&setup, 0);
        self.core
            .totp
            .confirm_enable(principal.principal_id, &code)
            .await
            .unwrap();
        setup
    }

    pub fn advance(&self, seconds: u64) {
        self.clock.advance(Duration::from_secs(seconds));
    }
}

/// Store whose every call fails, for fail-closed checks.
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }

    async fn increment(&self, _key: &str, _ttl_seconds: u64) -> Result<u64, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<&str>,
        _ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Err(StoreError::Timeout(Duration::from_millis(1)))
    }
}
