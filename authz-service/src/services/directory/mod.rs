//! Relational collaborator: principals, tenants, roles, the permission catalog
//! and API keys.
//!
//! Every write is a single atomic statement (or transaction) on the backing
//! store. `Err` always means the collaborator failed; missing rows are `Ok(None)`
//! or an empty list, so callers can count errors as infrastructure failures.

mod memory;
mod postgres;

pub use memory::MemoryDirectory;
pub use postgres::PgDirectory;

use crate::models::{ApiKey, PermissionName, Principal, Role, Tenant, TenantStatus};
use crate::services::error::DirectoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait Directory: Send + Sync {
    // ---- reads ----

    /// Looked up by id alone so callers can compare the stored tenant.
    async fn load_principal(&self, principal_id: Uuid) -> Result<Option<Principal>, DirectoryError>;

    async fn load_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, DirectoryError>;

    /// Role ids held by the principal within `tenant_id` (system roles included).
    async fn load_roles_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Vec<Uuid>, DirectoryError>;

    async fn load_role(&self, role_id: Uuid) -> Result<Option<Role>, DirectoryError>;

    /// Permission names of a role in grant order. Entries missing from the
    /// catalog are skipped.
    async fn load_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<String>, DirectoryError>;

    async fn find_role_by_name(
        &self,
        tenant_id: Uuid,
        role_name: &str,
    ) -> Result<Option<Role>, DirectoryError>;

    // ---- second factor ----

    /// Store (or clear with `None`) the encrypted TOTP secret.
    async fn persist_totp_secret(
        &self,
        principal_id: Uuid,
        ciphertext: Option<&[u8]>,
    ) -> Result<(), DirectoryError>;

    /// Replace the whole backup-code hash set.
    async fn persist_backup_code_hashes(
        &self,
        principal_id: Uuid,
        hashes: &[String],
    ) -> Result<(), DirectoryError>;

    /// Atomically remove one hash. `true` only for the caller that removed it.
    async fn remove_backup_code_hash(
        &self,
        principal_id: Uuid,
        hash: &str,
    ) -> Result<bool, DirectoryError>;

    async fn set_two_factor_enabled(
        &self,
        principal_id: Uuid,
        enabled: bool,
    ) -> Result<(), DirectoryError>;

    /// Clear secret, backup codes and the enabled flag in one step.
    async fn clear_two_factor(&self, principal_id: Uuid) -> Result<(), DirectoryError>;

    // ---- administration ----

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), DirectoryError>;

    async fn set_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<(), DirectoryError>;

    async fn insert_principal(&self, principal: &Principal) -> Result<(), DirectoryError>;

    async fn set_principal_active(
        &self,
        principal_id: Uuid,
        active: bool,
    ) -> Result<(), DirectoryError>;

    /// Fails with `Conflict` when the name is taken within the tenant.
    async fn insert_role(&self, role: &Role) -> Result<(), DirectoryError>;

    async fn rename_role(&self, role_id: Uuid, role_name: &str) -> Result<(), DirectoryError>;

    /// Removes the role with its assignments and grants.
    async fn delete_role(&self, role_id: Uuid) -> Result<(), DirectoryError>;

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), DirectoryError>;

    async fn revoke_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<bool, DirectoryError>;

    /// Appends to the role's ordered permission list, creating the catalog entry if needed.
    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<(), DirectoryError>;

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<bool, DirectoryError>;

    // ---- API keys ----

    /// Fails with `Conflict` when the hash is already stored.
    async fn insert_api_key(&self, api_key: &ApiKey) -> Result<(), DirectoryError>;

    async fn load_api_key(&self, api_key_id: Uuid) -> Result<Option<ApiKey>, DirectoryError>;

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, DirectoryError>;

    /// Keys of a tenant, newest first.
    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, DirectoryError>;

    /// `true` only for the call that turned an active key off.
    async fn deactivate_api_key(&self, api_key_id: Uuid) -> Result<bool, DirectoryError>;

    /// Deactivate `old_id` and insert `replacement` in one step. Fails with
    /// `Conflict`, changing nothing, when `old_id` is no longer active.
    async fn replace_api_key(
        &self,
        old_id: Uuid,
        replacement: &ApiKey,
    ) -> Result<(), DirectoryError>;

    async fn touch_api_key(
        &self,
        api_key_id: Uuid,
        used_utc: DateTime<Utc>,
    ) -> Result<(), DirectoryError>;

    async fn health_check(&self) -> Result<(), DirectoryError>;
}

pub type SharedDirectory = Arc<dyn Directory>;
