//! Role and permission administration.
//!
//! Every mutation finishes its cache invalidation before returning `Ok`, so a
//! caller that sees success will never read the old permissions back.

use crate::models::{PermissionName, Principal, Role, TenantStatus};
use crate::services::cache::PermissionCache;
use crate::services::directory::SharedDirectory;
use crate::services::error::{AdminError, DirectoryError};
use std::sync::Arc;
use uuid::Uuid;

pub struct AccessAdmin {
    directory: SharedDirectory,
    cache: Arc<PermissionCache>,
}

impl AccessAdmin {
    pub fn new(directory: SharedDirectory, cache: Arc<PermissionCache>) -> Self {
        Self { directory, cache }
    }

    async fn principal_in(&self, tenant_id: Uuid, principal_id: Uuid) -> Result<Principal, AdminError> {
        let principal = self
            .directory
            .load_principal(principal_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("principal {}", principal_id)))?;
        if principal.tenant_id != tenant_id {
            return Err(AdminError::TenantMismatch);
        }
        Ok(principal)
    }

    /// A role the tenant may assign (its own or a system role).
    async fn assignable_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Role, AdminError> {
        let role = self
            .directory
            .load_role(role_id)
            .await?
            .ok_or_else(|| AdminError::NotFound(format!("role {}", role_id)))?;
        if !role.is_visible_to(tenant_id) {
            return Err(AdminError::TenantMismatch);
        }
        Ok(role)
    }

    /// A tenant-owned role that may be edited.
    async fn editable_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<Role, AdminError> {
        let role = self.assignable_role(tenant_id, role_id).await?;
        if role.is_system {
            return Err(AdminError::SystemRoleImmutable);
        }
        Ok(role)
    }

    fn duplicate_on_conflict(role_name: &str) -> impl FnOnce(DirectoryError) -> AdminError + '_ {
        move |err| match err {
            DirectoryError::Conflict(_) => AdminError::DuplicateRole(role_name.to_string()),
            other => AdminError::Directory(other),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn assign_role(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        role_id: Uuid,
    ) -> Result<(), AdminError> {
        self.principal_in(tenant_id, principal_id).await?;
        self.assignable_role(tenant_id, role_id).await?;

        self.directory.assign_role(principal_id, role_id).await?;
        self.cache.invalidate(tenant_id, principal_id).await?;

        tracing::info!("Role assigned");
        Ok(())
    }

    /// `false` when the principal did not hold the role.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_role(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        role_id: Uuid,
    ) -> Result<bool, AdminError> {
        self.principal_in(tenant_id, principal_id).await?;
        self.assignable_role(tenant_id, role_id).await?;

        let revoked = self.directory.revoke_role(principal_id, role_id).await?;
        self.cache.invalidate(tenant_id, principal_id).await?;

        tracing::info!(revoked, "Role revoked");
        Ok(revoked)
    }

    /// Create a tenant role with an ordered permission list.
    #[tracing::instrument(skip(self, permissions))]
    pub async fn create_role(
        &self,
        tenant_id: Uuid,
        role_name: &str,
        permissions: &[&str],
    ) -> Result<Role, AdminError> {
        let permissions = permissions
            .iter()
            .map(|raw| PermissionName::parse(raw).map_err(AdminError::InvalidPermission))
            .collect::<Result<Vec<_>, _>>()?;

        if self
            .directory
            .find_role_by_name(tenant_id, role_name)
            .await?
            .is_some()
        {
            return Err(AdminError::DuplicateRole(role_name.to_string()));
        }

        let role = Role::new(tenant_id, role_name);
        self.directory
            .insert_role(&role)
            .await
            .map_err(Self::duplicate_on_conflict(role_name))?;
        for permission in &permissions {
            self.directory
                .grant_permission(role.role_id, permission)
                .await?;
        }

        tracing::info!(role_id = %role.role_id, "Role created");
        Ok(role)
    }

    #[tracing::instrument(skip(self))]
    pub async fn rename_role(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        role_name: &str,
    ) -> Result<(), AdminError> {
        self.editable_role(tenant_id, role_id).await?;
        if let Some(existing) = self.directory.find_role_by_name(tenant_id, role_name).await? {
            if existing.role_id != role_id {
                return Err(AdminError::DuplicateRole(role_name.to_string()));
            }
        }

        self.directory
            .rename_role(role_id, role_name)
            .await
            .map_err(Self::duplicate_on_conflict(role_name))?;
        Ok(())
    }

    /// Holders lose the role's permissions immediately.
    #[tracing::instrument(skip(self))]
    pub async fn delete_role(&self, tenant_id: Uuid, role_id: Uuid) -> Result<(), AdminError> {
        self.editable_role(tenant_id, role_id).await?;

        self.directory.delete_role(role_id).await?;
        self.cache.invalidate_tenant(tenant_id).await?;

        tracing::info!("Role deleted");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn grant_permission(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        permission: &str,
    ) -> Result<(), AdminError> {
        let permission = PermissionName::parse(permission).map_err(AdminError::InvalidPermission)?;
        self.editable_role(tenant_id, role_id).await?;

        self.directory.grant_permission(role_id, &permission).await?;
        self.cache.invalidate_tenant(tenant_id).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn revoke_permission(
        &self,
        tenant_id: Uuid,
        role_id: Uuid,
        permission: &str,
    ) -> Result<bool, AdminError> {
        let permission = PermissionName::parse(permission).map_err(AdminError::InvalidPermission)?;
        self.editable_role(tenant_id, role_id).await?;

        let revoked = self.directory.revoke_permission(role_id, &permission).await?;
        self.cache.invalidate_tenant(tenant_id).await?;
        Ok(revoked)
    }

    /// Soft enable/disable. Inactive principals resolve to nothing.
    #[tracing::instrument(skip(self))]
    pub async fn set_principal_active(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        active: bool,
    ) -> Result<(), AdminError> {
        self.principal_in(tenant_id, principal_id).await?;

        self.directory.set_principal_active(principal_id, active).await?;
        self.cache.invalidate(tenant_id, principal_id).await?;

        tracing::info!(active, "Principal status changed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<(), AdminError> {
        self.directory
            .set_tenant_status(tenant_id, status)
            .await
            .map_err(|e| match e {
                DirectoryError::NotFound(what) => AdminError::NotFound(what),
                other => AdminError::Directory(other),
            })?;
        self.cache.invalidate_tenant(tenant_id).await?;

        tracing::info!(status = status.as_str(), "Tenant status changed");
        Ok(())
    }
}
