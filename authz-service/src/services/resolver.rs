//! Permission Resolver: the effective permission set of a principal.
//!
//! Consults the cache first; on a miss loads the principal, its roles and each
//! role's permissions through the directory (guarded by a circuit breaker and a
//! timeout), builds the union once and writes it back.

use crate::models::{CallerContext, PermissionSet, Principal};
use crate::services::cache::{CacheLookup, PermissionCache, ResolvedAccess};
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::directory::SharedDirectory;
use crate::services::error::{DirectoryError, ResolveError};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct PermissionResolver {
    directory: SharedDirectory,
    cache: Arc<PermissionCache>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl PermissionResolver {
    pub fn new(
        directory: SharedDirectory,
        cache: Arc<PermissionCache>,
        breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            cache,
            breaker,
            timeout,
        }
    }

    /// Run a directory read behind the breaker with a deadline.
    pub(crate) async fn guarded<T, F, Fut>(&self, read: F) -> Result<T, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DirectoryError>>,
    {
        let timeout = self.timeout;
        self.breaker
            .call(|| async move {
                tokio::time::timeout(timeout, read())
                    .await
                    .map_err(|_| DirectoryError::Timeout(timeout))?
            })
            .await
            .map_err(ResolveError::from)
    }

    /// Load the principal and apply the cross-tenant guard.
    async fn principal_in_tenant(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
    ) -> Result<Principal, ResolveError> {
        let directory = self.directory.clone();
        let principal = self
            .guarded(|| async move { directory.load_principal(principal_id).await })
            .await?
            .ok_or(ResolveError::PrincipalNotFound)?;

        if principal.tenant_id != tenant_id && !caller.superadmin && !principal.is_superadmin {
            tracing::warn!(
                %tenant_id,
                %principal_id,
                "Cross-tenant resolution rejected"
            );
            return Err(ResolveError::TenantMismatch);
        }

        Ok(principal)
    }

    /// Permissions plus the second-factor requirement.
    #[tracing::instrument(skip(self, caller))]
    pub async fn resolve_access(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
    ) -> Result<ResolvedAccess, ResolveError> {
        let stamp = match self.cache.lookup(tenant_id, principal_id).await {
            Ok(CacheLookup::Hit(access)) => {
                tracing::debug!("Permission cache hit");
                return Ok(access);
            }
            Ok(CacheLookup::Miss(stamp)) => Some(stamp),
            Err(e) => {
                tracing::warn!(error = %e, "Permission cache unavailable, reading directory");
                None
            }
        };

        let principal = self.principal_in_tenant(tenant_id, principal_id, caller).await?;
        let access = self.compute(&principal).await?;

        // Only same-tenant results are cached; cross-tenant views are rebuilt each time.
        if let Some(stamp) = stamp.filter(|_| principal.tenant_id == tenant_id) {
            if let Err(e) = self
                .cache
                .put_stamped(tenant_id, principal_id, stamp, &access)
                .await
            {
                tracing::warn!(error = %e, "Failed to cache resolved permissions");
            }
        }

        Ok(access)
    }

    async fn compute(&self, principal: &Principal) -> Result<ResolvedAccess, ResolveError> {
        if !principal.is_active {
            return Ok(ResolvedAccess::denied());
        }

        let requires_second_factor = principal.two_factor_enabled;
        if principal.is_superadmin {
            return Ok(ResolvedAccess {
                permissions: PermissionSet::wildcard(),
                requires_second_factor,
            });
        }

        let home_tenant = principal.tenant_id;
        let principal_id = principal.principal_id;
        let directory = self.directory.clone();

        let names = self
            .guarded(|| async move {
                let tenant_active = directory
                    .load_tenant(home_tenant)
                    .await?
                    .is_some_and(|tenant| tenant.is_active());
                if !tenant_active {
                    return Ok::<_, DirectoryError>(None);
                }

                let mut names = BTreeSet::new();
                for role_id in directory
                    .load_roles_for_principal(home_tenant, principal_id)
                    .await?
                {
                    names.extend(directory.load_permissions_for_role(role_id).await?);
                }
                Ok::<_, DirectoryError>(Some(names))
            })
            .await?;

        Ok(match names {
            Some(names) => ResolvedAccess {
                permissions: names.into_iter().collect(),
                requires_second_factor,
            },
            None => ResolvedAccess::denied(),
        })
    }

    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
    ) -> Result<PermissionSet, ResolveError> {
        Ok(self
            .resolve_access(tenant_id, principal_id, caller)
            .await?
            .permissions)
    }

    pub async fn has_permission(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
        permission: &str,
    ) -> Result<bool, ResolveError> {
        Ok(self
            .resolve(tenant_id, principal_id, caller)
            .await?
            .contains(permission))
    }

    /// `false` for an empty list.
    pub async fn has_any_permission(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
        permissions: &[&str],
    ) -> Result<bool, ResolveError> {
        Ok(self
            .resolve(tenant_id, principal_id, caller)
            .await?
            .contains_any(permissions.iter().copied()))
    }

    /// `true` for an empty list.
    pub async fn has_all_permissions(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
        permissions: &[&str],
    ) -> Result<bool, ResolveError> {
        Ok(self
            .resolve(tenant_id, principal_id, caller)
            .await?
            .contains_all(permissions.iter().copied()))
    }

    /// Whether the principal holds a role named `role_name`. Read through to the directory.
    pub async fn has_role(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
        caller: &CallerContext,
        role_name: &str,
    ) -> Result<bool, ResolveError> {
        let principal = self.principal_in_tenant(tenant_id, principal_id, caller).await?;
        if !principal.is_active {
            return Ok(false);
        }

        let directory = self.directory.clone();
        let home_tenant = principal.tenant_id;
        let role_name = role_name.to_string();
        self.guarded(|| async move {
            for role_id in directory
                .load_roles_for_principal(home_tenant, principal_id)
                .await?
            {
                if let Some(role) = directory.load_role(role_id).await? {
                    if role.role_name == role_name {
                        return Ok::<_, DirectoryError>(true);
                    }
                }
            }
            Ok::<_, DirectoryError>(false)
        })
        .await
    }
}
