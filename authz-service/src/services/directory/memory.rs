use super::Directory;
use crate::models::{ApiKey, PermissionName, Principal, Role, Tenant, TenantStatus};
use crate::services::error::DirectoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct DirectoryState {
    tenants: HashMap<Uuid, Tenant>,
    principals: HashMap<Uuid, Principal>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, Vec<String>>,
    principal_roles: HashMap<Uuid, Vec<Uuid>>,
    catalog: HashSet<String>,
    api_keys: HashMap<Uuid, ApiKey>,
}

impl DirectoryState {
    fn hash_taken(&self, key_hash: &str) -> bool {
        self.api_keys.values().any(|key| key.key_hash == key_hash)
    }
}

/// In-process directory for tests and local wiring.
///
/// Counts role loads so callers can observe cache misses, and can be switched
/// to fail every call to simulate an unreachable database.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
    role_loads: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `load_roles_for_principal` calls served so far.
    pub fn role_loads(&self) -> usize {
        self.role_loads.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with a backend error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a catalog entry while leaving role references dangling.
    pub fn remove_catalog_entry(&self, permission: &str) -> Result<(), DirectoryError> {
        self.lock()?.catalog.remove(permission);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Backend(anyhow::anyhow!(
                "Directory unavailable"
            )));
        }
        self.state
            .lock()
            .map_err(|e| DirectoryError::Backend(anyhow::anyhow!("Directory mutex poisoned: {}", e)))
    }
}

fn missing(what: &str, id: Uuid) -> DirectoryError {
    DirectoryError::NotFound(format!("{} {}", what, id))
}

fn principal_mut(
    state: &mut DirectoryState,
    principal_id: Uuid,
) -> Result<&mut Principal, DirectoryError> {
    state
        .principals
        .get_mut(&principal_id)
        .ok_or_else(|| missing("principal", principal_id))
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn load_principal(&self, principal_id: Uuid) -> Result<Option<Principal>, DirectoryError> {
        Ok(self.lock()?.principals.get(&principal_id).cloned())
    }

    async fn load_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, DirectoryError> {
        Ok(self.lock()?.tenants.get(&tenant_id).cloned())
    }

    async fn load_roles_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Vec<Uuid>, DirectoryError> {
        let state = self.lock()?;
        self.role_loads.fetch_add(1, Ordering::SeqCst);

        let role_ids = state
            .principal_roles
            .get(&principal_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        state
                            .roles
                            .get(id)
                            .is_some_and(|role| role.is_visible_to(tenant_id))
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok(role_ids)
    }

    async fn load_role(&self, role_id: Uuid) -> Result<Option<Role>, DirectoryError> {
        Ok(self.lock()?.roles.get(&role_id).cloned())
    }

    async fn load_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<String>, DirectoryError> {
        let state = self.lock()?;
        let names = state
            .role_permissions
            .get(&role_id)
            .map(|names| {
                names
                    .iter()
                    .filter(|name| state.catalog.contains(name.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn find_role_by_name(
        &self,
        tenant_id: Uuid,
        role_name: &str,
    ) -> Result<Option<Role>, DirectoryError> {
        let state = self.lock()?;
        Ok(state
            .roles
            .values()
            .find(|role| role.tenant_id == Some(tenant_id) && role.role_name == role_name)
            .or_else(|| {
                state
                    .roles
                    .values()
                    .find(|role| role.tenant_id.is_none() && role.role_name == role_name)
            })
            .cloned())
    }

    async fn persist_totp_secret(
        &self,
        principal_id: Uuid,
        ciphertext: Option<&[u8]>,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        principal_mut(&mut state, principal_id)?.totp_secret = ciphertext.map(<[u8]>::to_vec);
        Ok(())
    }

    async fn persist_backup_code_hashes(
        &self,
        principal_id: Uuid,
        hashes: &[String],
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        principal_mut(&mut state, principal_id)?.backup_code_hashes = hashes.to_vec();
        Ok(())
    }

    async fn remove_backup_code_hash(
        &self,
        principal_id: Uuid,
        hash: &str,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.lock()?;
        let principal = principal_mut(&mut state, principal_id)?;
        let before = principal.backup_code_hashes.len();
        principal.backup_code_hashes.retain(|stored| stored != hash);
        Ok(principal.backup_code_hashes.len() < before)
    }

    async fn set_two_factor_enabled(
        &self,
        principal_id: Uuid,
        enabled: bool,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        principal_mut(&mut state, principal_id)?.two_factor_enabled = enabled;
        Ok(())
    }

    async fn clear_two_factor(&self, principal_id: Uuid) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        let principal = principal_mut(&mut state, principal_id)?;
        principal.two_factor_enabled = false;
        principal.totp_secret = None;
        principal.backup_code_hashes.clear();
        Ok(())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if state.tenants.contains_key(&tenant.tenant_id) {
            return Err(DirectoryError::Conflict(format!(
                "tenant {} exists",
                tenant.tenant_id
            )));
        }
        state.tenants.insert(tenant.tenant_id, tenant.clone());
        Ok(())
    }

    async fn set_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| missing("tenant", tenant_id))?
            .status = status;
        Ok(())
    }

    async fn insert_principal(&self, principal: &Principal) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if !state.tenants.contains_key(&principal.tenant_id) {
            return Err(missing("tenant", principal.tenant_id));
        }
        state
            .principals
            .insert(principal.principal_id, principal.clone());
        Ok(())
    }

    async fn set_principal_active(
        &self,
        principal_id: Uuid,
        active: bool,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        principal_mut(&mut state, principal_id)?.is_active = active;
        Ok(())
    }

    async fn insert_role(&self, role: &Role) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        let taken = state
            .roles
            .values()
            .any(|existing| existing.tenant_id == role.tenant_id && existing.role_name == role.role_name);
        if taken {
            return Err(DirectoryError::Conflict(format!(
                "role {} exists",
                role.role_name
            )));
        }
        state.roles.insert(role.role_id, role.clone());
        Ok(())
    }

    async fn rename_role(&self, role_id: Uuid, role_name: &str) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        let tenant_id = state
            .roles
            .get(&role_id)
            .ok_or_else(|| missing("role", role_id))?
            .tenant_id;
        let taken = state.roles.values().any(|existing| {
            existing.role_id != role_id
                && existing.tenant_id == tenant_id
                && existing.role_name == role_name
        });
        if taken {
            return Err(DirectoryError::Conflict(format!("role {} exists", role_name)));
        }
        if let Some(role) = state.roles.get_mut(&role_id) {
            role.role_name = role_name.to_string();
        }
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        state.roles.remove(&role_id);
        state.role_permissions.remove(&role_id);
        for held in state.principal_roles.values_mut() {
            held.retain(|id| *id != role_id);
        }
        Ok(())
    }

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if !state.roles.contains_key(&role_id) {
            return Err(missing("role", role_id));
        }
        if !state.principals.contains_key(&principal_id) {
            return Err(missing("principal", principal_id));
        }
        let held = state.principal_roles.entry(principal_id).or_default();
        if !held.contains(&role_id) {
            held.push(role_id);
        }
        Ok(())
    }

    async fn revoke_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<bool, DirectoryError> {
        let mut state = self.lock()?;
        let Some(held) = state.principal_roles.get_mut(&principal_id) else {
            return Ok(false);
        };
        let before = held.len();
        held.retain(|id| *id != role_id);
        Ok(held.len() < before)
    }

    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if !state.roles.contains_key(&role_id) {
            return Err(missing("role", role_id));
        }
        state.catalog.insert(permission.as_str().to_string());
        let granted = state.role_permissions.entry(role_id).or_default();
        if !granted.iter().any(|name| name == permission.as_str()) {
            granted.push(permission.as_str().to_string());
        }
        Ok(())
    }

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<bool, DirectoryError> {
        let mut state = self.lock()?;
        let Some(granted) = state.role_permissions.get_mut(&role_id) else {
            return Ok(false);
        };
        let before = granted.len();
        granted.retain(|name| name != permission.as_str());
        Ok(granted.len() < before)
    }

    async fn insert_api_key(&self, api_key: &ApiKey) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if state.hash_taken(&api_key.key_hash) {
            return Err(DirectoryError::Conflict("api key hash exists".to_string()));
        }
        state.api_keys.insert(api_key.api_key_id, api_key.clone());
        Ok(())
    }

    async fn load_api_key(&self, api_key_id: Uuid) -> Result<Option<ApiKey>, DirectoryError> {
        Ok(self.lock()?.api_keys.get(&api_key_id).cloned())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, DirectoryError> {
        Ok(self
            .lock()?
            .api_keys
            .values()
            .find(|key| key.key_hash == key_hash)
            .cloned())
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, DirectoryError> {
        let mut keys: Vec<ApiKey> = self
            .lock()?
            .api_keys
            .values()
            .filter(|key| key.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        Ok(keys)
    }

    async fn deactivate_api_key(&self, api_key_id: Uuid) -> Result<bool, DirectoryError> {
        let mut state = self.lock()?;
        let Some(key) = state.api_keys.get_mut(&api_key_id) else {
            return Ok(false);
        };
        let was_active = key.is_active;
        key.is_active = false;
        Ok(was_active)
    }

    async fn replace_api_key(
        &self,
        old_id: Uuid,
        replacement: &ApiKey,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        if !state.api_keys.get(&old_id).is_some_and(|key| key.is_active) {
            return Err(DirectoryError::Conflict(format!(
                "api key {} is not active",
                old_id
            )));
        }
        if state.hash_taken(&replacement.key_hash) {
            return Err(DirectoryError::Conflict("api key hash exists".to_string()));
        }
        if let Some(old) = state.api_keys.get_mut(&old_id) {
            old.is_active = false;
        }
        state
            .api_keys
            .insert(replacement.api_key_id, replacement.clone());
        Ok(())
    }

    async fn touch_api_key(
        &self,
        api_key_id: Uuid,
        used_utc: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let mut state = self.lock()?;
        state
            .api_keys
            .get_mut(&api_key_id)
            .ok_or_else(|| missing("api key", api_key_id))?
            .last_used_utc = Some(used_utc);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DirectoryError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryDirectory, Tenant, Principal) {
        let directory = MemoryDirectory::new();
        let tenant = Tenant::new();
        let principal = Principal::new(tenant.tenant_id);
        directory.insert_tenant(&tenant).await.unwrap();
        directory.insert_principal(&principal).await.unwrap();
        (directory, tenant, principal)
    }

    #[tokio::test]
    async fn backup_hash_removal_succeeds_once() {
        let (directory, _, principal) = seeded().await;
        directory
            .persist_backup_code_hashes(principal.principal_id, &["a".into(), "b".into()])
            .await
            .unwrap();

        assert!(directory
            .remove_backup_code_hash(principal.principal_id, "a")
            .await
            .unwrap());
        assert!(!directory
            .remove_backup_code_hash(principal.principal_id, "a")
            .await
            .unwrap());

        let stored = directory
            .load_principal(principal.principal_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.backup_code_hashes, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn permissions_keep_grant_order_and_skip_removed_catalog_entries() {
        let (directory, tenant, _) = seeded().await;
        let role = Role::new(tenant.tenant_id, "editor");
        directory.insert_role(&role).await.unwrap();
        for name in ["posts:read", "posts:create", "posts:archive"] {
            let permission = PermissionName::parse(name).unwrap();
            directory.grant_permission(role.role_id, &permission).await.unwrap();
        }
        directory.remove_catalog_entry("posts:create").unwrap();

        let names = directory.load_permissions_for_role(role.role_id).await.unwrap();
        assert_eq!(names, vec!["posts:read", "posts:archive"]);
    }

    #[tokio::test]
    async fn role_names_are_unique_per_tenant() {
        let (directory, tenant, _) = seeded().await;
        directory
            .insert_role(&Role::new(tenant.tenant_id, "editor"))
            .await
            .unwrap();

        let duplicate = directory.insert_role(&Role::new(tenant.tenant_id, "editor")).await;
        assert!(matches!(duplicate, Err(DirectoryError::Conflict(_))));

        directory
            .insert_role(&Role::new(Uuid::new_v4(), "editor"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn roles_of_other_tenants_are_not_loaded() {
        let (directory, tenant, principal) = seeded().await;
        let foreign = Role::new(Uuid::new_v4(), "intruder");
        let system = Role::system("viewer");
        directory.insert_role(&foreign).await.unwrap();
        directory.insert_role(&system).await.unwrap();
        directory.assign_role(principal.principal_id, foreign.role_id).await.unwrap();
        directory.assign_role(principal.principal_id, system.role_id).await.unwrap();

        let roles = directory
            .load_roles_for_principal(tenant.tenant_id, principal.principal_id)
            .await
            .unwrap();
        assert_eq!(roles, vec![system.role_id]);
        assert_eq!(directory.role_loads(), 1);
    }

    #[tokio::test]
    async fn replacing_an_api_key_is_all_or_nothing() {
        let (directory, tenant, principal) = seeded().await;
        let old = api_key(&tenant, &principal, "h-old");
        directory.insert_api_key(&old).await.unwrap();

        let new = api_key(&tenant, &principal, "h-new");
        directory.replace_api_key(old.api_key_id, &new).await.unwrap();
        let stored = directory.load_api_key(old.api_key_id).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert!(directory.find_api_key_by_hash("h-new").await.unwrap().is_some());

        // The old key is no longer active, so a second replacement changes nothing.
        let again = api_key(&tenant, &principal, "h-again");
        assert!(matches!(
            directory.replace_api_key(old.api_key_id, &again).await,
            Err(DirectoryError::Conflict(_))
        ));
        assert!(directory.find_api_key_by_hash("h-again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn api_key_hashes_are_unique() {
        let (directory, tenant, principal) = seeded().await;
        directory
            .insert_api_key(&api_key(&tenant, &principal, "h"))
            .await
            .unwrap();
        assert!(matches!(
            directory.insert_api_key(&api_key(&tenant, &principal, "h")).await,
            Err(DirectoryError::Conflict(_))
        ));
    }

    fn api_key(tenant: &Tenant, principal: &Principal, hash: &str) -> ApiKey {
        ApiKey {
            api_key_id: Uuid::new_v4(),
            tenant_id: tenant.tenant_id,
            owner_id: principal.principal_id,
            name: "ci".to_string(),
            key_hash: hash.to_string(),
            key_prefix: "authz_abcdef".to_string(),
            scopes: vec!["posts:read".to_string()],
            rate_limit_per_minute: None,
            expires_utc: None,
            is_active: true,
            created_utc: Utc::now(),
            last_used_utc: None,
        }
    }

    #[tokio::test]
    async fn unavailable_directory_fails_every_call() {
        let (directory, _, principal) = seeded().await;
        directory.set_unavailable(true);
        assert!(directory.load_principal(principal.principal_id).await.is_err());
        assert!(directory.health_check().await.is_err());

        directory.set_unavailable(false);
        assert!(directory.health_check().await.is_ok());
    }
}
