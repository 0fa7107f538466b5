//! PostgreSQL directory backed by sqlx.

use super::Directory;
use crate::models::{ApiKey, PermissionName, Principal, Role, Tenant, TenantStatus};
use crate::services::error::DirectoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow)]
struct PrincipalRow {
    principal_id: Uuid,
    tenant_id: Uuid,
    is_active: bool,
    two_factor_enabled: bool,
    totp_secret: Option<Vec<u8>>,
    is_superadmin: bool,
}

#[derive(Debug, FromRow)]
struct TenantRow {
    tenant_id: Uuid,
    status: String,
}

#[derive(Debug, FromRow)]
struct RoleRow {
    role_id: Uuid,
    tenant_id: Option<Uuid>,
    role_name: String,
    is_system: bool,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Self {
            role_id: row.role_id,
            tenant_id: row.tenant_id,
            role_name: row.role_name,
            is_system: row.is_system,
        }
    }
}

#[derive(FromRow)]
struct ApiKeyRow {
    api_key_id: Uuid,
    tenant_id: Uuid,
    owner_id: Uuid,
    name: String,
    key_hash: String,
    key_prefix: String,
    scopes: Vec<String>,
    rate_limit_per_minute: Option<i64>,
    expires_utc: Option<DateTime<Utc>>,
    is_active: bool,
    created_utc: DateTime<Utc>,
    last_used_utc: Option<DateTime<Utc>>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        Self {
            api_key_id: row.api_key_id,
            tenant_id: row.tenant_id,
            owner_id: row.owner_id,
            name: row.name,
            key_hash: row.key_hash,
            key_prefix: row.key_prefix,
            scopes: row.scopes,
            rate_limit_per_minute: row
                .rate_limit_per_minute
                .and_then(|n| u64::try_from(n).ok()),
            expires_utc: row.expires_utc,
            is_active: row.is_active,
            created_utc: row.created_utc,
            last_used_utc: row.last_used_utc,
        }
    }
}

const API_KEY_COLUMNS: &str = "api_key_id, tenant_id, owner_id, name, key_hash, key_prefix, scopes, \
     rate_limit_per_minute, expires_utc, is_active, created_utc, last_used_utc";

async fn insert_api_key_row<'e, E>(executor: E, api_key: &ApiKey) -> Result<(), DirectoryError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO api_keys (api_key_id, tenant_id, owner_id, name, key_hash, key_prefix, scopes,
                              rate_limit_per_minute, expires_utc, is_active, created_utc, last_used_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(api_key.api_key_id)
    .bind(api_key.tenant_id)
    .bind(api_key.owner_id)
    .bind(&api_key.name)
    .bind(&api_key.key_hash)
    .bind(&api_key.key_prefix)
    .bind(&api_key.scopes)
    .bind(
        api_key
            .rate_limit_per_minute
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
    )
    .bind(api_key.expires_utc)
    .bind(api_key.is_active)
    .bind(api_key.created_utc)
    .bind(api_key.last_used_utc)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DirectoryError::Conflict("api key hash exists".to_string())
        } else {
            DirectoryError::from(e)
        }
    })?;
    Ok(())
}

// Postgres unique violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn load_principal(&self, principal_id: Uuid) -> Result<Option<Principal>, DirectoryError> {
        let row = sqlx::query_as::<_, PrincipalRow>(
            r#"
            SELECT principal_id, tenant_id, is_active, two_factor_enabled, totp_secret, is_superadmin
            FROM principals WHERE principal_id = $1
            "#,
        )
        .bind(principal_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let backup_code_hashes = sqlx::query_scalar::<_, String>(
            "SELECT code_hash FROM principal_backup_codes WHERE principal_id = $1",
        )
        .bind(principal_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Principal {
            principal_id: row.principal_id,
            tenant_id: row.tenant_id,
            is_active: row.is_active,
            two_factor_enabled: row.two_factor_enabled,
            totp_secret: row.totp_secret,
            backup_code_hashes,
            is_superadmin: row.is_superadmin,
        }))
    }

    async fn load_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, DirectoryError> {
        let row = sqlx::query_as::<_, TenantRow>(
            "SELECT tenant_id, status FROM tenants WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let status = row
                .status
                .parse::<TenantStatus>()
                .map_err(|e| DirectoryError::Backend(anyhow::anyhow!(e)))?;
            Ok(Tenant {
                tenant_id: row.tenant_id,
                status,
            })
        })
        .transpose()
    }

    async fn load_roles_for_principal(
        &self,
        tenant_id: Uuid,
        principal_id: Uuid,
    ) -> Result<Vec<Uuid>, DirectoryError> {
        let role_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT pr.role_id
            FROM principal_roles pr
            JOIN roles r ON r.role_id = pr.role_id
            WHERE pr.principal_id = $1
              AND (r.tenant_id = $2 OR r.tenant_id IS NULL)
            ORDER BY pr.assigned_utc
            "#,
        )
        .bind(principal_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(role_ids)
    }

    async fn load_role(&self, role_id: Uuid) -> Result<Option<Role>, DirectoryError> {
        let row = sqlx::query_as::<_, RoleRow>(
            "SELECT role_id, tenant_id, role_name, is_system FROM roles WHERE role_id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Role::from))
    }

    async fn load_permissions_for_role(&self, role_id: Uuid) -> Result<Vec<String>, DirectoryError> {
        // Inner join drops grants whose catalog entry no longer exists.
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT p.permission_name
            FROM role_permissions rp
            JOIN permissions p ON p.permission_id = rp.permission_id
            WHERE rp.role_id = $1
            ORDER BY rp.position
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn find_role_by_name(
        &self,
        tenant_id: Uuid,
        role_name: &str,
    ) -> Result<Option<Role>, DirectoryError> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT role_id, tenant_id, role_name, is_system FROM roles
            WHERE role_name = $2 AND (tenant_id = $1 OR tenant_id IS NULL)
            ORDER BY tenant_id NULLS LAST
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(role_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Role::from))
    }

    async fn persist_totp_secret(
        &self,
        principal_id: Uuid,
        ciphertext: Option<&[u8]>,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query("UPDATE principals SET totp_secret = $1 WHERE principal_id = $2")
            .bind(ciphertext)
            .bind(principal_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(format!("principal {}", principal_id)));
        }
        Ok(())
    }

    async fn persist_backup_code_hashes(
        &self,
        principal_id: Uuid,
        hashes: &[String],
    ) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM principal_backup_codes WHERE principal_id = $1")
            .bind(principal_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO principal_backup_codes (principal_id, code_hash)
            SELECT $1, UNNEST($2::text[])
            "#,
        )
        .bind(principal_id)
        .bind(hashes)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_backup_code_hash(
        &self,
        principal_id: Uuid,
        hash: &str,
    ) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "DELETE FROM principal_backup_codes WHERE principal_id = $1 AND code_hash = $2",
        )
        .bind(principal_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_two_factor_enabled(
        &self,
        principal_id: Uuid,
        enabled: bool,
    ) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE principals SET two_factor_enabled = $1 WHERE principal_id = $2")
            .bind(enabled)
            .bind(principal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_two_factor(&self, principal_id: Uuid) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE principals SET two_factor_enabled = FALSE, totp_secret = NULL WHERE principal_id = $1",
        )
        .bind(principal_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM principal_backup_codes WHERE principal_id = $1")
            .bind(principal_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), DirectoryError> {
        sqlx::query("INSERT INTO tenants (tenant_id, status) VALUES ($1, $2)")
            .bind(tenant.tenant_id)
            .bind(tenant.status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DirectoryError::Conflict(format!("tenant {} exists", tenant.tenant_id))
                } else {
                    DirectoryError::from(e)
                }
            })?;
        Ok(())
    }

    async fn set_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query("UPDATE tenants SET status = $1 WHERE tenant_id = $2")
            .bind(status.as_str())
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(format!("tenant {}", tenant_id)));
        }
        Ok(())
    }

    async fn insert_principal(&self, principal: &Principal) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO principals (principal_id, tenant_id, is_active, two_factor_enabled, totp_secret, is_superadmin)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(principal.principal_id)
        .bind(principal.tenant_id)
        .bind(principal.is_active)
        .bind(principal.two_factor_enabled)
        .bind(&principal.totp_secret)
        .bind(principal.is_superadmin)
        .execute(&mut *tx)
        .await?;

        if !principal.backup_code_hashes.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO principal_backup_codes (principal_id, code_hash)
                SELECT $1, UNNEST($2::text[])
                "#,
            )
            .bind(principal.principal_id)
            .bind(&principal.backup_code_hashes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn set_principal_active(
        &self,
        principal_id: Uuid,
        active: bool,
    ) -> Result<(), DirectoryError> {
        let result = sqlx::query("UPDATE principals SET is_active = $1 WHERE principal_id = $2")
            .bind(active)
            .bind(principal_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::NotFound(format!("principal {}", principal_id)));
        }
        Ok(())
    }

    async fn insert_role(&self, role: &Role) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO roles (role_id, tenant_id, role_name, is_system) VALUES ($1, $2, $3, $4)",
        )
        .bind(role.role_id)
        .bind(role.tenant_id)
        .bind(&role.role_name)
        .bind(role.is_system)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DirectoryError::Conflict(format!("role {} exists", role.role_name))
            } else {
                DirectoryError::from(e)
            }
        })?;
        Ok(())
    }

    async fn rename_role(&self, role_id: Uuid, role_name: &str) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE roles SET role_name = $1 WHERE role_id = $2")
            .bind(role_name)
            .bind(role_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DirectoryError::Conflict(format!("role {} exists", role_name))
                } else {
                    DirectoryError::from(e)
                }
            })?;
        Ok(())
    }

    async fn delete_role(&self, role_id: Uuid) -> Result<(), DirectoryError> {
        // Assignments and grants cascade.
        sqlx::query("DELETE FROM roles WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn assign_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<(), DirectoryError> {
        sqlx::query(
            r#"
            INSERT INTO principal_roles (principal_id, role_id) VALUES ($1, $2)
            ON CONFLICT (principal_id, role_id) DO NOTHING
            "#,
        )
        .bind(principal_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_role(&self, principal_id: Uuid, role_id: Uuid) -> Result<bool, DirectoryError> {
        let result = sqlx::query("DELETE FROM principal_roles WHERE principal_id = $1 AND role_id = $2")
            .bind(principal_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn grant_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let permission_id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO permissions (permission_id, permission_name) VALUES ($1, $2)
            ON CONFLICT (permission_name) DO UPDATE SET permission_name = EXCLUDED.permission_name
            RETURNING permission_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(permission.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id, position)
            SELECT $1, $2, COALESCE(MAX(position) + 1, 0) FROM role_permissions WHERE role_id = $1
            ON CONFLICT (role_id, permission_id) DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn revoke_permission(
        &self,
        role_id: Uuid,
        permission: &PermissionName,
    ) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM role_permissions rp
            USING permissions p
            WHERE rp.permission_id = p.permission_id
              AND rp.role_id = $1
              AND p.permission_name = $2
            "#,
        )
        .bind(role_id)
        .bind(permission.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_api_key(&self, api_key: &ApiKey) -> Result<(), DirectoryError> {
        insert_api_key_row(&self.pool, api_key).await
    }

    async fn load_api_key(&self, api_key_id: Uuid) -> Result<Option<ApiKey>, DirectoryError> {
        let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {} FROM api_keys WHERE api_key_id = $1",
            API_KEY_COLUMNS
        ))
        .bind(api_key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, DirectoryError> {
        let row = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {} FROM api_keys WHERE key_hash = $1",
            API_KEY_COLUMNS
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ApiKey::from))
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, DirectoryError> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(&format!(
            "SELECT {} FROM api_keys WHERE tenant_id = $1 ORDER BY created_utc DESC",
            API_KEY_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApiKey::from).collect())
    }

    async fn deactivate_api_key(&self, api_key_id: Uuid) -> Result<bool, DirectoryError> {
        let result = sqlx::query(
            "UPDATE api_keys SET is_active = FALSE WHERE api_key_id = $1 AND is_active",
        )
        .bind(api_key_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_api_key(
        &self,
        old_id: Uuid,
        replacement: &ApiKey,
    ) -> Result<(), DirectoryError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE api_keys SET is_active = FALSE WHERE api_key_id = $1 AND is_active",
        )
        .bind(old_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return Err(DirectoryError::Conflict(format!(
                "api key {} is not active",
                old_id
            )));
        }

        insert_api_key_row(&mut *tx, replacement).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn touch_api_key(
        &self,
        api_key_id: Uuid,
        used_utc: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE api_keys SET last_used_utc = $1 WHERE api_key_id = $2")
            .bind(used_utc)
            .bind(api_key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DirectoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                DirectoryError::Backend(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db;

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn backup_code_removal_is_single_use() {
        let config = DatabaseConfig {
            url: "postgres://localhost/authz_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        };
        let pool = db::connect(&config, std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let directory = PgDirectory::new(pool);

        let tenant = Tenant::new();
        let principal = Principal::new(tenant.tenant_id);
        directory.insert_tenant(&tenant).await.unwrap();
        directory.insert_principal(&principal).await.unwrap();
        directory
            .persist_backup_code_hashes(principal.principal_id, &["h1".into(), "h2".into()])
            .await
            .unwrap();

        assert!(directory
            .remove_backup_code_hash(principal.principal_id, "h1")
            .await
            .unwrap());
        assert!(!directory
            .remove_backup_code_hash(principal.principal_id, "h1")
            .await
            .unwrap());
    }
}
