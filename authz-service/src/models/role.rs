//! Role model - named bundles of permissions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role entity. `tenant_id = None` marks a tenant-independent system role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub role_name: String,
    pub is_system: bool,
}

impl Role {
    /// Create a new tenant-scoped role.
    pub fn new(tenant_id: Uuid, role_name: impl Into<String>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            tenant_id: Some(tenant_id),
            role_name: role_name.into(),
            is_system: false,
        }
    }

    /// Create an immutable role shared by every tenant.
    pub fn system(role_name: impl Into<String>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            tenant_id: None,
            role_name: role_name.into(),
            is_system: true,
        }
    }

    /// Whether principals of `tenant_id` may hold this role.
    pub fn is_visible_to(&self, tenant_id: Uuid) -> bool {
        self.tenant_id.map_or(true, |owner| owner == tenant_id)
    }
}
