//! Principal model - an authenticated user within a tenant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Second-factor lifecycle derived from the stored principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorState {
    Disabled,
    PendingSetup,
    Enabled,
}

/// Principal entity. Never physically deleted while referenced; disabled via `is_active`.
#[derive(Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: Uuid,
    pub tenant_id: Uuid,
    pub is_active: bool,
    pub two_factor_enabled: bool,
    /// Encrypted TOTP secret.
    pub totp_secret: Option<Vec<u8>>,
    /// One-way hashes of the unused backup codes.
    pub backup_code_hashes: Vec<String>,
    pub is_superadmin: bool,
}

impl Principal {
    /// Create a new active principal without a second factor.
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            principal_id: Uuid::new_v4(),
            tenant_id,
            is_active: true,
            two_factor_enabled: false,
            totp_secret: None,
            backup_code_hashes: Vec::new(),
            is_superadmin: false,
        }
    }

    pub fn two_factor_state(&self) -> TwoFactorState {
        match (self.two_factor_enabled, self.totp_secret.is_some()) {
            (true, true) => TwoFactorState::Enabled,
            (false, true) => TwoFactorState::PendingSetup,
            (_, false) => TwoFactorState::Disabled,
        }
    }
}

// Secret material stays out of logs.
impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("principal_id", &self.principal_id)
            .field("tenant_id", &self.tenant_id)
            .field("is_active", &self.is_active)
            .field("two_factor_enabled", &self.two_factor_enabled)
            .field("has_totp_secret", &self.totp_secret.is_some())
            .field("backup_codes", &self.backup_code_hashes.len())
            .field("is_superadmin", &self.is_superadmin)
            .finish()
    }
}

/// Capabilities of whoever is asking for a resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// Tenant-independent superadmin capability.
    pub superadmin: bool,
}

impl CallerContext {
    pub fn tenant_scoped() -> Self {
        Self { superadmin: false }
    }

    pub fn superadmin() -> Self {
        Self { superadmin: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_factor_state_follows_secret_and_flag() {
        let mut principal = Principal::new(Uuid::new_v4());
        assert_eq!(principal.two_factor_state(), TwoFactorState::Disabled);

        principal.totp_secret = Some(vec![1, 2, 3]);
        assert_eq!(principal.two_factor_state(), TwoFactorState::PendingSetup);

        principal.two_factor_enabled = true;
        assert_eq!(principal.two_factor_state(), TwoFactorState::Enabled);
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let mut principal = Principal::new(Uuid::new_v4());
        principal.totp_secret = Some(vec![0xde, 0xad]);
        principal.backup_code_hashes = vec!["abcdef".to_string()];

        let rendered = format!("{:?}", principal);
        assert!(!rendered.contains("abcdef"));
        assert!(!rendered.contains("222"));
        assert!(rendered.contains("has_totp_secret: true"));
    }
}
