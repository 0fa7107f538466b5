pub mod api_key;
pub mod permission;
pub mod principal;
pub mod role;
pub mod tenant;

pub use api_key::{parse_scopes, ApiKey, API_KEY_PREFIX, DISPLAY_PREFIX_LEN};
pub use permission::{PermissionName, PermissionSet, WILDCARD_PERMISSION};
pub use principal::{CallerContext, Principal, TwoFactorState};
pub use role::Role;
pub use tenant::{Tenant, TenantStatus};
