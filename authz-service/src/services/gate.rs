//! Authorization Gate: the single decision point for inbound requests.
//!
//! Order of checks: rate limit, permission resolution, second factor, then
//! permission membership. Denials carry only a reason category.
//!
//! API-key requests skip the second factor: the key is authenticated, its own
//! quota applied, and the permission checked against the key's narrowed set.

use crate::models::CallerContext;
use crate::services::api_keys::ApiKeyService;
use crate::services::error::{ApiKeyError, ResolveError};
use crate::services::rate_limit::{RateDecision, RateLimiter};
use crate::services::resolver::PermissionResolver;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub tenant_id: Uuid,
    pub principal_id: Uuid,
    pub permission: String,
    pub endpoint_class: String,
    /// User id or client IP the rate limiter counts against.
    pub caller_identity: String,
    /// Set only after a successful `verify_login` for this session.
    pub second_factor_verified: bool,
    pub caller: CallerContext,
}

impl AuthorizationContext {
    pub fn new(
        tenant_id: Uuid,
        principal_id: Uuid,
        permission: impl Into<String>,
        endpoint_class: impl Into<String>,
        caller_identity: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            principal_id,
            permission: permission.into(),
            endpoint_class: endpoint_class.into(),
            caller_identity: caller_identity.into(),
            second_factor_verified: false,
            caller: CallerContext::default(),
        }
    }

    pub fn with_second_factor(mut self) -> Self {
        self.second_factor_verified = true;
        self
    }

    pub fn with_caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }
}

/// A request authenticated by API key. The key itself is passed separately.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub tenant_id: Uuid,
    pub permission: String,
    pub endpoint_class: String,
    pub caller_identity: String,
}

impl ApiKeyContext {
    pub fn new(
        tenant_id: Uuid,
        permission: impl Into<String>,
        endpoint_class: impl Into<String>,
        caller_identity: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            permission: permission.into(),
            endpoint_class: endpoint_class.into(),
            caller_identity: caller_identity.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    RateLimited { retry_after_seconds: u64 },
    SecondFactorRequired,
    Forbidden,
    TenantMismatch,
    /// Permission data could not be read; distinct from a real `Forbidden`.
    ResolutionUnavailable,
    /// The presented API key is unknown, revoked or expired.
    InvalidCredentials,
}

impl DenyReason {
    pub fn category(&self) -> &'static str {
        match self {
            DenyReason::RateLimited { .. } => "rate_limited",
            DenyReason::SecondFactorRequired => "second_factor_required",
            DenyReason::Forbidden => "forbidden",
            DenyReason::TenantMismatch => "tenant_mismatch",
            DenyReason::ResolutionUnavailable => "resolution_unavailable",
            DenyReason::InvalidCredentials => "invalid_credentials",
        }
    }

    /// Worth retrying later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DenyReason::RateLimited { .. } | DenyReason::ResolutionUnavailable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub struct AuthorizationGate {
    rate_limiter: Arc<RateLimiter>,
    resolver: Arc<PermissionResolver>,
    api_keys: Arc<ApiKeyService>,
}

impl AuthorizationGate {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        resolver: Arc<PermissionResolver>,
        api_keys: Arc<ApiKeyService>,
    ) -> Self {
        Self {
            rate_limiter,
            resolver,
            api_keys,
        }
    }

    async fn endpoint_limit(&self, endpoint_class: &str, caller_identity: &str) -> Option<Decision> {
        match self
            .rate_limiter
            .check_and_increment(endpoint_class, caller_identity)
            .await
        {
            RateDecision::Allow { .. } => None,
            RateDecision::Deny {
                retry_after_seconds,
            } => Some(Decision::Deny(DenyReason::RateLimited {
                retry_after_seconds,
            })),
        }
    }

    #[tracing::instrument(
        skip(self, context),
        fields(
            tenant_id = %context.tenant_id,
            principal_id = %context.principal_id,
            endpoint_class = %context.endpoint_class
        )
    )]
    pub async fn authorize(&self, context: &AuthorizationContext) -> Decision {
        let decision = self.decide(context).await;
        if let Decision::Deny(reason) = decision {
            tracing::info!(reason = reason.category(), "Request denied");
        }
        decision
    }

    async fn decide(&self, context: &AuthorizationContext) -> Decision {
        if let Some(denied) = self
            .endpoint_limit(&context.endpoint_class, &context.caller_identity)
            .await
        {
            return denied;
        }

        let access = match self
            .resolver
            .resolve_access(context.tenant_id, context.principal_id, &context.caller)
            .await
        {
            Ok(access) => access,
            // Unknown principals look the same as missing permissions.
            Err(ResolveError::PrincipalNotFound) => return Decision::Deny(DenyReason::Forbidden),
            Err(ResolveError::TenantMismatch) => {
                return Decision::Deny(DenyReason::TenantMismatch)
            }
            Err(e @ (ResolveError::Unavailable(_) | ResolveError::CircuitOpen { .. })) => {
                tracing::error!(error = %e, "Permission resolution unavailable");
                return Decision::Deny(DenyReason::ResolutionUnavailable);
            }
        };

        if access.requires_second_factor && !context.second_factor_verified {
            return Decision::Deny(DenyReason::SecondFactorRequired);
        }

        if access.permissions.contains(&context.permission) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::Forbidden)
        }
    }

    #[tracing::instrument(
        skip(self, api_key, context),
        fields(tenant_id = %context.tenant_id, endpoint_class = %context.endpoint_class)
    )]
    pub async fn authorize_api_key(&self, api_key: &str, context: &ApiKeyContext) -> Decision {
        let decision = self.decide_api_key(api_key, context).await;
        if let Decision::Deny(reason) = decision {
            tracing::info!(reason = reason.category(), "API key request denied");
        }
        decision
    }

    async fn decide_api_key(&self, api_key: &str, context: &ApiKeyContext) -> Decision {
        if let Some(denied) = self
            .endpoint_limit(&context.endpoint_class, &context.caller_identity)
            .await
        {
            return denied;
        }

        let access = match self.api_keys.authenticate(api_key).await {
            Ok(access) => access,
            Err(ApiKeyError::RateLimited {
                retry_after_seconds,
            }) => {
                return Decision::Deny(DenyReason::RateLimited {
                    retry_after_seconds,
                })
            }
            Err(e @ (ApiKeyError::Resolve(_) | ApiKeyError::Directory(_))) => {
                tracing::error!(error = %e, "API key resolution unavailable");
                return Decision::Deny(DenyReason::ResolutionUnavailable);
            }
            Err(_) => return Decision::Deny(DenyReason::InvalidCredentials),
        };

        if access.tenant_id != context.tenant_id {
            tracing::warn!(api_key_id = %access.api_key_id, "API key used against another tenant");
            return Decision::Deny(DenyReason::TenantMismatch);
        }

        if access.permissions.contains(&context.permission) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::Forbidden)
        }
    }
}
