//! Integration tests for the authorization gate.

mod common;

use authz_service::models::CallerContext;
use authz_service::services::{AuthorizationContext, Decision, DenyReason};
use common::{FailingStore, TestApp};
use service_core::clock::ManualClock;
use std::sync::Arc;
use uuid::Uuid;

fn request(tenant_id: Uuid, principal_id: Uuid, permission: &str) -> AuthorizationContext {
    AuthorizationContext::new(tenant_id, principal_id, permission, "api", principal_id.to_string())
}

// ============================================================================
// Permission checks
// ============================================================================

#[tokio::test]
async fn editor_can_read_but_not_delete() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;

    let delete = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, principal.principal_id, "posts:delete"))
        .await;
    assert_eq!(delete, Decision::Deny(DenyReason::Forbidden));

    let read = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, principal.principal_id, "posts:read"))
        .await;
    assert_eq!(read, Decision::Allow);
}

#[tokio::test]
async fn unknown_principal_is_forbidden() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;

    let decision = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, Uuid::new_v4(), "posts:read"))
        .await;
    assert_eq!(decision, Decision::Deny(DenyReason::Forbidden));
}

#[tokio::test]
async fn cross_tenant_request_is_rejected() {
    let app = TestApp::spawn();
    let other = app.create_tenant().await;
    let (_, principal, _) = app.editor().await;

    let decision = app
        .core
        .gate
        .authorize(&request(other.tenant_id, principal.principal_id, "posts:read"))
        .await;
    assert_eq!(decision, Decision::Deny(DenyReason::TenantMismatch));

    let as_superadmin = app
        .core
        .gate
        .authorize(
            &request(other.tenant_id, principal.principal_id, "posts:read")
                .with_caller(CallerContext::superadmin()),
        )
        .await;
    assert_eq!(as_superadmin, Decision::Allow);
}

#[tokio::test]
async fn superadmin_principal_is_allowed_anything() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;
    let admin = app.create_superadmin(&tenant).await;

    let decision = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, admin.principal_id, "billing:refund"))
        .await;
    assert!(decision.is_allowed());
}

#[tokio::test]
async fn revoked_role_takes_effect_on_next_request() {
    let app = TestApp::spawn();
    let (tenant, principal, role) = app.editor().await;
    let ctx = request(tenant.tenant_id, principal.principal_id, "posts:read");

    assert!(app.core.gate.authorize(&ctx).await.is_allowed());

    app.core
        .admin
        .revoke_role(tenant.tenant_id, principal.principal_id, role.role_id)
        .await
        .unwrap();

    assert_eq!(
        app.core.gate.authorize(&ctx).await,
        Decision::Deny(DenyReason::Forbidden)
    );
}

// ============================================================================
// Second factor
// ============================================================================

#[tokio::test]
async fn enabled_second_factor_must_be_verified() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    app.enable_totp(&principal).await;

    let ctx = request(tenant.tenant_id, principal.principal_id, "posts:read");
    assert_eq!(
        app.core.gate.authorize(&ctx).await,
        Decision::Deny(DenyReason::SecondFactorRequired)
    );

    let verified = ctx.with_second_factor();
    assert_eq!(app.core.gate.authorize(&verified).await, Decision::Allow);
}

#[tokio::test]
async fn second_factor_is_checked_before_permission() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    app.enable_totp(&principal).await;

    let decision = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, principal.principal_id, "posts:delete"))
        .await;
    assert_eq!(decision, Decision::Deny(DenyReason::SecondFactorRequired));
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn sixth_login_in_window_is_rate_limited() {
    let app = TestApp::spawn_with(&[("AUTHZ_RATE_LIMIT_LOGIN", "5/60")]);
    let (tenant, principal, _) = app.editor().await;
    let ctx = AuthorizationContext::new(
        tenant.tenant_id,
        principal.principal_id,
        "posts:read",
        "login",
        "203.0.113.7",
    );

    for attempt in 1..=5 {
        assert!(
            app.core.gate.authorize(&ctx).await.is_allowed(),
            "attempt {} should pass",
            attempt
        );
    }

    match app.core.gate.authorize(&ctx).await {
        Decision::Deny(DenyReason::RateLimited {
            retry_after_seconds,
        }) => assert!(retry_after_seconds >= 1 && retry_after_seconds <= 60),
        other => panic!("expected rate limit, got {:?}", other),
    }
}

#[tokio::test]
async fn rate_limit_applies_before_resolution() {
    let app = TestApp::spawn_with(&[("AUTHZ_RATE_LIMIT_ADMIN", "1/60")]);
    let tenant = app.create_tenant().await;
    let ctx = AuthorizationContext::new(
        tenant.tenant_id,
        Uuid::new_v4(),
        "posts:read",
        "admin",
        "198.51.100.1",
    );

    assert_eq!(
        app.core.gate.authorize(&ctx).await,
        Decision::Deny(DenyReason::Forbidden)
    );
    assert!(matches!(
        app.core.gate.authorize(&ctx).await,
        Decision::Deny(DenyReason::RateLimited { .. })
    ));
}

#[tokio::test]
async fn unreachable_store_fails_closed() {
    let app = TestApp::spawn_over(&[], Arc::new(FailingStore), ManualClock::at_unix(common::START_UNIX));
    let tenant = app.create_tenant().await;
    let principal = app.create_principal(&tenant).await;

    let decision = app
        .core
        .gate
        .authorize(&request(tenant.tenant_id, principal.principal_id, "posts:read"))
        .await;
    assert!(matches!(
        decision,
        Decision::Deny(DenyReason::RateLimited { .. })
    ));
}

// ============================================================================
// Directory failures
// ============================================================================

#[tokio::test]
async fn directory_outage_is_not_reported_as_forbidden() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;
    let principal = app.create_principal(&tenant).await;
    app.directory.set_unavailable(true);

    let ctx = request(tenant.tenant_id, principal.principal_id, "posts:read");
    for _ in 0..7 {
        let decision = app.core.gate.authorize(&ctx).await;
        assert_eq!(decision, Decision::Deny(DenyReason::ResolutionUnavailable));
        assert!(matches!(decision, Decision::Deny(reason) if reason.is_transient()));
    }
}
