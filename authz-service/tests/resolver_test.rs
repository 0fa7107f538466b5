//! Integration tests for permission resolution and caching.

mod common;

use authz_service::models::{CallerContext, TenantStatus};
use authz_service::services::ResolveError;
use common::TestApp;
use futures::future::join_all;

const TENANT_CALLER: CallerContext = CallerContext { superadmin: false };

// ============================================================================
// Deny by default
// ============================================================================

#[tokio::test]
async fn principal_without_roles_has_no_permissions() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;
    let principal = app.create_principal(&tenant).await;

    for name in ["posts:read", "posts:create", "admin:all", "*"] {
        let allowed = app
            .core
            .resolver
            .has_permission(tenant.tenant_id, principal.principal_id, &TENANT_CALLER, name)
            .await
            .unwrap();
        assert!(!allowed, "{} should be denied", name);
    }

    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.is_empty());
}

#[tokio::test]
async fn union_of_roles_is_resolved() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    let reviewer = app
        .create_role(&tenant, "reviewer", &["posts:read", "comments:moderate"])
        .await;
    app.core
        .admin
        .assign_role(tenant.tenant_id, principal.principal_id, reviewer.role_id)
        .await
        .unwrap();

    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    let names: Vec<&str> = set.iter().collect();
    assert_eq!(names, vec!["comments:moderate", "posts:create", "posts:read"]);
}

#[tokio::test]
async fn system_roles_apply_in_every_tenant() {
    let app = TestApp::spawn();
    let viewer = app.create_system_role("viewer", &["reports:read"]).await;

    for _ in 0..2 {
        let tenant = app.create_tenant().await;
        let principal = app.create_principal(&tenant).await;
        app.core
            .admin
            .assign_role(tenant.tenant_id, principal.principal_id, viewer.role_id)
            .await
            .unwrap();

        assert!(app
            .core
            .resolver
            .has_permission(
                tenant.tenant_id,
                principal.principal_id,
                &TENANT_CALLER,
                "reports:read"
            )
            .await
            .unwrap());
    }
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn invalidate_forces_exactly_one_recomputation() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    let resolver = &app.core.resolver;

    resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert_eq!(app.directory.role_loads(), 1);

    resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert_eq!(app.directory.role_loads(), 1, "second call is a cache hit");

    app.core
        .cache
        .invalidate(tenant.tenant_id, principal.principal_id)
        .await
        .unwrap();

    resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert_eq!(app.directory.role_loads(), 2);
}

#[tokio::test]
async fn repeated_resolution_is_idempotent() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;

    let first = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    let second = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn concurrent_misses_agree() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;

    let results = join_all((0..8).map(|_| {
        app.core
            .resolver
            .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
    }))
    .await;

    let first = results[0].as_ref().unwrap();
    assert!(results.iter().all(|r| r.as_ref().unwrap() == first));
}

#[tokio::test]
async fn cache_entries_expire_after_ttl() {
    let app = TestApp::spawn_with(&[("AUTHZ_PERMISSION_CACHE_TTL", "60")]);
    let (tenant, principal, _) = app.editor().await;

    app.core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    app.advance(61);
    app.core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();

    assert_eq!(app.directory.role_loads(), 2);
}

#[tokio::test]
async fn dangling_permission_references_are_skipped() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    app.directory.remove_catalog_entry("posts:create").unwrap();

    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.contains("posts:read"));
    assert!(!set.contains("posts:create"));
}

// ============================================================================
// Superadmin and tenant isolation
// ============================================================================

#[tokio::test]
async fn superadmin_resolves_to_wildcard_without_roles() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;
    let admin = app.create_superadmin(&tenant).await;

    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, admin.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.is_wildcard());
    assert!(set.contains("anything:at_all"));
    assert_eq!(app.directory.role_loads(), 0);
}

#[tokio::test]
async fn cross_tenant_resolution_requires_superadmin_caller() {
    let app = TestApp::spawn();
    let tenant_a = app.create_tenant().await;
    let (_, principal_b, _) = app.editor().await;

    let rejected = app
        .core
        .resolver
        .resolve(tenant_a.tenant_id, principal_b.principal_id, &TENANT_CALLER)
        .await;
    assert!(matches!(rejected, Err(ResolveError::TenantMismatch)));

    let as_superadmin = app
        .core
        .resolver
        .resolve(
            tenant_a.tenant_id,
            principal_b.principal_id,
            &CallerContext::superadmin(),
        )
        .await
        .unwrap();
    assert!(as_superadmin.contains("posts:read"));
}

#[tokio::test]
async fn cross_tenant_superadmin_view_is_not_cached() {
    let app = TestApp::spawn();
    let tenant_a = app.create_tenant().await;
    let (_, principal_b, _) = app.editor().await;

    app.core
        .resolver
        .resolve(
            tenant_a.tenant_id,
            principal_b.principal_id,
            &CallerContext::superadmin(),
        )
        .await
        .unwrap();

    let cached = app
        .core
        .cache
        .get(tenant_a.tenant_id, principal_b.principal_id)
        .await
        .unwrap();
    assert!(cached.is_none());

    // A tenant-scoped caller is still rejected afterwards.
    let rejected = app
        .core
        .resolver
        .resolve(tenant_a.tenant_id, principal_b.principal_id, &TENANT_CALLER)
        .await;
    assert!(matches!(rejected, Err(ResolveError::TenantMismatch)));
}

#[tokio::test]
async fn unknown_principal_is_reported_as_not_found() {
    let app = TestApp::spawn();
    let tenant = app.create_tenant().await;

    let result = app
        .core
        .resolver
        .resolve(tenant.tenant_id, uuid::Uuid::new_v4(), &TENANT_CALLER)
        .await;
    assert!(matches!(result, Err(ResolveError::PrincipalNotFound)));
}

#[tokio::test]
async fn inactive_principal_and_suspended_tenant_resolve_to_nothing() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;

    app.core
        .admin
        .set_principal_active(tenant.tenant_id, principal.principal_id, false)
        .await
        .unwrap();
    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.is_empty());

    app.core
        .admin
        .set_principal_active(tenant.tenant_id, principal.principal_id, true)
        .await
        .unwrap();
    app.core
        .admin
        .set_tenant_status(tenant.tenant_id, TenantStatus::Suspended)
        .await
        .unwrap();
    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, principal.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.is_empty());
}

// ============================================================================
// Helpers
// ============================================================================

#[tokio::test]
async fn any_all_and_role_helpers() {
    let app = TestApp::spawn();
    let (tenant, principal, _) = app.editor().await;
    let resolver = &app.core.resolver;
    let (t, p) = (tenant.tenant_id, principal.principal_id);

    assert!(resolver
        .has_any_permission(t, p, &TENANT_CALLER, &["posts:delete", "posts:read"])
        .await
        .unwrap());
    assert!(!resolver
        .has_any_permission(t, p, &TENANT_CALLER, &[])
        .await
        .unwrap());
    assert!(resolver
        .has_all_permissions(t, p, &TENANT_CALLER, &["posts:create", "posts:read"])
        .await
        .unwrap());
    assert!(!resolver
        .has_all_permissions(t, p, &TENANT_CALLER, &["posts:create", "posts:delete"])
        .await
        .unwrap());
    assert!(resolver.has_role(t, p, &TENANT_CALLER, "editor").await.unwrap());
    assert!(!resolver.has_role(t, p, &TENANT_CALLER, "owner").await.unwrap());
}

// ============================================================================
// Directory failures
// ============================================================================

#[tokio::test]
async fn directory_outage_is_unavailable_then_trips_breaker() {
    let app = TestApp::spawn();
    let (tenant, cached, _) = app.editor().await;
    let uncached = app.create_principal(&tenant).await;

    app.core
        .resolver
        .resolve(tenant.tenant_id, cached.principal_id, &TENANT_CALLER)
        .await
        .unwrap();

    app.directory.set_unavailable(true);
    for _ in 0..5 {
        let result = app
            .core
            .resolver
            .resolve(tenant.tenant_id, uncached.principal_id, &TENANT_CALLER)
            .await;
        assert!(matches!(result, Err(ResolveError::Unavailable(_))));
    }

    let result = app
        .core
        .resolver
        .resolve(tenant.tenant_id, uncached.principal_id, &TENANT_CALLER)
        .await;
    assert!(matches!(result, Err(ResolveError::CircuitOpen { .. })));

    // Cached principals keep resolving while the directory is down.
    let set = app
        .core
        .resolver
        .resolve(tenant.tenant_id, cached.principal_id, &TENANT_CALLER)
        .await
        .unwrap();
    assert!(set.contains("posts:read"));
}
