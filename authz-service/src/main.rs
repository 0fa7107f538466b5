//! Preflight for deployments: load configuration, connect to Redis and
//! PostgreSQL, apply migrations and report collaborator health.

use authz_service::config::AuthzConfig;
use authz_service::AuthzCore;
use service_core::error::CoreError;
use service_core::observability::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), CoreError> {
    let config = AuthzConfig::from_env()?;

    init_tracing(&config.service_name, &config.log_level)?;

    tracing::info!(
        service = %config.service_name,
        environment = ?config.environment,
        "Starting authorization core preflight"
    );

    let core = AuthzCore::connect(config).await?;
    core.health_check().await?;

    let stats = core.stats().await?;
    tracing::info!(
        load_factor = stats.rate_limit.load_factor,
        breaker_state = ?stats.directory_breaker.state,
        "Authorization core ready"
    );

    Ok(())
}
