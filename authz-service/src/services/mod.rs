//! Services layer for authz-service.
//!
//! Leaf-first: codec, TOTP, cache, resolver, rate limiting and circuit
//! breaking, API keys, and the gate that combines them.

pub mod admin;
pub mod api_keys;
pub mod cache;
pub mod circuit_breaker;
pub mod codec;
pub mod directory;
pub mod error;
pub mod gate;
pub mod rate_limit;
pub mod resolver;
pub mod totp;

pub use admin::AccessAdmin;
pub use api_keys::{ApiKeyAccess, ApiKeyService, IssuedApiKey, NewApiKey};
pub use cache::{PermissionCache, ResolvedAccess};
pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use codec::SecretCodec;
pub use directory::{Directory, MemoryDirectory, PgDirectory, SharedDirectory};
pub use error::{
    AdminError, ApiKeyError, Categorized, CircuitError, CryptoError, DirectoryError, ErrorKind,
    ResolveError, TotpError,
};
pub use gate::{ApiKeyContext, AuthorizationContext, AuthorizationGate, Decision, DenyReason};
pub use rate_limit::{RateDecision, RateLimitStats, RateLimiter};
pub use resolver::PermissionResolver;
pub use totp::{TotpEngine, TotpSetup, TotpStatus, VerifyResult};
