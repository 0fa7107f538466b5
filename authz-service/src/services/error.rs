use service_core::error::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failure categories the routing layer maps onto protocol responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The user can fix it and retry (wrong code, 2FA not set up).
    UserCorrectable,
    /// Retry later; the collaborator may recover.
    Transient,
    /// Programming or security violation; never coerced into success.
    SecurityViolation,
    /// Stored material no longer decrypts.
    Corruption,
    NotFound,
    Internal,
}

/// Errors that know their own category. Lets wrappers such as
/// [`CircuitError`] report the category of what they wrap.
pub trait Categorized {
    fn kind(&self) -> ErrorKind;
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Malformed encryption key: {0}")]
    MalformedKey(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Ciphertext failed authentication")]
    Decryption,

    #[error("Ciphertext too short")]
    Truncated,
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::MalformedKey(_) | CryptoError::Encryption => ErrorKind::Internal,
            CryptoError::Decryption | CryptoError::Truncated => ErrorKind::Corruption,
        }
    }
}

/// Failures of the relational collaborator. Every variant is an
/// infrastructure or integrity failure; absence of data is `Ok(None)`.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Directory backend error: {0}")]
    Backend(#[from] anyhow::Error),

    #[error("Directory call timed out after {0:?}")]
    Timeout(Duration),
}

impl DirectoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DirectoryError::NotFound(_) => ErrorKind::NotFound,
            DirectoryError::Conflict(_) => ErrorKind::UserCorrectable,
            DirectoryError::Backend(_) | DirectoryError::Timeout(_) => ErrorKind::Transient,
        }
    }
}

impl Categorized for DirectoryError {
    fn kind(&self) -> ErrorKind {
        DirectoryError::kind(self)
    }
}

impl From<sqlx::Error> for DirectoryError {
    fn from(err: sqlx::Error) -> Self {
        DirectoryError::Backend(anyhow::anyhow!(err))
    }
}

/// Outcome of a call wrapped by a circuit breaker.
#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit open, retry after {retry_after_seconds}s")]
    Open { retry_after_seconds: u64 },

    #[error("Circuit state unavailable: {0}")]
    StateUnavailable(StoreError),

    #[error("{0}")]
    Inner(E),
}

impl<E: Categorized> CircuitError<E> {
    /// Breaker failures are transient; a wrapped failure keeps its own category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CircuitError::Open { .. } | CircuitError::StateUnavailable(_) => ErrorKind::Transient,
            CircuitError::Inner(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Principal does not belong to the requested tenant")]
    TenantMismatch,

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Permission data unavailable: {0}")]
    Unavailable(#[from] DirectoryError),

    #[error("Directory circuit open, retry after {retry_after_seconds}s")]
    CircuitOpen { retry_after_seconds: u64 },
}

impl ResolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResolveError::TenantMismatch => ErrorKind::SecurityViolation,
            ResolveError::PrincipalNotFound => ErrorKind::NotFound,
            ResolveError::Unavailable(_) | ResolveError::CircuitOpen { .. } => ErrorKind::Transient,
        }
    }
}

impl From<CircuitError<DirectoryError>> for ResolveError {
    fn from(err: CircuitError<DirectoryError>) -> Self {
        match err {
            CircuitError::Open { retry_after_seconds } => {
                ResolveError::CircuitOpen { retry_after_seconds }
            }
            // Breaker bookkeeping failed; the directory outcome is unknown.
            CircuitError::StateUnavailable(_) => ResolveError::CircuitOpen {
                retry_after_seconds: 1,
            },
            CircuitError::Inner(e) => ResolveError::Unavailable(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum TotpError {
    #[error("Two-factor authentication is not set up")]
    NotSetUp,

    #[error("Invalid code")]
    InvalidCode,

    #[error("Two-factor authentication is already enabled")]
    AlreadyEnabled,

    #[error("Two-factor authentication is not enabled")]
    NotEnabled,

    #[error("Principal not found")]
    PrincipalNotFound,

    #[error("Too many second-factor attempts, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Stored TOTP secret is corrupt: {0}")]
    CorruptSecret(#[source] CryptoError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TotpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TotpError::NotSetUp
            | TotpError::InvalidCode
            | TotpError::AlreadyEnabled
            | TotpError::NotEnabled => ErrorKind::UserCorrectable,
            TotpError::PrincipalNotFound => ErrorKind::NotFound,
            TotpError::RateLimited { .. } => ErrorKind::Transient,
            TotpError::CorruptSecret(_) => ErrorKind::Corruption,
            TotpError::Crypto(e) => e.kind(),
            TotpError::Directory(e) => e.kind(),
            TotpError::Store(_) => ErrorKind::Transient,
            TotpError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Entity belongs to another tenant")]
    TenantMismatch,

    #[error("System roles cannot be modified")]
    SystemRoleImmutable,

    #[error("Role '{0}' already exists in this tenant")]
    DuplicateRole(String),

    #[error("Invalid permission: {0}")]
    InvalidPermission(String),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// The write succeeded but the cache could not be invalidated.
    #[error("Cache invalidation failed: {0}")]
    Invalidation(#[from] StoreError),
}

impl AdminError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::NotFound(_) => ErrorKind::NotFound,
            AdminError::TenantMismatch => ErrorKind::SecurityViolation,
            AdminError::SystemRoleImmutable
            | AdminError::DuplicateRole(_)
            | AdminError::InvalidPermission(_) => ErrorKind::UserCorrectable,
            AdminError::Directory(e) => e.kind(),
            AdminError::Invalidation(_) => ErrorKind::Transient,
        }
    }
}

/// Failures of API-key management and authentication.
#[derive(Error, Debug)]
pub enum ApiKeyError {
    /// Unknown, revoked, expired or malformed key. Deliberately one variant.
    #[error("Invalid API key")]
    InvalidKey,

    #[error("API key rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Entity belongs to another tenant")]
    TenantMismatch,

    #[error("API key has been revoked")]
    Revoked,

    #[error("Invalid API key request: {0}")]
    InvalidRequest(String),

    #[error("Owner permissions unavailable: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl ApiKeyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiKeyError::InvalidKey | ApiKeyError::Revoked | ApiKeyError::InvalidRequest(_) => {
                ErrorKind::UserCorrectable
            }
            ApiKeyError::RateLimited { .. } => ErrorKind::Transient,
            ApiKeyError::NotFound(_) => ErrorKind::NotFound,
            ApiKeyError::TenantMismatch => ErrorKind::SecurityViolation,
            ApiKeyError::Resolve(e) => e.kind(),
            ApiKeyError::Directory(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_errors_map_onto_resolve_errors() {
        let open: CircuitError<DirectoryError> = CircuitError::Open {
            retry_after_seconds: 30,
        };
        assert!(matches!(
            ResolveError::from(open),
            ResolveError::CircuitOpen {
                retry_after_seconds: 30
            }
        ));

        let inner = CircuitError::Inner(DirectoryError::Timeout(Duration::from_millis(5)));
        let resolved = ResolveError::from(inner);
        assert!(matches!(resolved, ResolveError::Unavailable(_)));
        assert_eq!(resolved.kind(), ErrorKind::Transient);
    }

    #[test]
    fn corruption_is_distinct_from_user_error() {
        assert_eq!(
            TotpError::CorruptSecret(CryptoError::Decryption).kind(),
            ErrorKind::Corruption
        );
        assert_eq!(TotpError::InvalidCode.kind(), ErrorKind::UserCorrectable);
        assert_eq!(ResolveError::TenantMismatch.kind(), ErrorKind::SecurityViolation);
    }

    #[test]
    fn wrapped_failures_keep_their_category() {
        let missing: CircuitError<DirectoryError> =
            CircuitError::Inner(DirectoryError::NotFound("role".into()));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let slow: CircuitError<DirectoryError> =
            CircuitError::Inner(DirectoryError::Timeout(Duration::from_millis(5)));
        assert_eq!(slow.kind(), ErrorKind::Transient);

        let open: CircuitError<DirectoryError> = CircuitError::Open {
            retry_after_seconds: 1,
        };
        assert_eq!(open.kind(), ErrorKind::Transient);
    }

    #[test]
    fn throttling_is_transient() {
        assert_eq!(
            TotpError::RateLimited {
                retry_after_seconds: 5
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            ApiKeyError::RateLimited {
                retry_after_seconds: 5
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(ApiKeyError::InvalidKey.kind(), ErrorKind::UserCorrectable);
        assert_eq!(ApiKeyError::TenantMismatch.kind(), ErrorKind::SecurityViolation);
    }
}
