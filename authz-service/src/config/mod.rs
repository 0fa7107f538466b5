use crate::services::circuit_breaker::BreakerConfig;
use secrecy::SecretString;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::CoreError;
use std::collections::HashMap;
use std::time::Duration;

const RATE_LIMIT_PREFIX: &str = "AUTHZ_RATE_LIMIT_";
pub const DEFAULT_CLASS: &str = "default";
/// Counts second-factor attempts per principal.
pub const TWO_FACTOR_CLASS: &str = "two_factor";
/// Quota for API keys that carry no limit of their own, counted per key.
pub const API_KEY_CLASS: &str = "api_key";
pub const MAX_BACKUP_CODES: usize = 100;

#[derive(Debug, Clone)]
pub struct AuthzConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    /// Base64 of the 32-byte secret-encryption key.
    pub encryption_key: SecretString,
    pub totp: TotpConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub store_timeout: Duration,
    pub directory_timeout: Duration,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct TotpConfig {
    pub issuer: String,
    pub period_seconds: u64,
    pub digits: usize,
    /// Accepted steps either side of the current one.
    pub skew: u8,
    pub backup_code_count: usize,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            issuer: "Authz".to_string(),
            period_seconds: 30,
            digits: 6,
            skew: 1,
            backup_code_count: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub permission_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            permission_ttl: Duration::from_secs(1800),
        }
    }
}

/// `max_requests` per `window_seconds`, plus `burst` extra requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLimit {
    pub max_requests: u64,
    pub window_seconds: u64,
    pub burst: u64,
}

impl EndpointLimit {
    pub const fn new(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
            burst: 0,
        }
    }
}

/// Parses `<max>/<window>[/<burst>]`.
impl std::str::FromStr for EndpointLimit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let number = |raw: &str| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| format!("Invalid rate limit '{}': {}", s, e))
        };

        match parts.as_slice() {
            [max, window] => Ok(Self {
                max_requests: number(max)?,
                window_seconds: number(window)?,
                burst: 0,
            }),
            [max, window, burst] => Ok(Self {
                max_requests: number(max)?,
                window_seconds: number(window)?,
                burst: number(burst)?,
            }),
            _ => Err(format!(
                "Invalid rate limit '{}': expected max/window[/burst]",
                s
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub classes: HashMap<String, EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let classes = [
            (DEFAULT_CLASS, EndpointLimit::new(100, 60)),
            ("auth", EndpointLimit::new(10, 60)),
            ("login", EndpointLimit::new(5, 300)),
            ("register", EndpointLimit::new(3, 300)),
            ("api", EndpointLimit::new(1000, 60)),
            ("api_write", EndpointLimit::new(100, 60)),
            ("admin", EndpointLimit::new(50, 60)),
            ("oauth", EndpointLimit::new(20, 60)),
            (TWO_FACTOR_CLASS, EndpointLimit::new(5, 300)),
            (API_KEY_CLASS, EndpointLimit::new(100, 60)),
        ]
        .into_iter()
        .map(|(class, limit)| (class.to_string(), limit))
        .collect();

        Self { classes }
    }
}

impl RateLimitConfig {
    /// Limit for `endpoint_class`, falling back to the `default` class.
    pub fn limit_for(&self, endpoint_class: &str) -> EndpointLimit {
        self.classes
            .get(endpoint_class)
            .or_else(|| self.classes.get(DEFAULT_CLASS))
            .copied()
            .unwrap_or(EndpointLimit::new(100, 60))
    }

    /// Apply `AUTHZ_RATE_LIMIT_<CLASS>` overrides.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(class) = key.strip_prefix(RATE_LIMIT_PREFIX) else {
                continue;
            };
            let limit: EndpointLimit = value
                .parse()
                .map_err(|e: String| CoreError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))?;
            self.classes.insert(class.to_lowercase(), limit);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl AuthzConfig {
    /// Load from `.env`, the optional configuration file and the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        let common = core_config::Config::load()?;
        let mut config = Self::from_lookup(common, |key| std::env::var(key).ok())?;
        config.rate_limit.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an arbitrary key lookup. Only the known endpoint classes are
    /// read from `lookup`; [`RateLimitConfig::apply_overrides`] adds others.
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment: Environment = get_env(&lookup, "ENVIRONMENT", Some("dev"))?
            .parse()
            .map_err(|e: String| CoreError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;
        // Production has no implicit connection strings.
        let dev_default = |value: &'static str| if is_prod { None } else { Some(value) };

        let mut rate_limit = RateLimitConfig::default();
        let known: Vec<(String, String)> = rate_limit
            .classes
            .keys()
            .filter_map(|class| {
                let key = format!("{}{}", RATE_LIMIT_PREFIX, class.to_uppercase());
                lookup(&key).map(|value| (key, value))
            })
            .collect();
        rate_limit.apply_overrides(known)?;

        let store_timeout_ms: u64 = get_env_parsed(
            &lookup,
            "AUTHZ_STORE_TIMEOUT_MS",
            &common.store_timeout_ms.to_string(),
        )?;

        let config = AuthzConfig {
            environment,
            service_name: get_env(&lookup, "SERVICE_NAME", Some("authz-service"))?,
            log_level: get_env(&lookup, "LOG_LEVEL", Some(common.log_level.as_str()))?,
            encryption_key: SecretString::new(get_env(&lookup, "AUTHZ_ENCRYPTION_KEY", None)?),
            totp: TotpConfig {
                issuer: get_env(&lookup, "AUTHZ_TOTP_ISSUER", Some("Authz"))?,
                period_seconds: get_env_parsed(&lookup, "AUTHZ_TOTP_PERIOD", "30")?,
                digits: get_env_parsed(&lookup, "AUTHZ_TOTP_DIGITS", "6")?,
                skew: get_env_parsed(&lookup, "AUTHZ_TOTP_SKEW", "1")?,
                backup_code_count: get_env_parsed(&lookup, "AUTHZ_BACKUP_CODE_COUNT", "10")?,
            },
            cache: CacheConfig {
                permission_ttl: Duration::from_secs(get_env_parsed(
                    &lookup,
                    "AUTHZ_PERMISSION_CACHE_TTL",
                    "1800",
                )?),
            },
            rate_limit,
            breaker: BreakerConfig {
                failure_threshold: get_env_parsed(&lookup, "AUTHZ_BREAKER_FAILURE_THRESHOLD", "5")?,
                recovery_timeout: Duration::from_secs(get_env_parsed(
                    &lookup,
                    "AUTHZ_BREAKER_RECOVERY_TIMEOUT",
                    "60",
                )?),
            },
            store_timeout: Duration::from_millis(store_timeout_ms),
            directory_timeout: Duration::from_millis(get_env_parsed(
                &lookup,
                "AUTHZ_DIRECTORY_TIMEOUT_MS",
                "2000",
            )?),
            redis: RedisConfig {
                url: get_env(&lookup, "REDIS_URL", dev_default("redis://127.0.0.1:6379"))?,
            },
            database: DatabaseConfig {
                url: get_env(
                    &lookup,
                    "DATABASE_URL",
                    dev_default("postgres://localhost/authz"),
                )?,
                max_connections: get_env_parsed(&lookup, "DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: get_env_parsed(&lookup, "DATABASE_MIN_CONNECTIONS", "1")?,
            },
            common,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let invalid = |msg: String| Err(CoreError::ConfigError(anyhow::anyhow!(msg)));

        if let Err(e) = crate::services::SecretCodec::from_base64(&self.encryption_key) {
            return invalid(format!("AUTHZ_ENCRYPTION_KEY is invalid: {}", e));
        }

        if !(6..=8).contains(&self.totp.digits) {
            return invalid("AUTHZ_TOTP_DIGITS must be between 6 and 8".to_string());
        }

        if self.totp.period_seconds == 0 {
            return invalid("AUTHZ_TOTP_PERIOD must be positive".to_string());
        }

        if self.totp.issuer.is_empty() || self.totp.issuer.contains(':') {
            return invalid("AUTHZ_TOTP_ISSUER must be non-empty and contain no ':'".to_string());
        }

        if !(1..=MAX_BACKUP_CODES).contains(&self.totp.backup_code_count) {
            return invalid(format!(
                "AUTHZ_BACKUP_CODE_COUNT must be between 1 and {}",
                MAX_BACKUP_CODES
            ));
        }

        if self.cache.permission_ttl.is_zero() {
            return invalid("AUTHZ_PERMISSION_CACHE_TTL must be positive".to_string());
        }

        if self.breaker.failure_threshold == 0 || self.breaker.recovery_timeout.is_zero() {
            return invalid("Circuit breaker threshold and recovery timeout must be positive".to_string());
        }

        if self.store_timeout.is_zero() || self.directory_timeout.is_zero() {
            return invalid("Store and directory timeouts must be positive".to_string());
        }

        for (class, limit) in &self.rate_limit.classes {
            if limit.max_requests == 0 || limit.window_seconds == 0 {
                return invalid(format!(
                    "Rate limit for '{}' needs max_requests >= 1 and window_seconds >= 1",
                    class
                ));
            }
        }

        if !self.rate_limit.classes.contains_key(DEFAULT_CLASS) {
            return invalid("Rate limit class 'default' must be configured".to_string());
        }

        Ok(())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
