use crate::error::CoreError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Settings shared by every service in the workspace.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound for a single key-value store round trip.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Config {
    /// Layered load: optional `configuration.*` file, then `APP__*` environment variables.
    pub fn load() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn store_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.store_timeout_ms)
    }
}

/// Resolve a setting through `lookup`, falling back to `default`.
///
/// A missing key without a default is a configuration error.
pub fn get_env<F>(lookup: &F, key: &str, default: Option<&str>) -> Result<String, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => Ok(val),
        None => match default {
            Some(def) => Ok(def.to_string()),
            None => Err(CoreError::ConfigError(anyhow::anyhow!(
                "{} is required but not set",
                key
            ))),
        },
    }
}

/// Like [`get_env`] but parses the value.
pub fn get_env_parsed<F, T>(lookup: &F, key: &str, default: &str) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(lookup, key, Some(default))?;
    raw.trim().parse::<T>().map_err(|e| {
        CoreError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn get_env_prefers_present_value() {
        let lookup = lookup_from(&[("LOG_LEVEL", "debug")]);
        assert_eq!(get_env(&lookup, "LOG_LEVEL", Some("info")).unwrap(), "debug");
    }

    #[test]
    fn get_env_requires_value_without_default() {
        let lookup = lookup_from(&[]);
        assert!(matches!(
            get_env(&lookup, "DATABASE_URL", None),
            Err(CoreError::ConfigError(_))
        ));
    }

    #[test]
    fn get_env_parsed_reports_bad_numbers() {
        let lookup = lookup_from(&[("AUTHZ_TOTP_PERIOD", "thirty")]);
        let parsed: Result<u64, _> = get_env_parsed(&lookup, "AUTHZ_TOTP_PERIOD", "30");
        assert!(parsed.is_err());

        let parsed: u64 = get_env_parsed(&lookup_from(&[]), "AUTHZ_TOTP_PERIOD", "30").unwrap();
        assert_eq!(parsed, 30);
    }
}
