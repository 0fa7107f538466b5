//! Fixed-window rate limiting per (endpoint class, identity).
//!
//! Windows are aligned to the Unix epoch, so a client can burst up to twice the
//! limit across a boundary. The effective ceiling for a window is pinned by its
//! first request; later load samples only affect new windows.

use crate::config::{EndpointLimit, RateLimitConfig};
use serde::Serialize;
use service_core::clock::SharedClock;
use service_core::error::StoreError;
use service_core::store::{with_timeout, SharedStore};
use std::collections::BTreeMap;
use std::time::Duration;

const LOAD_FACTOR_KEY: &str = "authz:rl:load_factor";
/// A load sample older than this is ignored.
const LOAD_SAMPLE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow {
        remaining: u64,
        reset_after_seconds: u64,
    },
    Deny {
        retry_after_seconds: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub load_factor: f64,
    pub load_multiplier: f64,
    /// Ceiling a window opened now would get, per configured class.
    pub effective_limits: BTreeMap<String, u64>,
}

/// Percentage of `max_requests` allowed for a load sample in `0.0..=1.0`.
pub fn load_percent(load: f64) -> u64 {
    if load >= 0.8 {
        50
    } else if load >= 0.6 {
        70
    } else {
        100
    }
}

pub fn load_multiplier(load: f64) -> f64 {
    load_percent(load) as f64 / 100.0
}

fn effective_ceiling(limit: &EndpointLimit, percent: u64) -> u64 {
    (limit.max_requests.saturating_mul(percent) / 100)
        .max(1)
        .saturating_add(limit.burst)
}

/// Counter key for one window. The identity is hex encoded so client-supplied
/// values (IPv6 addresses among them) cannot contain the separator.
fn counter_key(endpoint_class: &str, identity: &str, window_start: i64) -> String {
    format!(
        "authz:rl:{}:{}:{}",
        endpoint_class,
        hex::encode(identity.as_bytes()),
        window_start
    )
}

struct Window {
    counter_key: String,
    limit_key: String,
    remaining: u64,
}

pub struct RateLimiter {
    store: SharedStore,
    clock: SharedClock,
    config: RateLimitConfig,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        config: RateLimitConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            timeout,
        }
    }

    fn window(&self, endpoint_class: &str, identity: &str, limit: &EndpointLimit) -> Window {
        let now = self.clock.unix_seconds();
        let size = limit.window_seconds.max(1) as i64;
        let start = now - now.rem_euclid(size);
        let counter_key = counter_key(endpoint_class, identity, start);
        Window {
            limit_key: format!("{}:limit", counter_key),
            counter_key,
            remaining: (start + size - now).max(1) as u64,
        }
    }

    /// Count this request and decide. Store failures deny.
    pub async fn check_and_increment(&self, endpoint_class: &str, identity: &str) -> RateDecision {
        let limit = self.config.limit_for(endpoint_class);
        self.check_with_limit(endpoint_class, identity, limit).await
    }

    /// Like [`RateLimiter::check_and_increment`] with a caller-supplied limit,
    /// for credentials that carry their own quota.
    #[tracing::instrument(skip(self, limit))]
    pub async fn check_with_limit(
        &self,
        endpoint_class: &str,
        identity: &str,
        limit: EndpointLimit,
    ) -> RateDecision {
        let window = self.window(endpoint_class, identity, &limit);

        match self.count(&limit, &window).await {
            Ok(decision) => {
                if let RateDecision::Deny { retry_after_seconds } = decision {
                    tracing::info!(retry_after_seconds, "Rate limit exceeded");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rate limiter store unavailable, denying");
                RateDecision::Deny {
                    retry_after_seconds: limit.window_seconds,
                }
            }
        }
    }

    async fn count(&self, limit: &EndpointLimit, window: &Window) -> Result<RateDecision, StoreError> {
        let ceiling = self.pinned_ceiling(limit, window).await?;
        let count = with_timeout(
            self.timeout,
            self.store.increment(&window.counter_key, window.remaining),
        )
        .await?;

        if count > ceiling {
            Ok(RateDecision::Deny {
                retry_after_seconds: window.remaining,
            })
        } else {
            Ok(RateDecision::Allow {
                remaining: ceiling - count,
                reset_after_seconds: window.remaining,
            })
        }
    }

    async fn pinned_ceiling(&self, limit: &EndpointLimit, window: &Window) -> Result<u64, StoreError> {
        if let Some(pinned) = self.read_ceiling(&window.limit_key).await? {
            return Ok(pinned);
        }

        let ceiling = effective_ceiling(limit, load_percent(self.load_factor().await?));
        let encoded = ceiling.to_string();
        let claimed = with_timeout(
            self.timeout,
            self.store.compare_and_swap(
                &window.limit_key,
                None,
                Some(&encoded),
                Some(Duration::from_secs(window.remaining)),
            ),
        )
        .await?;

        if claimed {
            return Ok(ceiling);
        }
        // Another request opened the window first.
        Ok(self.read_ceiling(&window.limit_key).await?.unwrap_or(ceiling))
    }

    async fn read_ceiling(&self, key: &str) -> Result<Option<u64>, StoreError> {
        match with_timeout(self.timeout, self.store.get(key)).await? {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| StoreError::UnexpectedValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    /// Most recent load sample, `0.0` when none is fresh.
    pub async fn load_factor(&self) -> Result<f64, StoreError> {
        match with_timeout(self.timeout, self.store.get(LOAD_FACTOR_KEY)).await? {
            None => Ok(0.0),
            Some(raw) => raw.parse().map_err(|_| StoreError::UnexpectedValue {
                key: LOAD_FACTOR_KEY.to_string(),
                value: raw,
            }),
        }
    }

    /// Publish a load figure from the external sampler. Clamped to `0.0..=1.0`.
    pub async fn record_load_sample(&self, load: f64) -> Result<(), StoreError> {
        let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 1.0 };
        with_timeout(
            self.timeout,
            self.store
                .set(LOAD_FACTOR_KEY, &load.to_string(), Some(LOAD_SAMPLE_TTL)),
        )
        .await?;
        tracing::debug!(load, multiplier = load_multiplier(load), "Load sample recorded");
        Ok(())
    }

    /// Forget the current window for one identity.
    pub async fn reset(&self, endpoint_class: &str, identity: &str) -> Result<(), StoreError> {
        let limit = self.config.limit_for(endpoint_class);
        let window = self.window(endpoint_class, identity, &limit);
        with_timeout(self.timeout, self.store.delete(&window.counter_key)).await?;
        with_timeout(self.timeout, self.store.delete(&window.limit_key)).await?;
        tracing::info!(endpoint_class, "Rate limit window reset");
        Ok(())
    }

    pub async fn stats(&self) -> Result<RateLimitStats, StoreError> {
        let load_factor = self.load_factor().await?;
        let percent = load_percent(load_factor);
        let effective_limits = self
            .config
            .classes
            .iter()
            .map(|(class, limit)| (class.clone(), effective_ceiling(limit, percent)))
            .collect();

        Ok(RateLimitStats {
            load_factor,
            load_multiplier: load_multiplier(load_factor),
            effective_limits,
        })
    }
}
