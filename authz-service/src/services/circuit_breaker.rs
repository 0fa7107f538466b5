//! Circuit breaker around a named downstream resource.
//!
//! State is a JSON record at `authz:breaker:<name>` and is only ever changed
//! through compare-and-swap, so every replica sees the same transitions and the
//! half-open trial is claimed by exactly one caller.

use crate::services::error::CircuitError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::clock::SharedClock;
use service_core::error::StoreError;
use service_core::store::{with_timeout, SharedStore};
use std::future::Future;
use std::time::Duration;

const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    /// Set while a half-open trial call is in flight.
    #[serde(default)]
    pub trial_started: Option<DateTime<Utc>>,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_started: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    name: String,
    store: SharedStore,
    clock: SharedClock,
    config: BreakerConfig,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        store: SharedStore,
        clock: SharedClock,
        config: BreakerConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            clock,
            config,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn key(&self) -> String {
        format!("authz:breaker:{}", self.name)
    }

    async fn load(&self) -> Result<(Option<String>, BreakerSnapshot), StoreError> {
        let key = self.key();
        let raw = with_timeout(self.timeout, self.store.get(&key)).await?;
        let snapshot = match &raw {
            Some(value) => serde_json::from_str(value)?,
            None => BreakerSnapshot::default(),
        };
        Ok((raw, snapshot))
    }

    async fn swap(&self, expected: Option<&str>, next: &BreakerSnapshot) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(next)?;
        with_timeout(
            self.timeout,
            self.store
                .compare_and_swap(&self.key(), expected, Some(&encoded), None),
        )
        .await
    }

    /// Current record, for diagnostics.
    pub async fn state(&self) -> Result<BreakerSnapshot, StoreError> {
        Ok(self.load().await?.1)
    }

    /// Run `operation` unless the breaker is open.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(CircuitError::StateUnavailable(e)) => {
                // Unknown breaker state counts against the resource.
                tracing::warn!(breaker = %self.name, error = %e, "Breaker state unavailable, rejecting call");
                if let Err(e) = self.record_failure(Permit::Normal).await {
                    tracing::debug!(breaker = %self.name, error = %e, "Could not record failure");
                }
                return Err(CircuitError::StateUnavailable(e));
            }
            Err(CircuitError::Open { retry_after_seconds }) => {
                return Err(CircuitError::Open { retry_after_seconds });
            }
            Err(CircuitError::Inner(never)) => match never {},
        };

        match operation().await {
            Ok(value) => {
                if let Err(e) = self.record_success(permit).await {
                    tracing::warn!(breaker = %self.name, error = %e, "Could not record success");
                }
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.record_failure(permit).await {
                    tracing::warn!(breaker = %self.name, error = %e, "Could not record failure");
                }
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn retry_after(&self, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<u64> {
        let since = since?;
        let elapsed = (now - since).to_std().unwrap_or_default();
        let remaining = self.config.recovery_timeout.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }
        // Round up so callers never retry early.
        Some(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0))
    }

    async fn acquire(&self) -> Result<Permit, CircuitError<std::convert::Infallible>> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, snapshot) = self.load().await.map_err(CircuitError::StateUnavailable)?;
            let now = self.clock.now();

            let waiting_since = match snapshot.state {
                BreakerState::Closed => return Ok(Permit::Normal),
                BreakerState::Open => snapshot.last_failure,
                // A trial older than the recovery timeout was abandoned.
                BreakerState::HalfOpen => snapshot.trial_started,
            };

            if let Some(retry_after_seconds) = self.retry_after(waiting_since, now) {
                return Err(CircuitError::Open {
                    retry_after_seconds,
                });
            }

            let next = BreakerSnapshot {
                state: BreakerState::HalfOpen,
                trial_started: Some(now),
                ..snapshot
            };
            if self
                .swap(raw.as_deref(), &next)
                .await
                .map_err(CircuitError::StateUnavailable)?
            {
                tracing::info!(breaker = %self.name, "Circuit half-open, trial call admitted");
                return Ok(Permit::Trial);
            }
        }

        // Lost every race for the trial; someone else holds it.
        Err(CircuitError::Open {
            retry_after_seconds: 1,
        })
    }

    async fn record_success(&self, permit: Permit) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, snapshot) = self.load().await?;
            let reset = match permit {
                Permit::Trial => snapshot.state != BreakerState::Closed || snapshot.failure_count > 0,
                Permit::Normal => {
                    snapshot.state == BreakerState::Closed && snapshot.failure_count > 0
                }
            };
            if !reset {
                return Ok(());
            }
            if self.swap(raw.as_deref(), &BreakerSnapshot::default()).await? {
                if permit == Permit::Trial {
                    tracing::info!(breaker = %self.name, "Trial call succeeded, circuit closed");
                }
                return Ok(());
            }
        }
        Ok(())
    }

    async fn record_failure(&self, permit: Permit) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (raw, snapshot) = self.load().await?;
            let now = self.clock.now();

            let next = match (permit, snapshot.state) {
                (Permit::Trial, _) | (Permit::Normal, BreakerState::HalfOpen) => BreakerSnapshot {
                    state: BreakerState::Open,
                    failure_count: snapshot.failure_count.saturating_add(1),
                    last_failure: Some(now),
                    trial_started: None,
                },
                (Permit::Normal, BreakerState::Closed) => {
                    let failure_count = snapshot.failure_count.saturating_add(1);
                    let state = if failure_count >= self.config.failure_threshold {
                        BreakerState::Open
                    } else {
                        BreakerState::Closed
                    };
                    BreakerSnapshot {
                        state,
                        failure_count,
                        last_failure: Some(now),
                        trial_started: None,
                    }
                }
                // Straggler from before the trip; the open window stands.
                (Permit::Normal, BreakerState::Open) => return Ok(()),
            };

            if self.swap(raw.as_deref(), &next).await? {
                if next.state == BreakerState::Open && snapshot.state != BreakerState::Open {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = next.failure_count,
                        "Circuit opened"
                    );
                }
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::clock::ManualClock;
    use service_core::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker() -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::at_unix(1_700_000_000);
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        let breaker = CircuitBreaker::new(
            "database",
            store,
            shared,
            BreakerConfig::default(),
            Duration::from_secs(1),
        );
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        breaker.call(|| async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (breaker, _) = breaker();
        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        let _ = fail(&breaker).await;

        let snapshot = breaker.state().await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 1);
    }

    #[tokio::test]
    async fn retry_after_counts_down_the_recovery_timeout() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }

        clock.advance(Duration::from_secs(20));
        let reached = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(CircuitError::Open {
                retry_after_seconds: 40
            })
        ));
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn abandoned_trial_can_be_reclaimed() {
        let (breaker, clock) = breaker();
        for _ in 0..5 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(61));

        // Claim the trial and never report back.
        assert_eq!(breaker.acquire().await.unwrap(), Permit::Trial);
        assert!(matches!(
            breaker.acquire().await,
            Err(CircuitError::Open { .. })
        ));

        clock.advance(Duration::from_secs(61));
        assert_eq!(breaker.acquire().await.unwrap(), Permit::Trial);
    }
}
