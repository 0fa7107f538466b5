//! TOTP second factor with encrypted secrets and single-use backup codes.
//!
//! Per-principal lifecycle: `disabled -> pending_setup -> enabled`, and back to
//! `disabled` on explicit disable. Secrets, codes and submitted values are
//! never logged.
//!
//! Every submitted code counts against the `two_factor` rate-limit class for
//! the principal; an accepted code clears the count.

use crate::config::{TotpConfig, TWO_FACTOR_CLASS};
use crate::models::{Principal, TwoFactorState};
use crate::services::cache::PermissionCache;
use crate::services::codec::SecretCodec;
use crate::services::directory::SharedDirectory;
use crate::services::error::TotpError;
use crate::services::rate_limit::{RateDecision, RateLimiter};
use rand::{rngs::OsRng, Rng, RngCore};
use service_core::clock::SharedClock;
use service_core::store::{with_timeout, SharedStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, TOTP};
use uuid::Uuid;

/// 160-bit secret.
const SECRET_LEN: usize = 20;
const BACKUP_CODE_DIGITS: usize = 8;
const MAX_CAS_ATTEMPTS: usize = 16;

/// Returned once by [`TotpEngine::begin_setup`]; the plaintext cannot be fetched again.
pub struct TotpSetup {
    pub secret_base32: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

impl std::fmt::Debug for TotpSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TotpSetup")
            .field("secret_base32", &"[REDACTED]")
            .field("provisioning_uri", &"[REDACTED]")
            .field("backup_codes", &self.backup_codes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyResult {
    pub ok: bool,
    pub used_backup_code: bool,
}

impl VerifyResult {
    fn rejected() -> Self {
        Self {
            ok: false,
            used_backup_code: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotpStatus {
    pub state: TwoFactorState,
    pub backup_codes_remaining: usize,
}

pub struct TotpEngine {
    directory: SharedDirectory,
    store: SharedStore,
    codec: Arc<SecretCodec>,
    cache: Arc<PermissionCache>,
    rate_limiter: Arc<RateLimiter>,
    clock: SharedClock,
    config: TotpConfig,
    store_timeout: Duration,
}

impl TotpEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        directory: SharedDirectory,
        store: SharedStore,
        codec: Arc<SecretCodec>,
        cache: Arc<PermissionCache>,
        rate_limiter: Arc<RateLimiter>,
        clock: SharedClock,
        config: TotpConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            store,
            codec,
            cache,
            rate_limiter,
            clock,
            config,
            store_timeout,
        }
    }

    fn replay_key(principal_id: Uuid) -> String {
        format!("totp:last_step:{}", principal_id)
    }

    /// Long enough that an expired record can only hide steps outside the window.
    fn replay_ttl(&self) -> Duration {
        let steps = 2 * u64::from(self.config.skew) + 2;
        Duration::from_secs(self.config.period_seconds * steps)
    }

    fn build_totp(&self, secret: Vec<u8>, account: String) -> Result<TOTP, TotpError> {
        TOTP::new(
            Algorithm::SHA1,
            self.config.digits,
            self.config.skew,
            self.config.period_seconds,
            secret,
            Some(self.config.issuer.clone()),
            account,
        )
        .map_err(|e| TotpError::Internal(anyhow::anyhow!("TOTP init error: {:?}", e)))
    }

    async fn load(&self, principal_id: Uuid) -> Result<Principal, TotpError> {
        self.directory
            .load_principal(principal_id)
            .await?
            .ok_or(TotpError::PrincipalNotFound)
    }

    fn decrypt_secret(&self, principal: &Principal) -> Result<Vec<u8>, TotpError> {
        let ciphertext = principal.totp_secret.as_deref().ok_or(TotpError::NotSetUp)?;
        self.codec
            .decrypt(ciphertext, principal.principal_id)
            .map_err(|e| {
                tracing::error!(
                    principal_id = %principal.principal_id,
                    error = %e,
                    "Stored TOTP secret failed to decrypt"
                );
                TotpError::CorruptSecret(e)
            })
    }

    /// Count one attempt before any code is checked. Store failures throttle.
    async fn count_attempt(&self, principal_id: Uuid) -> Result<(), TotpError> {
        let decision = self
            .rate_limiter
            .check_and_increment(TWO_FACTOR_CLASS, &principal_id.to_string())
            .await;
        match decision {
            RateDecision::Allow { .. } => Ok(()),
            RateDecision::Deny {
                retry_after_seconds,
            } => {
                tracing::warn!(%principal_id, retry_after_seconds, "Second-factor attempts throttled");
                Err(TotpError::RateLimited {
                    retry_after_seconds,
                })
            }
        }
    }

    async fn clear_attempts(&self, principal_id: Uuid) {
        if let Err(e) = self
            .rate_limiter
            .reset(TWO_FACTOR_CLASS, &principal_id.to_string())
            .await
        {
            tracing::warn!(%principal_id, error = %e, "Failed to clear second-factor attempts");
        }
    }

    fn looks_like_totp(&self, code: &str) -> bool {
        code.len() == self.config.digits && code.bytes().all(|b| b.is_ascii_digit())
    }

    /// Timestep the code is valid for within the skew window, if any.
    fn matching_step(&self, secret: Vec<u8>, code: &str) -> Result<Option<u64>, TotpError> {
        if !self.looks_like_totp(code) {
            return Ok(None);
        }

        let totp = self.build_totp(secret, "verify".to_string())?;
        let period = self.config.period_seconds;
        let now = u64::try_from(self.clock.unix_seconds()).unwrap_or_default();
        let current = now / period;
        let skew = u64::from(self.config.skew);

        // Every candidate is compared so timing does not reveal which step matched.
        let mut matched = None;
        for step in current.saturating_sub(skew)..=current.saturating_add(skew) {
            let expected = totp.generate(step * period);
            if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) {
                matched = Some(step);
            }
        }
        Ok(matched)
    }

    /// Record `step` as the last accepted one. `false` when it, or a later
    /// step, was already accepted.
    async fn claim_step(&self, principal_id: Uuid, step: u64) -> Result<bool, TotpError> {
        let key = Self::replay_key(principal_id);
        let encoded = step.to_string();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = with_timeout(self.store_timeout, self.store.get(&key)).await?;
            if let Some(last) = current.as_deref().and_then(|raw| raw.parse::<u64>().ok()) {
                if step <= last {
                    return Ok(false);
                }
            }

            let swapped = with_timeout(
                self.store_timeout,
                self.store.compare_and_swap(
                    &key,
                    current.as_deref(),
                    Some(&encoded),
                    Some(self.replay_ttl()),
                ),
            )
            .await?;
            if swapped {
                return Ok(true);
            }
        }

        Err(TotpError::Internal(anyhow::anyhow!(
            "Contention on TOTP replay record"
        )))
    }

    /// Validate a TOTP code and consume its timestep.
    async fn accept_totp(&self, principal: &Principal, code: &str) -> Result<bool, TotpError> {
        let secret = self.decrypt_secret(principal)?;
        match self.matching_step(secret, code)? {
            Some(step) => {
                let fresh = self.claim_step(principal.principal_id, step).await?;
                if !fresh {
                    tracing::warn!(principal_id = %principal.principal_id, "Replayed TOTP code rejected");
                }
                Ok(fresh)
            }
            None => Ok(false),
        }
    }

    fn generate_backup_codes(&self) -> Vec<String> {
        let bound = 10u32.pow(BACKUP_CODE_DIGITS as u32);
        let mut seen = HashSet::with_capacity(self.config.backup_code_count);
        let mut codes = Vec::with_capacity(self.config.backup_code_count);
        while codes.len() < self.config.backup_code_count {
            let code = format!("{:0width$}", OsRng.gen_range(0..bound), width = BACKUP_CODE_DIGITS);
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }
        codes
    }

    async fn store_backup_codes(&self, principal_id: Uuid) -> Result<Vec<String>, TotpError> {
        let codes = self.generate_backup_codes();
        let hashes: Vec<String> = codes.iter().map(|c| self.codec.hash_backup_code(c)).collect();
        self.directory
            .persist_backup_code_hashes(principal_id, &hashes)
            .await?;
        Ok(codes)
    }

    async fn forget_replay_record(&self, principal_id: Uuid) {
        let key = Self::replay_key(principal_id);
        if let Err(e) = with_timeout(self.store_timeout, self.store.delete(&key)).await {
            tracing::warn!(%principal_id, error = %e, "Failed to clear TOTP replay record");
        }
    }

    /// Generate a fresh secret and backup codes. 2FA stays off until confirmed.
    #[tracing::instrument(skip(self))]
    pub async fn begin_setup(&self, principal_id: Uuid) -> Result<TotpSetup, TotpError> {
        let principal = self.load(principal_id).await?;
        if principal.two_factor_state() == TwoFactorState::Enabled {
            return Err(TotpError::AlreadyEnabled);
        }

        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let ciphertext = self.codec.encrypt(&secret, principal_id)?;
        let totp = self.build_totp(secret, principal_id.to_string())?;

        self.directory
            .persist_totp_secret(principal_id, Some(&ciphertext))
            .await?;
        let backup_codes = self.store_backup_codes(principal_id).await?;
        self.forget_replay_record(principal_id).await;

        tracing::info!("TOTP setup started");
        Ok(TotpSetup {
            secret_base32: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
            backup_codes,
        })
    }

    /// Turn 2FA on once the user proves they hold the pending secret.
    #[tracing::instrument(skip(self, code))]
    pub async fn confirm_enable(&self, principal_id: Uuid, code: &str) -> Result<(), TotpError> {
        let principal = self.load(principal_id).await?;
        match principal.two_factor_state() {
            TwoFactorState::Enabled => return Err(TotpError::AlreadyEnabled),
            TwoFactorState::Disabled => return Err(TotpError::NotSetUp),
            TwoFactorState::PendingSetup => {}
        }

        self.count_attempt(principal_id).await?;
        if !self.accept_totp(&principal, code.trim()).await? {
            tracing::info!("TOTP confirmation rejected");
            return Err(TotpError::InvalidCode);
        }
        self.clear_attempts(principal_id).await;

        self.directory
            .set_two_factor_enabled(principal_id, true)
            .await?;
        self.cache.invalidate(principal.tenant_id, principal_id).await?;

        tracing::info!("TOTP enabled");
        Ok(())
    }

    /// Check a login code: TOTP first, then backup codes.
    #[tracing::instrument(skip(self, submitted))]
    pub async fn verify_login(
        &self,
        principal_id: Uuid,
        submitted: &str,
    ) -> Result<VerifyResult, TotpError> {
        let principal = self.load(principal_id).await?;
        if principal.two_factor_state() != TwoFactorState::Enabled {
            return Err(TotpError::NotSetUp);
        }
        self.count_attempt(principal_id).await?;

        let code: String = submitted
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();

        if self.looks_like_totp(&code) {
            let secret = self.decrypt_secret(&principal)?;
            if let Some(step) = self.matching_step(secret, &code)? {
                if self.claim_step(principal_id, step).await? {
                    self.clear_attempts(principal_id).await;
                    return Ok(VerifyResult {
                        ok: true,
                        used_backup_code: false,
                    });
                }
                tracing::warn!("Replayed TOTP code rejected");
                return Ok(VerifyResult::rejected());
            }
        }

        let hash = self.codec.hash_backup_code(&code);
        if self
            .directory
            .remove_backup_code_hash(principal_id, &hash)
            .await?
        {
            tracing::info!("Backup code consumed");
            self.clear_attempts(principal_id).await;
            return Ok(VerifyResult {
                ok: true,
                used_backup_code: true,
            });
        }

        tracing::info!("Second-factor code rejected");
        Ok(VerifyResult::rejected())
    }

    /// Clear secret and backup codes. Disabling twice is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, principal_id: Uuid) -> Result<(), TotpError> {
        let principal = self.load(principal_id).await?;
        if principal.two_factor_state() == TwoFactorState::Disabled {
            return Ok(());
        }

        self.directory.clear_two_factor(principal_id).await?;
        self.forget_replay_record(principal_id).await;
        self.cache.invalidate(principal.tenant_id, principal_id).await?;

        tracing::info!("TOTP disabled");
        Ok(())
    }

    pub async fn status(&self, principal_id: Uuid) -> Result<TotpStatus, TotpError> {
        let principal = self.load(principal_id).await?;
        Ok(TotpStatus {
            state: principal.two_factor_state(),
            backup_codes_remaining: principal.backup_code_hashes.len(),
        })
    }

    /// Replace every backup code. Requires a valid, unused TOTP code.
    #[tracing::instrument(skip(self, code))]
    pub async fn regenerate_backup_codes(
        &self,
        principal_id: Uuid,
        code: &str,
    ) -> Result<Vec<String>, TotpError> {
        let principal = self.load(principal_id).await?;
        if principal.two_factor_state() != TwoFactorState::Enabled {
            return Err(TotpError::NotEnabled);
        }

        self.count_attempt(principal_id).await?;
        if !self.accept_totp(&principal, code.trim()).await? {
            return Err(TotpError::InvalidCode);
        }
        self.clear_attempts(principal_id).await;

        let codes = self.store_backup_codes(principal_id).await?;
        tracing::info!("Backup codes regenerated");
        Ok(codes)
    }
}
