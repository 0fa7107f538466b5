//! Secret Codec: authenticated encryption for TOTP secrets and one-way
//! hashing for backup codes and API keys.
//!
//! Ciphertext layout is `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext`.
//! The principal id is bound as associated data, so a ciphertext copied onto
//! another principal fails to decrypt. Rotating the key invalidates every
//! stored secret.

use crate::services::error::CryptoError;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const BACKUP_CODE_LABEL: &[u8] = b"authz/backup-code-hash/v1";

#[derive(Clone)]
pub struct SecretCodec {
    cipher: ChaCha20Poly1305,
    backup_mac: HmacSha256,
}

impl SecretCodec {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::MalformedKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;

        // Backup codes are hashed under a sub-key so the encryption key itself
        // never keys a MAC over attacker-chosen input.
        let mut derive = <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        derive.update(BACKUP_CODE_LABEL);
        let sub_key = derive.finalize().into_bytes();
        let backup_mac = <HmacSha256 as Mac>::new_from_slice(&sub_key)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;

        Ok(Self { cipher, backup_mac })
    }

    /// Build from the base64 key held in configuration.
    pub fn from_base64(encoded: &SecretString) -> Result<Self, CryptoError> {
        let key = STANDARD
            .decode(encoded.expose_secret().trim())
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        Self::new(&key)
    }

    pub fn encrypt(&self, secret: &[u8], principal_id: Uuid) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: secret,
            aad: principal_id.as_bytes(),
        };
        let ciphertext = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Never returns unauthenticated plaintext: tampering or a wrong key is an error.
    pub fn decrypt(&self, data: &[u8], principal_id: Uuid) -> Result<Vec<u8>, CryptoError> {
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let payload = Payload {
            msg: ciphertext,
            aad: principal_id.as_bytes(),
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| CryptoError::Decryption)
    }

    /// Deterministic keyed hash, hex encoded.
    pub fn hash_backup_code(&self, code: &str) -> String {
        let mut mac = self.backup_mac.clone();
        mac.update(code.trim().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Lookup hash of an API key. Unkeyed: keys carry 256 bits of entropy and must
/// keep working across encryption-key rotation.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCodec { key: [REDACTED] }")
    }
}
