//! Passphrase-derived authenticated encryption for uploaded blobs.
//!
//! Keys are derived with PBKDF2-HMAC-SHA256 from a user passphrase and a
//! per-envelope random salt; payloads are sealed with AES-256-GCM. The
//! envelope is canonical JSON:
//!
//! ```json
//! { "v":1, "alg":"AES-GCM-256", "kdf":"PBKDF2-SHA256",
//!   "iter":100000, "salt":"<b64>", "iv":"<b64>", "ct":"<b64>" }
//! ```
//!
//! Unknown `alg`/`kdf` values are rejected rather than silently mapped to
//! a supported pair. A wrong passphrase or a flipped ciphertext byte
//! fails the GCM tag and surfaces as a crypto error with no partial
//! plaintext.

use crate::error::SyncError;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Envelope format version this build writes and accepts.
pub const ENVELOPE_VERSION: u32 = 1;

/// The only AEAD this envelope format carries.
pub const AEAD_ALGORITHM: &str = "AES-GCM-256";

/// The only KDF this envelope format carries.
pub const KDF_ALGORITHM: &str = "PBKDF2-SHA256";

/// PBKDF2 iteration count written into new envelopes.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// Salt size for PBKDF2 (16 bytes).
const SALT_SIZE: usize = 16;

/// Failures in envelope handling. All of them surface as the `Crypto`
/// error kind; none are retried.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("decryption failed: wrong passphrase or tampered data")]
    Decrypt,
    #[error("encryption failed: {0}")]
    Encrypt(String),
}

impl From<CryptoError> for SyncError {
    fn from(err: CryptoError) -> Self {
        SyncError::Crypto(err.to_string())
    }
}

/// The serialized, encrypted container uploaded to the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    pub v: u32,
    pub alg: String,
    pub kdf: String,
    pub iter: u32,
    /// Base64 PBKDF2 salt.
    pub salt: String,
    /// Base64 AES-GCM nonce.
    pub iv: String,
    /// Base64 ciphertext + tag.
    pub ct: String,
}

impl EncryptedEnvelope {
    /// Cheap structural sniff used when a downloaded blob may be either
    /// an envelope or plaintext snapshot JSON.
    pub fn looks_like(value: &serde_json::Value) -> bool {
        value.get("v").is_some() && value.get("ct").is_some() && value.get("iv").is_some()
    }
}

/// Passphrase strength report for the settings surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrengthReport {
    /// 0–4, one point per satisfied criterion.
    pub score: u8,
    /// Whether the passphrase is acceptable for encryption.
    pub acceptable: bool,
    /// Unsatisfied criteria, in display order.
    pub problems: Vec<String>,
}

/// Encrypt/decrypt engine bound to one passphrase.
#[derive(Clone)]
pub struct CryptoEngine {
    passphrase: String,
    iterations: u32,
}

impl CryptoEngine {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            iterations: DEFAULT_KDF_ITERATIONS,
        }
    }

    /// Override the iteration count (tests keep it low).
    pub fn with_iterations(passphrase: impl Into<String>, iterations: u32) -> Self {
        Self {
            passphrase: passphrase.into(),
            iterations,
        }
    }

    /// Derive a 256-bit key from the passphrase for the given salt.
    fn derive_key(&self, salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<sha2::Sha256>(
            self.passphrase.as_bytes(),
            salt,
            iterations,
            &mut key,
        );
        key
    }

    /// Seal a plaintext into a fresh envelope. Each call draws a new salt
    /// and nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt, self.iterations);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Encrypt(format!("cipher init: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(EncryptedEnvelope {
            v: ENVELOPE_VERSION,
            alg: AEAD_ALGORITHM.into(),
            kdf: KDF_ALGORITHM.into(),
            iter: self.iterations,
            salt: b64.encode(salt),
            iv: b64.encode(nonce_bytes),
            ct: b64.encode(ciphertext),
        })
    }

    /// Open an envelope. The envelope's own salt and iteration count are
    /// honored so passphrase rotation only affects new envelopes.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
        if envelope.v != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedVersion(envelope.v));
        }
        if envelope.alg != AEAD_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(envelope.alg.clone()));
        }
        if envelope.kdf != KDF_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(envelope.kdf.clone()));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let salt = b64
            .decode(&envelope.salt)
            .map_err(|e| CryptoError::Malformed(format!("salt: {e}")))?;
        let nonce_bytes = b64
            .decode(&envelope.iv)
            .map_err(|e| CryptoError::Malformed(format!("iv: {e}")))?;
        let ciphertext = b64
            .decode(&envelope.ct)
            .map_err(|e| CryptoError::Malformed(format!("ct: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::Malformed(format!(
                "iv must be {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            )));
        }

        let key = self.derive_key(&salt, envelope.iter);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::Malformed(format!("cipher init: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)
    }
}

/// Decode a downloaded blob that may or may not be wrapped in an
/// envelope. Encrypted blobs without a configured passphrase, and
/// undecryptable envelopes, surface as crypto errors.
pub fn open_blob(
    bytes: &[u8],
    crypto: Option<&CryptoEngine>,
) -> Result<serde_json::Value, SyncError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| SyncError::Fatal(format!("blob is not valid JSON: {e}")))?;
    if !EncryptedEnvelope::looks_like(&value) {
        return Ok(value);
    }

    let envelope: EncryptedEnvelope = serde_json::from_value(value)
        .map_err(|e| SyncError::Crypto(format!("malformed envelope: {e}")))?;
    let engine = crypto.ok_or_else(|| {
        SyncError::Crypto("blob is encrypted but no passphrase is configured".into())
    })?;
    let plaintext = engine.decrypt(&envelope)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| SyncError::Crypto(format!("decrypted payload is not JSON: {e}")))
}

/// Grade a passphrase: length ≥ 12 plus three of four character classes.
pub fn check_strength(passphrase: &str) -> StrengthReport {
    let mut score = 0u8;
    let mut problems = Vec::new();

    if passphrase.chars().count() >= 12 {
        score += 1;
    } else {
        problems.push("use at least 12 characters".to_string());
    }

    let classes = [
        (
            passphrase.chars().any(|c| c.is_ascii_lowercase()),
            "add a lowercase letter",
        ),
        (
            passphrase.chars().any(|c| c.is_ascii_uppercase()),
            "add an uppercase letter",
        ),
        (
            passphrase.chars().any(|c| c.is_ascii_digit()),
            "add a digit",
        ),
    ];
    for (present, hint) in classes {
        if present {
            score += 1;
        } else {
            problems.push(hint.to_string());
        }
    }

    StrengthReport {
        score,
        acceptable: score >= 3 && passphrase.chars().count() >= 12,
        problems,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ITERATIONS: u32 = 1_000;

    fn engine(passphrase: &str) -> CryptoEngine {
        CryptoEngine::with_iterations(passphrase, TEST_ITERATIONS)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let engine = engine("Correct-Horse-1");
        let plaintext = br#"{"tree":{},"hash":"abc"}"#;

        let envelope = engine.encrypt(plaintext).unwrap();
        assert_eq!(envelope.v, ENVELOPE_VERSION);
        assert_eq!(envelope.alg, AEAD_ALGORITHM);
        assert_eq!(envelope.kdf, KDF_ALGORITHM);

        let opened = engine.decrypt(&envelope).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn wrong_passphrase_fails_without_partial_plaintext() {
        let envelope = engine("Correct-Horse-1").encrypt(b"secret").unwrap();
        let err = engine("Wrong-Horse-2").decrypt(&envelope).unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let engine = engine("Correct-Horse-1");
        let envelope = engine.encrypt(b"bookmark data").unwrap();

        // Flip one byte of the ciphertext.
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut raw = b64.decode(&envelope.ct).unwrap();
        raw[0] ^= 0x01;
        let tampered = EncryptedEnvelope {
            ct: b64.encode(raw),
            ..envelope
        };

        assert!(matches!(
            engine.decrypt(&tampered),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn foreign_algorithms_are_rejected_not_mapped() {
        let engine = engine("Correct-Horse-1");
        let envelope = engine.encrypt(b"data").unwrap();

        let chacha = EncryptedEnvelope {
            alg: "ChaCha20-Poly1305".into(),
            ..envelope.clone()
        };
        assert!(matches!(
            engine.decrypt(&chacha),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));

        let argon = EncryptedEnvelope {
            kdf: "Argon2id".into(),
            ..envelope
        };
        assert!(matches!(
            engine.decrypt(&argon),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let engine = engine("Correct-Horse-1");
        let envelope = EncryptedEnvelope {
            v: 2,
            ..engine.encrypt(b"data").unwrap()
        };
        assert!(matches!(
            engine.decrypt(&envelope),
            Err(CryptoError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn envelope_json_shape_matches_the_wire_format() {
        let envelope = engine("Correct-Horse-1").encrypt(b"data").unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        for key in ["v", "alg", "kdf", "iter", "salt", "iv", "ct"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert!(EncryptedEnvelope::looks_like(&json));
        assert!(!EncryptedEnvelope::looks_like(
            &serde_json::json!({"tree": {}, "hash": "x"})
        ));
    }

    #[test]
    fn strength_check_grades_passphrases() {
        assert!(check_strength("Correct-Horse-1").acceptable);
        let weak = check_strength("short");
        assert!(!weak.acceptable);
        assert!(!weak.problems.is_empty());
        assert!(!check_strength("all-lowercase-but-long").acceptable);
    }
}
