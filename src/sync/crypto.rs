//! Crypto Service - Encryption at Rest for the Local Replica
//!
//! - Secret + account id → PBKDF2-HMAC-SHA256 → per-user master key
//! - Per-envelope key = HKDF-SHA256(master, fresh random salt)
//! - AES-256-GCM with a fresh random 96-bit nonce per call
//! - HMAC-SHA256 blind index for equality search without decryption
//! - HKDF field-scoped sub-keys for individually encrypted fields
//!
//! Key material only ever lives in memory and is zeroized on `clear()`
//! or drop.

use super::models::{EncryptedEnvelope, ENVELOPE_VERSION};
use base64::Engine;
use chrono::Utc;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{hkdf, hmac, pbkdf2};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::RwLock;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const ENVELOPE_SALT_LEN: usize = 16;

const ACCOUNT_SALT_CONTEXT: &[u8] = b"medsync-account-salt-v1";
const ENVELOPE_KEY_INFO: &[u8] = b"medsync-envelope-key-v1";
const SEARCH_KEY_INFO: &[u8] = b"medsync-blind-index-v1";
const FIELD_KEY_SALT: &[u8] = b"medsync-field-key-v1";

// ============================================================================
// Key Wrappers
// ============================================================================

/// Wrapper for sensitive key data that zeroizes on drop
#[derive(Clone)]
struct SecureKey([u8; KEY_LEN]);

impl Drop for SecureKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl AsRef<[u8]> for SecureKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Custom key type for HKDF output
struct KeyType(usize);

impl hkdf::KeyType for KeyType {
    fn len(&self) -> usize {
        self.0
    }
}

/// Sub-key scoped to one sensitive field
#[derive(Clone)]
pub struct FieldKey {
    field: String,
    key: SecureKey,
}

impl FieldKey {
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Encrypt a value under this field's key
    pub fn encrypt(&self, plaintext: &serde_json::Value) -> Result<EncryptedEnvelope, CryptoError> {
        let bytes = serde_json::to_vec(plaintext)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;
        seal(&self.key, &bytes)
    }

    /// Decrypt a value produced by [`FieldKey::encrypt`] for the same field
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<serde_json::Value, CryptoError> {
        let bytes = open(&self.key, envelope)?;
        serde_json::from_slice(&bytes).map_err(|e| CryptoError::Serialization(e.to_string()))
    }
}

impl PartialEq for FieldKey {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.key.0 == other.key.0
    }
}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldKey")
            .field("field", &self.field)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Everything derived from the user's secret
struct KeyMaterial {
    master: SecureKey,
    search: hmac::Key,
    field_keys: HashMap<String, FieldKey>,
}

// ============================================================================
// Crypto Service
// ============================================================================

/// Per-user encryption service
pub struct CryptoService {
    kdf_iterations: NonZeroU32,
    keys: RwLock<Option<KeyMaterial>>,
}

impl CryptoService {
    pub fn new(kdf_iterations: u32) -> Self {
        Self {
            kdf_iterations: NonZeroU32::new(kdf_iterations).unwrap_or(NonZeroU32::MIN),
            keys: RwLock::new(None),
        }
    }

    /// Derive the per-user key from `secret`
    ///
    /// The PBKDF2 salt is bound to `account_id`, so the same secret yields
    /// different keys for different accounts.
    pub fn initialize(&self, secret: &str, account_id: &str) -> Result<(), CryptoError> {
        if secret.is_empty() {
            return Err(CryptoError::InvalidSecret("secret cannot be empty".to_string()));
        }
        if account_id.is_empty() {
            return Err(CryptoError::InvalidSecret("account id cannot be empty".to_string()));
        }

        // Check the platform RNG before deriving anything
        let mut sample = [0u8; 1];
        SystemRandom::new()
            .fill(&mut sample)
            .map_err(|_| CryptoError::Unavailable("system random source".to_string()))?;

        let salt = digest(&SHA256, &[ACCOUNT_SALT_CONTEXT, account_id.as_bytes()].concat());

        let mut master = SecureKey([0u8; KEY_LEN]);
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            self.kdf_iterations,
            salt.as_ref(),
            secret.as_bytes(),
            &mut master.0,
        );

        let search_key = derive_subkey(&master, SEARCH_KEY_INFO, SEARCH_KEY_INFO)?;
        let search = hmac::Key::new(hmac::HMAC_SHA256, search_key.as_ref());

        let mut guard = self.keys.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(KeyMaterial {
            master,
            search,
            field_keys: HashMap::new(),
        });

        log::info!("Crypto service initialized for account {}", account_id);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Encrypt a JSON payload into a fresh envelope
    pub fn encrypt(&self, plaintext: &serde_json::Value) -> Result<EncryptedEnvelope, CryptoError> {
        let bytes = serde_json::to_vec(plaintext)
            .map_err(|e| CryptoError::Serialization(e.to_string()))?;

        let guard = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let keys = guard.as_ref().ok_or(CryptoError::NotInitialized)?;

        seal(&keys.master, &bytes)
    }

    /// Decrypt an envelope produced by [`CryptoService::encrypt`]
    ///
    /// Any alteration of ciphertext, iv, salt or schema version fails
    /// authentication.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<serde_json::Value, CryptoError> {
        let bytes = {
            let guard = self.keys.read().unwrap_or_else(|e| e.into_inner());
            let keys = guard.as_ref().ok_or(CryptoError::NotInitialized)?;
            open(&keys.master, envelope)?
        };

        serde_json::from_slice(&bytes).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Deterministic, case-insensitive blind index of `text` (hex)
    pub fn hash_for_search(&self, text: &str) -> Result<String, CryptoError> {
        let guard = self.keys.read().unwrap_or_else(|e| e.into_inner());
        let keys = guard.as_ref().ok_or(CryptoError::NotInitialized)?;

        let normalized = text.to_lowercase();
        let tag = hmac::sign(&keys.search, normalized.as_bytes());
        Ok(hex::encode(tag.as_ref()))
    }

    /// Sub-key for one field; cached until `clear()`
    pub fn generate_field_key(&self, field_name: &str) -> Result<FieldKey, CryptoError> {
        {
            let guard = self.keys.read().unwrap_or_else(|e| e.into_inner());
            let keys = guard.as_ref().ok_or(CryptoError::NotInitialized)?;
            if let Some(cached) = keys.field_keys.get(field_name) {
                return Ok(cached.clone());
            }
        }

        let mut guard = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let keys = guard.as_mut().ok_or(CryptoError::NotInitialized)?;

        let key = derive_subkey(&keys.master, FIELD_KEY_SALT, field_name.as_bytes())?;
        let field_key = FieldKey {
            field: field_name.to_string(),
            key,
        };
        keys.field_keys.insert(field_name.to_string(), field_key.clone());

        Ok(field_key)
    }

    /// Drop all key material; safe to call repeatedly
    pub fn clear(&self) {
        let mut guard = self.keys.write().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            log::info!("Crypto key material cleared");
        }
    }
}

impl Drop for CryptoService {
    fn drop(&mut self) {
        self.clear();
    }
}

// ============================================================================
// Primitives
// ============================================================================

/// HKDF-SHA256 expand of `base` under `salt`/`info`
fn derive_subkey(base: &SecureKey, salt: &[u8], info: &[u8]) -> Result<SecureKey, CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(base.as_ref());
    let info: &[&[u8]] = &[info];
    let okm = prk
        .expand(info, KeyType(KEY_LEN))
        .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;

    let mut key = SecureKey([0u8; KEY_LEN]);
    okm.fill(&mut key.0)
        .map_err(|_| CryptoError::KeyDerivation("Failed to fill key bytes".to_string()))?;

    Ok(key)
}

fn envelope_aad(version: u32) -> Vec<u8> {
    format!("medsync-envelope-v{}", version).into_bytes()
}

fn seal(base: &SecureKey, plaintext: &[u8]) -> Result<EncryptedEnvelope, CryptoError> {
    let rng = SystemRandom::new();

    let mut salt = [0u8; ENVELOPE_SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|_| CryptoError::Unavailable("system random source".to_string()))?;

    let mut iv = [0u8; NONCE_LEN];
    rng.fill(&mut iv)
        .map_err(|_| CryptoError::Unavailable("system random source".to_string()))?;

    let envelope_key = derive_subkey(base, &salt, ENVELOPE_KEY_INFO)?;
    let unbound_key = UnboundKey::new(&AES_256_GCM, envelope_key.as_ref())
        .map_err(|e| CryptoError::Encryption(format!("Key error: {:?}", e)))?;
    let key = LessSafeKey::new(unbound_key);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(iv),
        Aad::from(envelope_aad(ENVELOPE_VERSION)),
        &mut in_out,
    )
    .map_err(|e| CryptoError::Encryption(format!("{:?}", e)))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(EncryptedEnvelope {
        ciphertext: b64.encode(&in_out),
        iv: b64.encode(iv),
        salt: b64.encode(salt),
        timestamp: Utc::now(),
        version: ENVELOPE_VERSION,
    })
}

fn open(base: &SecureKey, envelope: &EncryptedEnvelope) -> Result<Vec<u8>, CryptoError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(CryptoError::Decryption(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    let mut ciphertext = b64
        .decode(&envelope.ciphertext)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let iv = b64
        .decode(&envelope.iv)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let salt = b64
        .decode(&envelope.salt)
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;

    if salt.len() != ENVELOPE_SALT_LEN {
        return Err(CryptoError::Decryption("invalid salt length".to_string()));
    }
    let nonce = Nonce::try_assume_unique_for_key(&iv)
        .map_err(|_| CryptoError::Decryption("invalid iv length".to_string()))?;

    let envelope_key = derive_subkey(base, &salt, ENVELOPE_KEY_INFO)?;
    let unbound_key = UnboundKey::new(&AES_256_GCM, envelope_key.as_ref())
        .map_err(|e| CryptoError::Decryption(format!("Key error: {:?}", e)))?;
    let key = LessSafeKey::new(unbound_key);

    let plaintext = key
        .open_in_place(nonce, Aad::from(envelope_aad(envelope.version)), &mut ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication failed - wrong key or tampered data".to_string()))?;

    Ok(plaintext.to_vec())
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CryptoError {
    #[error("Crypto service not initialized")]
    NotInitialized,

    #[error("Cryptography primitive unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

// ============================================================================
// Tests
// ============================================================================
