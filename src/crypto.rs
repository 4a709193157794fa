//! AES-256-GCM envelopes keyed by PBKDF2-HMAC-SHA256.
//!
//! An envelope is the JSON object `{v, salt, iv, tag, data}` with the last
//! four fields base64 encoded. The tag is stored apart from the ciphertext,
//! so it is split off after sealing and re-joined before opening.

use aes_gcm::aead::{rand_core::RngCore, Aead, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub const ENVELOPE_VERSION: u8 = 1;
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 200_000;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encrypted payload is malformed: {0}")]
    MalformedEnvelope(&'static str),
    /// Wrong password or tampered bytes. The two are indistinguishable.
    #[error("unable to decrypt: wrong password or corrupted data")]
    AuthOrIntegrity,
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("encrypted document is not valid json: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub salt: String,
    pub iv: String,
    pub tag: String,
    pub data: String,
}

impl Envelope {
    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(raw).map_err(|_| CryptoError::MalformedEnvelope("not an envelope"))
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn salt_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        let salt = decode_b64(self.salt.as_str())?;
        if salt.is_empty() {
            return Err(CryptoError::MalformedEnvelope("empty salt"));
        }
        Ok(salt)
    }
}

/// A password-derived AES key together with the salt it was derived from.
#[derive(Clone)]
pub struct DerivedKey {
    salt: Vec<u8>,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl DerivedKey {
    /// Derives a key under a freshly generated salt.
    pub fn generate(password: &str, iterations: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self::derive(password, &salt, iterations)
    }

    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Self {
        Self {
            salt: salt.to_vec(),
            key: derive_key(password, salt, iterations),
        }
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("salt", &encode_b64(&self.salt))
            .finish_non_exhaustive()
    }
}

pub fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations.max(1), &mut *key);
    key
}

/// Seals `text` under an existing key. The nonce is always fresh.
pub fn encrypt_text_with_key(text: &str, key: &DerivedKey) -> Result<Envelope, CryptoError> {
    let mut iv = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut iv);
    let cipher = Aes256Gcm::new_from_slice(key.key.as_slice())
        .map_err(|err| CryptoError::Cipher(err.to_string()))?;
    let nonce = Nonce::from_slice(&iv);
    let encrypted = cipher
        .encrypt(nonce, text.as_bytes())
        .map_err(|err| CryptoError::Cipher(err.to_string()))?;

    if encrypted.len() < TAG_LEN {
        return Err(CryptoError::Cipher("encryption output too short".to_string()));
    }
    let (data, tag) = encrypted.split_at(encrypted.len() - TAG_LEN);

    Ok(Envelope {
        v: ENVELOPE_VERSION,
        salt: encode_b64(key.salt()),
        iv: encode_b64(&iv),
        tag: encode_b64(tag),
        data: encode_b64(data),
    })
}

/// Seals `text` under a fresh salt and nonce.
pub fn encrypt_text(text: &str, password: &str, iterations: u32) -> Result<Envelope, CryptoError> {
    let key = DerivedKey::generate(password, iterations);
    encrypt_text_with_key(text, &key)
}

pub fn decrypt_envelope_with_key(
    envelope: &Envelope,
    key: &DerivedKey,
) -> Result<String, CryptoError> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(CryptoError::MalformedEnvelope("unsupported envelope version"));
    }
    let iv = decode_b64(envelope.iv.as_str())?;
    let tag = decode_b64(envelope.tag.as_str())?;
    let data = decode_b64(envelope.data.as_str())?;
    if iv.len() != NONCE_LEN {
        return Err(CryptoError::MalformedEnvelope("bad nonce length"));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::MalformedEnvelope("bad tag length"));
    }

    let cipher = Aes256Gcm::new_from_slice(key.key.as_slice())
        .map_err(|err| CryptoError::Cipher(err.to_string()))?;
    let nonce = Nonce::from_slice(iv.as_slice());
    let mut combined = Vec::with_capacity(data.len() + tag.len());
    combined.extend_from_slice(data.as_slice());
    combined.extend_from_slice(tag.as_slice());

    let decrypted = Zeroizing::new(
        cipher
            .decrypt(nonce, combined.as_slice())
            .map_err(|_| CryptoError::AuthOrIntegrity)?,
    );
    String::from_utf8(decrypted.to_vec()).map_err(|_| CryptoError::AuthOrIntegrity)
}

pub fn decrypt_envelope(
    envelope: &Envelope,
    password: &str,
    iterations: u32,
) -> Result<String, CryptoError> {
    let salt = envelope.salt_bytes()?;
    let key = DerivedKey::derive(password, salt.as_slice(), iterations);
    decrypt_envelope_with_key(envelope, &key)
}

/// Serializes `value` to JSON and seals it under a fresh salt and nonce.
pub fn encrypt<T: Serialize>(
    value: &T,
    password: &str,
    iterations: u32,
) -> Result<Envelope, CryptoError> {
    let text = Zeroizing::new(serde_json::to_string(value)?);
    encrypt_text(text.as_str(), password, iterations)
}

/// Opens an envelope and parses the JSON inside. Fails closed.
pub fn decrypt<T: DeserializeOwned>(
    envelope: &Envelope,
    password: &str,
    iterations: u32,
) -> Result<T, CryptoError> {
    let text = Zeroizing::new(decrypt_envelope(envelope, password, iterations)?);
    Ok(serde_json::from_str(text.as_str())?)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn decode_b64(value: &str) -> Result<Vec<u8>, CryptoError> {
    B64.decode(value)
        .map_err(|_| CryptoError::MalformedEnvelope("invalid base64"))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    B64.encode(bytes)
}

/// Byte comparison whose running time does not depend on where inputs differ.
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
