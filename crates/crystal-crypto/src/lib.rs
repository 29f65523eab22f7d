//! Cryptographic primitives for the Memory Crystal relay (spec §4.A).
//!
//! Four operations: [`seal`]/[`open`] implement the versioned sealed-envelope
//! wire format (spec §6), [`hash`] is the content-addressing SHA-256, and
//! [`load_key`] reads the 32-byte master key from disk.
//!
//! HMAC-then-decrypt: the signing key is derived from the master key via
//! HKDF so the HMAC can be verified — rejecting a forged or corrupted
//! envelope — before any AEAD decryption is attempted.

#![deny(unsafe_code)]

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HKDF_INFO: &[u8] = b"crystal-relay-sign";
const ENVELOPE_VERSION: u8 = 1;

/// A 32-byte symmetric master key.
pub type Key = [u8; KEY_LEN];

/// Errors produced by crypto operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The envelope's version tag was not recognised.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    /// HMAC verification failed; the envelope is untrusted and must not be
    /// decrypted.
    #[error("hmac verification failed")]
    HmacMismatch,
    /// AEAD decryption/authentication failed.
    #[error("aead decryption failed")]
    AeadFailure,
    /// A field was not valid base64/hex.
    #[error("malformed envelope field: {0}")]
    Encoding(String),
    /// The key file did not decode to exactly 32 bytes.
    #[error("key must be exactly 32 bytes, got {0}")]
    BadKeyLength(usize),
    /// Underlying I/O failure reading the key file.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The versioned sealed-envelope wire format (spec §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Payload {
    /// Envelope format version; always 1.
    #[serde(rename = "v")]
    pub version: u8,
    /// Base64-encoded 96-bit nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext (without the AEAD tag).
    pub ciphertext: String,
    /// Base64-encoded 128-bit AEAD tag.
    pub tag: String,
    /// Hex-encoded HMAC-SHA-256 over `nonce || ciphertext || tag`.
    pub hmac: String,
}

fn derive_signing_key(master: &Key) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(&[]), master);
    let mut out = [0u8; 32];
    hk.expand(HKDF_INFO, &mut out).expect("32 bytes is a valid HKDF-SHA-256 output length");
    out
}

fn compute_hmac(signing_key: &[u8; 32], nonce: &[u8], ciphertext: &[u8], tag: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(signing_key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.update(ciphertext);
    mac.update(tag);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Seal `plaintext` under `key`, producing a versioned, HMAC-authenticated
/// AEAD envelope.
pub fn seal(plaintext: &[u8], key: &Key) -> Payload {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut combined =
        cipher.encrypt(nonce, plaintext).expect("AES-256-GCM encryption does not fail");
    let tag_start = combined.len() - TAG_LEN;
    let tag = combined.split_off(tag_start);
    let ciphertext = combined;

    let signing_key = derive_signing_key(key);
    let hmac = compute_hmac(&signing_key, &nonce_bytes, &ciphertext, &tag);

    Payload {
        version: ENVELOPE_VERSION,
        nonce: B64.encode(nonce_bytes),
        ciphertext: B64.encode(&ciphertext),
        tag: B64.encode(&tag),
        hmac: hex::encode(hmac),
    }
}

/// Open a sealed [`Payload`], verifying the HMAC before attempting AEAD
/// decryption. Any corruption or wrong key is rejected without revealing
/// plaintext.
pub fn open(payload: &Payload, key: &Key) -> Result<Vec<u8>, CryptoError> {
    if payload.version != ENVELOPE_VERSION {
        return Err(CryptoError::UnsupportedVersion(payload.version));
    }
    let nonce_bytes = B64
        .decode(&payload.nonce)
        .map_err(|e| CryptoError::Encoding(format!("nonce: {e}")))?;
    let ciphertext = B64
        .decode(&payload.ciphertext)
        .map_err(|e| CryptoError::Encoding(format!("ciphertext: {e}")))?;
    let tag = B64.decode(&payload.tag).map_err(|e| CryptoError::Encoding(format!("tag: {e}")))?;
    let expected_hmac =
        hex::decode(&payload.hmac).map_err(|e| CryptoError::Encoding(format!("hmac: {e}")))?;

    let signing_key = derive_signing_key(key);
    let computed = compute_hmac(&signing_key, &nonce_bytes, &ciphertext, &tag);

    if computed.ct_eq(expected_hmac.as_slice()).unwrap_u8() != 1 {
        return Err(CryptoError::HmacMismatch);
    }

    if nonce_bytes.len() != NONCE_LEN {
        return Err(CryptoError::Encoding("nonce must be 12 bytes".into()));
    }
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);
    cipher.decrypt(nonce, combined.as_ref()).map_err(|_| CryptoError::AeadFailure)
}

/// SHA-256 of `bytes`, hex-encoded. Used as the content-addressing hash for
/// chunk dedup and mirror integrity checks.
pub fn hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Load a 32-byte master key from a file: read, trim whitespace,
/// base64-decode, require exactly 32 bytes.
pub fn load_key<P: AsRef<std::path::Path>>(path: P) -> Result<Key, CryptoError> {
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim();
    let decoded =
        B64.decode(trimmed).map_err(|e| CryptoError::Encoding(format!("key file: {e}")))?;
    if decoded.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength(decoded.len()));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&decoded);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(byte: u8) -> Key {
        [byte; KEY_LEN]
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = test_key(0x42);
        let msg = b"hello, memory crystal";
        let payload = seal(msg, &key);
        let opened = open(&payload, &key).unwrap();
        assert_eq!(opened, msg);
    }

    #[test]
    fn wrong_key_fails() {
        let key = test_key(1);
        let other = test_key(2);
        let payload = seal(b"secret", &key);
        assert!(open(&payload, &other).is_err());
    }

    #[test]
    fn bit_flip_in_ciphertext_fails() {
        let key = test_key(7);
        let mut payload = seal(b"tamper me", &key);
        let mut bytes = B64.decode(&payload.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        payload.ciphertext = B64.encode(bytes);
        assert!(matches!(open(&payload, &key), Err(CryptoError::HmacMismatch)));
    }

    #[test]
    fn bit_flip_in_nonce_fails() {
        let key = test_key(9);
        let mut payload = seal(b"tamper me", &key);
        let mut bytes = B64.decode(&payload.nonce).unwrap();
        bytes[0] ^= 0x01;
        payload.nonce = B64.encode(bytes);
        assert!(matches!(open(&payload, &key), Err(CryptoError::HmacMismatch)));
    }

    #[test]
    fn bit_flip_in_tag_fails() {
        let key = test_key(11);
        let mut payload = seal(b"tamper me", &key);
        let mut bytes = B64.decode(&payload.tag).unwrap();
        bytes[0] ^= 0x01;
        payload.tag = B64.encode(bytes);
        assert!(matches!(open(&payload, &key), Err(CryptoError::HmacMismatch)));
    }

    #[test]
    fn bit_flip_in_hmac_fails() {
        let key = test_key(13);
        let mut payload = seal(b"tamper me", &key);
        let mut bytes = hex::decode(&payload.hmac).unwrap();
        bytes[0] ^= 0x01;
        payload.hmac = hex::encode(bytes);
        assert!(matches!(open(&payload, &key), Err(CryptoError::HmacMismatch)));
    }

    #[test]
    fn unsupported_version_rejected() {
        let key = test_key(5);
        let mut payload = seal(b"x", &key);
        payload.version = 2;
        assert!(matches!(open(&payload, &key), Err(CryptoError::UnsupportedVersion(2))));
    }

    #[test]
    fn load_key_requires_32_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.b64");
        std::fs::write(&path, format!("{}\n", B64.encode([1u8; 16]))).unwrap();
        assert!(matches!(load_key(&path), Err(CryptoError::BadKeyLength(16))));
    }

    #[test]
    fn load_key_trims_whitespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.b64");
        std::fs::write(&path, format!("  {}  \n", B64.encode([9u8; 32]))).unwrap();
        let key = load_key(&path).unwrap();
        assert_eq!(key, [9u8; 32]);
    }

    #[test]
    fn hash_is_deterministic_and_distinguishes_content() {
        assert_eq!(hash(b"a"), hash(b"a"));
        assert_ne!(hash(b"a"), hash(b"b"));
        assert_eq!(hash(b"abc").len(), 64);
    }

    proptest::proptest! {
        #[test]
        fn seal_open_roundtrip_any_message(msg in proptest::collection::vec(proptest::num::u8::ANY, 0..2048)) {
            let key = test_key(0x99);
            let payload = seal(&msg, &key);
            let opened = open(&payload, &key).unwrap();
            proptest::prop_assert_eq!(opened, msg);
        }
    }
}
