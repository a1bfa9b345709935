//! Store key derivation and AES-256-GCM sealing using `ring`.
//!
//! - **Sealing**: entry values, tags and key material are sealed with
//!   AES-256-GCM under the store key. A sealed blob is laid out as
//!   `[12 bytes nonce][ciphertext + 16 bytes tag]`.
//! - **Key derivation**: `raw` pass keys are decoded directly, `kdf:*`
//!   methods run PBKDF2-HMAC-SHA256 over the pass key and the store salt.
//!
//! # Security Notes
//!
//! - Nonces are random per seal. With 96-bit nonces the collision
//!   probability stays negligible below ~2^32 seals under one key, and a
//!   rekey resets the count.
//! - Key material is not zeroized on drop.

use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use super::{BackendError, BackendErrorCode, BackendResult, KdfMethod};

/// Length of the store encryption key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the per-store KDF salt in bytes.
pub const SALT_LEN: usize = 32;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// PBKDF2 rounds for [`KdfMethod::Pbkdf2Mod`] (OWASP 2023 for HMAC-SHA256).
const PBKDF2_MOD_ITERATIONS: NonZeroU32 = NonZeroU32::new(600_000).unwrap();

/// PBKDF2 rounds for [`KdfMethod::Pbkdf2Int`].
const PBKDF2_INT_ITERATIONS: NonZeroU32 = NonZeroU32::new(10_000).unwrap();

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// A derived store encryption key.
#[derive(Clone)]
pub struct StoreKey([u8; KEY_LEN]);

impl std::fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StoreKey(<redacted>)")
    }
}

/// Yields exactly one nonce; every seal uses a fresh sealing key.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

fn encryption_error(reason: &str) -> BackendError {
    BackendError::new(BackendErrorCode::Encryption, reason)
}

/// Derive the store key from a pass key.
///
/// # Errors
///
/// Returns an `Input` error if a `raw` pass key is not base64 or does not
/// decode to [`KEY_LEN`] bytes.
pub fn derive_store_key(
    method: KdfMethod,
    pass_key: &str,
    salt: &[u8],
) -> BackendResult<StoreKey> {
    let mut key = [0u8; KEY_LEN];

    match method {
        KdfMethod::Raw => {
            let decoded = STANDARD.decode(pass_key).map_err(|e| {
                BackendError::new(BackendErrorCode::Input, format!("raw key is not base64: {e}"))
            })?;
            if decoded.len() != KEY_LEN {
                return Err(BackendError::new(
                    BackendErrorCode::Input,
                    format!("raw key must be {KEY_LEN} bytes, got {}", decoded.len()),
                ));
            }
            key.copy_from_slice(&decoded);
        }
        KdfMethod::Pbkdf2Mod => {
            pbkdf2::derive(PBKDF2_ALG, PBKDF2_MOD_ITERATIONS, salt, pass_key.as_bytes(), &mut key);
        }
        KdfMethod::Pbkdf2Int => {
            pbkdf2::derive(PBKDF2_ALG, PBKDF2_INT_ITERATIONS, salt, pass_key.as_bytes(), &mut key);
        }
    }

    tracing::trace!(method = %method, "derived store key");
    Ok(StoreKey(key))
}

/// Generate a random key suitable for [`KdfMethod::Raw`], base64 encoded.
pub fn generate_raw_key() -> BackendResult<String> {
    Ok(STANDARD.encode(random_bytes(KEY_LEN)?))
}

/// Generate `len` cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> BackendResult<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new().fill(&mut buf).map_err(|_| {
        BackendError::new(BackendErrorCode::Unexpected, "failed to generate random bytes")
    })?;
    Ok(buf)
}

/// Seal `plaintext` under `key`, returning `nonce || ciphertext || tag`.
pub fn seal(key: &StoreKey, plaintext: &[u8]) -> BackendResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| encryption_error("failed to generate random nonce"))?;

    let unbound = UnboundKey::new(AEAD_ALG, &key.0)
        .map_err(|_| encryption_error("failed to create AES-256-GCM key"))?;
    let mut sealing_key = SealingKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| encryption_error("seal_in_place failed"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Open a blob produced by [`seal`].
///
/// # Errors
///
/// Returns an `Encryption` error if the key is wrong or the blob has been
/// tampered with.
pub fn open(key: &StoreKey, sealed: &[u8]) -> BackendResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(encryption_error("sealed blob is too short"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);

    let unbound = UnboundKey::new(AEAD_ALG, &key.0)
        .map_err(|_| encryption_error("failed to create AES-256-GCM key"))?;
    let mut opening_key = aead::OpeningKey::new(unbound, SingleNonce(Some(nonce)));

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| encryption_error("authentication failed, wrong key or corrupted data"))?;

    Ok(plaintext.to_vec())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
