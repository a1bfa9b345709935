//! Key types and their stored representation.
//!
//! Ed25519 keys are kept as their 32-byte seed, AES-256-GCM keys as the raw
//! 32-byte secret. Both are sealed by the store like any other key entry.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use strongroom_store::{KeyEntry, RawTags};

use crate::error::{KmsError, KmsResult};

const ED25519_ALGORITHM: &str = "ed25519";
const AES256_GCM_ALGORITHM: &str = "a256gcm";

/// Length of an Ed25519 seed and of an AES-256 key.
pub const SECRET_LEN: usize = 32;

/// Algorithms the vault can create and import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ed25519,
    Aes256Gcm,
}

impl KeyType {
    /// Algorithm name stored alongside the key.
    pub fn algorithm(self) -> &'static str {
        match self {
            Self::Ed25519 => ED25519_ALGORITHM,
            Self::Aes256Gcm => AES256_GCM_ALGORITHM,
        }
    }

    fn from_algorithm(algorithm: &str) -> KmsResult<Self> {
        match algorithm {
            ED25519_ALGORITHM => Ok(Self::Ed25519),
            AES256_GCM_ALGORITHM => Ok(Self::Aes256Gcm),
            other => Err(KmsError::UnsupportedAlgorithm {
                algorithm: other.to_string(),
            }),
        }
    }
}

/// Private key material supplied by the caller or freshly generated.
#[derive(Clone)]
pub enum KeyMaterial {
    /// 32-byte Ed25519 seed.
    Ed25519 { seed: Vec<u8> },
    /// 32-byte AES-256-GCM key.
    Aes256Gcm { secret: Vec<u8> },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_type", &self.key_type())
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// Generate new random material for `key_type`.
    pub fn generate(key_type: KeyType) -> KmsResult<Self> {
        let mut secret = vec![0u8; SECRET_LEN];
        SystemRandom::new()
            .fill(&mut secret)
            .map_err(|_| KmsError::Generation {
                reason: "system random source failed".into(),
            })?;
        Ok(match key_type {
            KeyType::Ed25519 => Self::Ed25519 { seed: secret },
            KeyType::Aes256Gcm => Self::Aes256Gcm { secret },
        })
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            Self::Ed25519 { .. } => KeyType::Ed25519,
            Self::Aes256Gcm { .. } => KeyType::Aes256Gcm,
        }
    }

    fn secret(&self) -> &[u8] {
        match self {
            Self::Ed25519 { seed } => seed,
            Self::Aes256Gcm { secret } => secret,
        }
    }

    /// Check the length and, for Ed25519, that the seed yields a key pair.
    pub fn validate(&self) -> KmsResult<()> {
        let len = self.secret().len();
        if len != SECRET_LEN {
            return Err(KmsError::InvalidKeyMaterial {
                reason: format!(
                    "{} key must be {SECRET_LEN} bytes, got {len}",
                    self.key_type().algorithm()
                ),
            });
        }
        self.public_key().map(|_| ())
    }

    /// Public key bytes, `None` for symmetric keys.
    pub fn public_key(&self) -> KmsResult<Option<Vec<u8>>> {
        match self {
            Self::Ed25519 { seed } => {
                let pair = Ed25519KeyPair::from_seed_unchecked(seed).map_err(|err| {
                    KmsError::InvalidKeyMaterial {
                        reason: err.to_string(),
                    }
                })?;
                Ok(Some(pair.public_key().as_ref().to_vec()))
            }
            Self::Aes256Gcm { .. } => Ok(None),
        }
    }

    pub(crate) fn into_entry(self, key_id: &str) -> KeyEntry {
        let algorithm = self.key_type().algorithm().to_string();
        let secret = match self {
            Self::Ed25519 { seed } => seed,
            Self::Aes256Gcm { secret } => secret,
        };
        KeyEntry {
            name: key_id.to_string(),
            algorithm,
            secret,
            metadata: None,
            tags: RawTags::new(),
        }
    }

    pub(crate) fn from_entry(entry: KeyEntry) -> KmsResult<Self> {
        Ok(match KeyType::from_algorithm(&entry.algorithm)? {
            KeyType::Ed25519 => Self::Ed25519 { seed: entry.secret },
            KeyType::Aes256Gcm => Self::Aes256Gcm {
                secret: entry.secret,
            },
        })
    }
}

/// Public view of a stored key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    pub key_id: String,
    pub key_type: KeyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Vec<u8>>,
}

impl PublicKeyInfo {
    pub(crate) fn from_material(key_id: &str, material: &KeyMaterial) -> KmsResult<Self> {
        Ok(Self {
            key_id: key_id.to_string(),
            key_type: material.key_type(),
            public_key: material.public_key()?,
        })
    }

    /// Unpadded base64url public key.
    pub fn public_key_base64(&self) -> Option<String> {
        self.public_key.as_ref().map(|key| URL_SAFE_NO_PAD.encode(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_material_has_expected_shape() {
        let ed = KeyMaterial::generate(KeyType::Ed25519).unwrap();
        assert_eq!(ed.public_key().unwrap().unwrap().len(), 32);
        ed.validate().unwrap();

        let aes = KeyMaterial::generate(KeyType::Aes256Gcm).unwrap();
        assert!(aes.public_key().unwrap().is_none());
        aes.validate().unwrap();
    }

    #[test]
    fn same_seed_gives_same_public_key() {
        let seed = vec![7u8; SECRET_LEN];
        let a = KeyMaterial::Ed25519 { seed: seed.clone() };
        let b = KeyMaterial::Ed25519 { seed };
        assert_eq!(a.public_key().unwrap(), b.public_key().unwrap());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = KeyMaterial::Aes256Gcm { secret: vec![1; 16] }
            .validate()
            .unwrap_err();
        assert!(matches!(err, KmsError::InvalidKeyMaterial { .. }));
    }

    #[test]
    fn entry_round_trip_keeps_algorithm() {
        let material = KeyMaterial::generate(KeyType::Aes256Gcm).unwrap();
        let entry = material.clone().into_entry("k1");
        assert_eq!(entry.name, "k1");
        assert_eq!(entry.algorithm, "a256gcm");
        let back = KeyMaterial::from_entry(entry).unwrap();
        assert_eq!(back.key_type(), KeyType::Aes256Gcm);
    }

    #[test]
    fn unknown_algorithm_is_unsupported() {
        let entry = KeyEntry {
            name: "k".into(),
            algorithm: "rsa".into(),
            secret: vec![],
            metadata: None,
            tags: RawTags::new(),
        };
        assert!(matches!(
            KeyMaterial::from_entry(entry),
            Err(KmsError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn debug_redacts_secret() {
        let material = KeyMaterial::Aes256Gcm { secret: vec![42; SECRET_LEN] };
        let printed = format!("{material:?}");
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("42"));
    }

    #[test]
    fn base64_public_key() {
        let info = PublicKeyInfo {
            key_id: "k".into(),
            key_type: KeyType::Ed25519,
            public_key: Some(vec![0xfb, 0xff]),
        };
        assert_eq!(info.public_key_base64().as_deref(), Some("-_8"));
    }
}
