//! Error types for the key vault.

use strongroom_store::StoreError;

/// Alias for `Result<T, KmsError>`.
pub type KmsResult<T> = Result<T, KmsError>;

/// Errors produced by [`KeyVault`](crate::KeyVault) operations.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    // -- Key lookup errors --
    /// A key with the requested id is already stored.
    #[error("key with id '{key_id}' already exists")]
    KeyExists { key_id: String },

    // -- Key material errors --
    /// The stored algorithm is not one this vault handles.
    #[error("unsupported key algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    #[error("key generation failed: {reason}")]
    Generation { reason: String },

    // -- Storage errors --
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}
