//! Capability interface of the encrypted key-value backend.
//!
//! The storage layer never talks to a concrete engine directly. It consumes
//! three object-safe traits:
//!
//! - [`Backend`]: provisions, opens and removes physical stores by URI.
//! - [`BackendStore`]: one open store: sessions, profiles, rekey, copy.
//! - [`BackendSession`]: one session or transaction bound to a profile.
//!
//! Failures are reported as [`BackendError`] carrying a [`BackendErrorCode`].
//! Those codes are only ever inspected by the store manager and the scoped
//! session wrapper, which translate them into [`crate::StoreError`] kinds.
//!
//! [`SqliteBackend`] is the bundled implementation.

pub mod crypto;
pub mod migration;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::RawTags;
use crate::query::TagFilter;

pub use sqlite::SqliteBackend;

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// Error codes reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorCode {
    /// Generic engine failure.
    Backend,
    /// The store is locked by another writer.
    Busy,
    /// The store, profile or entry already exists.
    Duplicate,
    /// Decryption failed, usually a wrong store key.
    Encryption,
    /// Invalid arguments or use of a closed handle.
    Input,
    /// The store, profile or entry does not exist.
    NotFound,
    /// Internal invariant violated.
    Unexpected,
    /// The requested feature or URI scheme is not supported.
    Unsupported,
    /// Backend-specific error.
    Custom,
}

impl BackendErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Busy => "busy",
            Self::Duplicate => "duplicate",
            Self::Encryption => "encryption",
            Self::Input => "input",
            Self::NotFound => "not_found",
            Self::Unexpected => "unexpected",
            Self::Unsupported => "unsupported",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for BackendErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by the backend, decoded once at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend {code} error: {message}")]
pub struct BackendError {
    pub code: BackendErrorCode,
    pub message: String,
}

impl BackendError {
    pub fn new(code: BackendErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is(&self, code: BackendErrorCode) -> bool {
        self.code == code
    }
}

/// Alias for `Result<T, BackendError>`.
pub type BackendResult<T> = Result<T, BackendError>;

// ═══════════════════════════════════════════════════════════════════════
//  Keys and options
// ═══════════════════════════════════════════════════════════════════════

/// How a store pass key is turned into the store encryption key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfMethod {
    /// The pass key is a base64 encoded 32-byte key.
    #[serde(rename = "raw")]
    Raw,
    /// PBKDF2-HMAC-SHA256, moderate cost.
    #[default]
    #[serde(rename = "kdf:pbkdf2:mod")]
    Pbkdf2Mod,
    /// PBKDF2-HMAC-SHA256, interactive cost.
    #[serde(rename = "kdf:pbkdf2:int")]
    Pbkdf2Int,
}

impl KdfMethod {
    /// Key method string as persisted by the backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Pbkdf2Mod => "kdf:pbkdf2:mod",
            Self::Pbkdf2Int => "kdf:pbkdf2:int",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "kdf:pbkdf2:mod" => Some(Self::Pbkdf2Mod),
            "kdf:pbkdf2:int" => Some(Self::Pbkdf2Int),
            _ => None,
        }
    }
}

impl fmt::Display for KdfMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address and credentials used to provision, open or copy to a store.
#[derive(Clone)]
pub struct StoreOptions {
    pub uri: String,
    pub key_method: KdfMethod,
    pub pass_key: String,
    /// Default profile to create on provision, or to select on open.
    pub profile: Option<String>,
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("uri", &self.uri)
            .field("key_method", &self.key_method)
            .field("pass_key", &"<redacted>")
            .field("profile", &self.profile)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Entries
// ═══════════════════════════════════════════════════════════════════════

/// A record entry as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub category: String,
    pub name: String,
    pub value: Vec<u8>,
    pub tags: RawTags,
}

/// A key object as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub name: String,
    pub algorithm: String,
    pub secret: Vec<u8>,
    pub metadata: Option<String>,
    #[serde(default)]
    pub tags: RawTags,
}

// ═══════════════════════════════════════════════════════════════════════
//  Traits
// ═══════════════════════════════════════════════════════════════════════

/// Entry point of a backend: manages physical stores by URI.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a new store. Fails with `Duplicate` if it exists and
    /// `recreate` is false.
    async fn provision(
        &self,
        options: &StoreOptions,
        recreate: bool,
    ) -> BackendResult<Arc<dyn BackendStore>>;

    /// Open an existing store.
    async fn open(&self, options: &StoreOptions) -> BackendResult<Arc<dyn BackendStore>>;

    /// Remove a store. Returns `false` if there was nothing to remove.
    async fn remove(&self, uri: &str) -> BackendResult<bool>;
}

/// An open store.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Start a session (or a transaction) on `profile`, or on the default
    /// profile when `None`. Fails with `NotFound` if the profile is missing.
    async fn session(
        &self,
        profile: Option<&str>,
        transaction: bool,
    ) -> BackendResult<Box<dyn BackendSession>>;

    async fn create_profile(&self, name: &str) -> BackendResult<String>;

    async fn list_profiles(&self) -> BackendResult<Vec<String>>;

    async fn remove_profile(&self, name: &str) -> BackendResult<bool>;

    async fn default_profile(&self) -> BackendResult<String>;

    /// Re-encrypt the store under a new pass key.
    async fn rekey(&self, key_method: KdfMethod, pass_key: &str) -> BackendResult<()>;

    /// Copy every profile and entry into a new store at `target`.
    async fn copy_to(&self, target: &StoreOptions, recreate: bool) -> BackendResult<()>;

    /// Close the store. Further calls fail with `Input`.
    async fn close(&self) -> BackendResult<()>;
}

/// A session or transaction bound to one profile.
///
/// A session is closed exactly once, by [`commit`](Self::commit),
/// [`rollback`](Self::rollback) or [`close`](Self::close). Closing an
/// uncommitted transaction discards its changes.
#[async_trait]
pub trait BackendSession: Send {
    fn is_open(&self) -> bool;

    fn is_transaction(&self) -> bool;

    async fn count(&mut self, category: &str, filter: Option<&TagFilter>) -> BackendResult<usize>;

    async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        for_update: bool,
    ) -> BackendResult<Option<Entry>>;

    /// Scan a category in insertion order, filtered, then paginated.
    async fn fetch_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
        offset: Option<usize>,
        limit: Option<usize>,
        for_update: bool,
    ) -> BackendResult<Vec<Entry>>;

    /// Fails with `Duplicate` if the entry exists.
    async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> BackendResult<()>;

    /// Fails with `NotFound` if the entry does not exist.
    async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> BackendResult<()>;

    /// Fails with `NotFound` if the entry does not exist.
    async fn remove(&mut self, category: &str, name: &str) -> BackendResult<()>;

    async fn remove_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
    ) -> BackendResult<usize>;

    async fn insert_key(&mut self, key: &KeyEntry) -> BackendResult<()>;

    async fn fetch_key(&mut self, name: &str, for_update: bool) -> BackendResult<Option<KeyEntry>>;

    async fn remove_key(&mut self, name: &str) -> BackendResult<()>;

    async fn commit(&mut self) -> BackendResult<()>;

    async fn rollback(&mut self) -> BackendResult<()>;

    async fn close(&mut self) -> BackendResult<()>;
}
