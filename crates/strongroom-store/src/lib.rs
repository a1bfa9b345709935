//! # strongroom-store
//!
//! Tagged-record storage on top of an encrypted key-value backend.
//!
//! Records are stored per profile inside a store. Their typed tags are
//! flattened into the backend's string tags by the tag codec, and
//! structured queries are compiled into backend tag filters. Every backend
//! access runs inside a scoped session that commits, rolls back and closes
//! on every path.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  StorageService (records, queries, paging)   │
//! ├──────────────────────────────────────────────┤
//! │  StoreManager::run_scoped (sessions, txns)   │
//! │  StoreManager (lifecycle, tenancy, registry) │
//! ├──────────────────────────────────────────────┤
//! │  codec (typed tags)   query (filters)        │
//! ├──────────────────────────────────────────────┤
//! │  Backend traits                              │
//! │  SqliteBackend (rusqlite + AES-256-GCM)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use strongroom_store::{
//!     SqliteBackend, StorageService, StoreConfig, StoreContext, StoreManager,
//!     StoreModuleConfig, TokioFileSystem,
//! };
//!
//! let manager = StoreManager::new(
//!     Arc::new(SqliteBackend::new()),
//!     Arc::new(TokioFileSystem::new("data")),
//!     StoreModuleConfig::new(StoreConfig::new("agent", "passphrase")),
//! );
//! let storage = StorageService::new(Arc::new(manager));
//! let notes: Vec<Note> = storage.get_all(&StoreContext::root()).await?;
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod manager;
pub mod query;
mod registry;
pub mod session;
pub mod storage;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{
    Backend, BackendError, BackendErrorCode, BackendSession, BackendStore, Entry, KdfMethod,
    KeyEntry, SqliteBackend, StoreOptions,
};
pub use codec::{RawTags, TagValue, Tags};
pub use config::{
    DatabaseConfig, MultiWalletDatabaseScheme, PostgresConfig, PostgresCredentials, ResolvedUri,
    SqliteConfig, StoreConfig, StoreModuleConfig, uri_from_store_config,
};
pub use context::{GeneratedTenantKeys, ROOT_CONTEXT_ID, StoreContext, TenantStoreConfigProvider};
pub use error::{StoreError, StoreResult};
pub use fs::{FileSystem, TokioFileSystem};
pub use manager::StoreManager;
pub use query::{Query, TagFilter};
pub use session::ScopedSession;
pub use storage::{
    CURRENT_STORAGE_VERSION, QueryOptions, STORAGE_VERSION_RECORD_ID, StorageRecord,
    StorageService, StorageVersionRecord,
};

/// Generate a random key for the `raw` key derivation method.
pub fn generate_raw_store_key() -> StoreResult<String> {
    backend::crypto::generate_raw_key()
        .map_err(|err| StoreError::other("failed to generate store key", Some(err)))
}
