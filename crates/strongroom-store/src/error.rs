//! Error types for the strongroom-store crate.
//!
//! Every storage operation returns [`StoreError`] via [`StoreResult`]. Raw
//! [`BackendError`] codes are translated into one of these kinds at the
//! point where the backend call is made; nothing above the store manager or
//! the scoped session inspects a backend code again.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store, profile or record with the same identity already exists.
    #[error("{what} already exists")]
    Duplicate {
        what: String,
        #[source]
        source: Option<BackendError>,
    },

    /// The requested store, profile or record does not exist.
    #[error("{what} not found")]
    NotFound {
        what: String,
        #[source]
        source: Option<BackendError>,
    },

    /// The store exists but the supplied key does not open it.
    #[error("incorrect key for store '{store_id}'")]
    InvalidKey {
        store_id: String,
        #[source]
        source: BackendError,
    },

    /// A whole-store operation was invoked from a tenant context.
    #[error("'{operation}' must run on store level, context '{context_id}' is a tenant")]
    Scope {
        operation: &'static str,
        context_id: String,
    },

    /// The export destination is already present on disk.
    #[error("unable to export store, path '{}' already exists", path.display())]
    ExportPathExists { path: PathBuf },

    /// The import destination is already present on disk.
    #[error("unable to import store, path '{}' already exists", path.display())]
    ImportPathExists { path: PathBuf },

    /// Any other storage failure, optionally wrapping the backend cause.
    #[error("{message}")]
    Other {
        message: String,
        #[source]
        source: Option<BackendError>,
    },

    /// JSON serialization or deserialization of a record value failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    pub(crate) fn duplicate(what: impl Into<String>, source: Option<BackendError>) -> Self {
        Self::Duplicate {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>, source: Option<BackendError>) -> Self {
        Self::NotFound {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn other(message: impl Into<String>, source: Option<BackendError>) -> Self {
        Self::Other {
            message: message.into(),
            source,
        }
    }

    /// `true` for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// `true` for [`StoreError::Duplicate`].
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}
