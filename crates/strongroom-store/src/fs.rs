//! Filesystem capability used to enforce path-existence rules.
//!
//! The store manager only ever asks three questions of the filesystem:
//! does a path exist, create a directory, and delete a path. Everything
//! else (the store files themselves) is owned by the backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Filesystem operations consumed by [`crate::StoreManager`].
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Base directory for stores without an explicit path.
    fn data_path(&self) -> &Path;

    async fn exists(&self, path: &Path) -> std::io::Result<bool>;

    /// Create `dir` and any missing parents.
    async fn create_directory(&self, dir: &Path) -> std::io::Result<()>;

    /// Delete a file or a directory tree. Deleting a missing path succeeds.
    async fn delete(&self, path: &Path) -> std::io::Result<()>;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone)]
pub struct TokioFileSystem {
    data_path: PathBuf,
}

impl TokioFileSystem {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }
}

#[async_trait]
impl FileSystem for TokioFileSystem {
    fn data_path(&self) -> &Path {
        &self.data_path
    }

    async fn exists(&self, path: &Path) -> std::io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    async fn create_directory(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        debug!(dir = %dir.display(), "created directory");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> std::io::Result<()> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
        debug!(path = %path.display(), "deleted path");
        Ok(())
    }
}
