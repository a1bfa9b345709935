//! Scoped sessions and transactions.
//!
//! [`StoreManager::run_scoped`] is the only way storage code touches a
//! backend session. It resolves the store and profile of a context, opens a
//! session (creating a missing tenant profile on the way), runs the body,
//! commits or rolls back, and always closes the session.
//!
//! The body receives a [`ScopedSession`], which wraps the raw backend
//! session and translates backend error codes into [`StoreError`] kinds.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{
    BackendError, BackendErrorCode, BackendResult, BackendSession, BackendStore, Entry, KeyEntry,
};
use crate::codec::RawTags;
use crate::context::StoreContext;
use crate::error::{StoreError, StoreResult};
use crate::manager::StoreManager;
use crate::query::TagFilter;
use crate::storage;

/// `true` for the backend's "value not found" quirk, reported as a
/// generic error instead of an empty result.
fn is_null_pointer(err: &BackendError) -> bool {
    err.is(BackendErrorCode::Backend) && err.message.to_ascii_lowercase().contains("null pointer")
}

/// Translate a failed write on `what`.
fn write_error(what: String, err: BackendError) -> StoreError {
    match err.code {
        BackendErrorCode::Duplicate => StoreError::duplicate(what, Some(err)),
        BackendErrorCode::NotFound => StoreError::not_found(what, Some(err)),
        _ => StoreError::other(format!("error writing {what}"), Some(err)),
    }
}

/// A fetch that reports the null-pointer quirk means "absent".
fn absent_on_null_pointer<T>(result: BackendResult<Option<T>>, what: &str) -> StoreResult<Option<T>> {
    match result {
        Ok(found) => Ok(found),
        Err(err) if is_null_pointer(&err) => Ok(None),
        Err(err) => Err(StoreError::other(format!("error fetching {what}"), Some(err))),
    }
}

/// A scan that reports the null-pointer quirk matched nothing.
fn empty_on_null_pointer<T>(result: BackendResult<Vec<T>>, what: &str) -> StoreResult<Vec<T>> {
    match result {
        Ok(found) => Ok(found),
        Err(err) if is_null_pointer(&err) => Ok(Vec::new()),
        Err(err) => Err(StoreError::other(format!("error querying {what}"), Some(err))),
    }
}

/// An open session or transaction handed to a scoped body.
pub struct ScopedSession {
    inner: Box<dyn BackendSession>,
    profile: Option<String>,
}

impl ScopedSession {
    fn new(inner: Box<dyn BackendSession>, profile: Option<String>) -> Self {
        Self { inner, profile }
    }

    /// Tenant profile, or `None` for the store default.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn is_transaction(&self) -> bool {
        self.inner.is_transaction()
    }

    /// Fails with [`StoreError::Duplicate`] if the entry exists.
    pub async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> StoreResult<()> {
        self.inner
            .insert(category, name, value, tags)
            .await
            .map_err(|err| write_error(format!("{category} record with id '{name}'"), err))
    }

    /// Fails with [`StoreError::NotFound`] if the entry is absent.
    pub async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> StoreResult<()> {
        self.inner
            .replace(category, name, value, tags)
            .await
            .map_err(|err| write_error(format!("{category} record with id '{name}'"), err))
    }

    /// Fails with [`StoreError::NotFound`] if the entry is absent.
    pub async fn remove(&mut self, category: &str, name: &str) -> StoreResult<()> {
        self.inner
            .remove(category, name)
            .await
            .map_err(|err| write_error(format!("{category} record with id '{name}'"), err))
    }

    pub async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        for_update: bool,
    ) -> StoreResult<Option<Entry>> {
        let result = self.inner.fetch(category, name, for_update).await;
        absent_on_null_pointer(result, category)
    }

    pub async fn fetch_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
        offset: Option<usize>,
        limit: Option<usize>,
        for_update: bool,
    ) -> StoreResult<Vec<Entry>> {
        let result = self
            .inner
            .fetch_all(category, filter, offset, limit, for_update)
            .await;
        empty_on_null_pointer(result, category)
    }

    pub async fn count(&mut self, category: &str, filter: Option<&TagFilter>) -> StoreResult<usize> {
        self.inner
            .count(category, filter)
            .await
            .map_err(|err| StoreError::other(format!("error counting {category}"), Some(err)))
    }

    pub async fn remove_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
    ) -> StoreResult<usize> {
        self.inner
            .remove_all(category, filter)
            .await
            .map_err(|err| StoreError::other(format!("error removing {category} records"), Some(err)))
    }

    /// Fails with [`StoreError::Duplicate`] if a key with that name exists.
    pub async fn insert_key(&mut self, key: &KeyEntry) -> StoreResult<()> {
        self.inner
            .insert_key(key)
            .await
            .map_err(|err| write_error(format!("key '{}'", key.name), err))
    }

    pub async fn fetch_key(&mut self, name: &str, for_update: bool) -> StoreResult<Option<KeyEntry>> {
        let result = self.inner.fetch_key(name, for_update).await;
        absent_on_null_pointer(result, "key")
    }

    /// Fails with [`StoreError::NotFound`] if the key is absent.
    pub async fn remove_key(&mut self, name: &str) -> StoreResult<()> {
        self.inner
            .remove_key(name)
            .await
            .map_err(|err| write_error(format!("key '{name}'"), err))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.inner
            .commit()
            .await
            .map_err(|err| StoreError::other("error committing transaction", Some(err)))
    }

    async fn rollback(&mut self) -> BackendResult<()> {
        self.inner.rollback().await
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.inner.close().await
    }
}

/// Open a session, creating the profile once if it does not exist yet.
async fn open_session(
    store: &Arc<dyn BackendStore>,
    profile: Option<String>,
    transactional: bool,
) -> StoreResult<ScopedSession> {
    let err = match store.session(profile.as_deref(), transactional).await {
        Ok(session) => return Ok(ScopedSession::new(session, profile)),
        Err(err) => err,
    };

    let Some(name) = profile.filter(|_| err.is(BackendErrorCode::NotFound)) else {
        return Err(StoreError::other("error opening session", Some(err)));
    };

    match store.create_profile(&name).await {
        Ok(_) => {
            info!(profile = %name, "created missing profile");
            // Own session, so a failing body cannot roll the marker back.
            storage::bootstrap_store(store.as_ref(), Some(&name))
                .await
                .map_err(|err| {
                    StoreError::other(
                        format!("error writing storage version to profile '{name}'"),
                        Some(err),
                    )
                })?;
        }
        // Lost a race with another creator, which also writes the marker.
        Err(err) if err.is(BackendErrorCode::Duplicate) => {}
        Err(err) => {
            return Err(StoreError::other(
                format!("error creating profile '{name}'"),
                Some(err),
            ));
        }
    }

    let session = store
        .session(Some(&name), transactional)
        .await
        .map_err(|err| StoreError::other(format!("error opening profile '{name}'"), Some(err)))?;

    Ok(ScopedSession::new(session, Some(name)))
}

impl StoreManager {
    /// Run `body` in a session (or a transaction when `transactional`)
    /// on the store and profile of `context`.
    ///
    /// A transaction is committed when `body` succeeds and rolled back when
    /// it fails. The session is closed on every path. Rollback and close
    /// failures are logged and never replace the error being returned.
    ///
    /// ```no_run
    /// # use strongroom_store::{StoreContext, StoreManager, StoreResult};
    /// # async fn demo(manager: &StoreManager) -> StoreResult<usize> {
    /// manager
    ///     .with_session(&StoreContext::root(), |session| {
    ///         Box::pin(async move { session.count("Note", None).await })
    ///     })
    ///     .await
    /// # }
    /// ```
    #[instrument(skip(self, body, context), fields(context = %context))]
    pub async fn run_scoped<T, F>(
        &self,
        context: &StoreContext,
        transactional: bool,
        body: F,
    ) -> StoreResult<T>
    where
        F: for<'s> FnOnce(&'s mut ScopedSession) -> BoxFuture<'s, StoreResult<T>> + Send,
        T: Send + 'static,
    {
        let store = self.get_or_provision(context).await?;
        let mut session = open_session(&store, self.profile_of(context), transactional).await?;
        debug!(profile = ?session.profile(), transactional, "session opened");

        let result = match body(&mut session).await {
            Ok(value) if transactional && session.is_open() => {
                session.commit().await.map(|()| value)
            }
            other => other,
        };

        if let Err(err) = &result {
            if transactional && session.is_open() {
                error!(%err, "error during transaction, rolling back");
                if let Err(rollback_err) = session.rollback().await {
                    warn!(err = %rollback_err, "rollback failed");
                }
            }
        }

        if session.is_open() {
            if let Err(close_err) = session.close().await {
                warn!(err = %close_err, "failed to close session");
            }
        }

        result
    }

    /// [`run_scoped`](Self::run_scoped) without a transaction.
    pub async fn with_session<T, F>(&self, context: &StoreContext, body: F) -> StoreResult<T>
    where
        F: for<'s> FnOnce(&'s mut ScopedSession) -> BoxFuture<'s, StoreResult<T>> + Send,
        T: Send + 'static,
    {
        self.run_scoped(context, false, body).await
    }

    /// [`run_scoped`](Self::run_scoped) inside a transaction.
    pub async fn with_transaction<T, F>(&self, context: &StoreContext, body: F) -> StoreResult<T>
    where
        F: for<'s> FnOnce(&'s mut ScopedSession) -> BoxFuture<'s, StoreResult<T>> + Send,
        T: Send + 'static,
    {
        self.run_scoped(context, true, body).await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::backend::{KdfMethod, SqliteBackend, crypto};
    use crate::config::{MultiWalletDatabaseScheme, StoreConfig, StoreModuleConfig};
    use crate::fs::TokioFileSystem;
    use crate::storage::{STORAGE_VERSION_RECORD_ID, StorageRecord, StorageVersionRecord};

    fn manager(dir: &Path, scheme: MultiWalletDatabaseScheme) -> StoreManager {
        let store = StoreConfig::new("agent", crypto::generate_raw_key().unwrap())
            .with_key_derivation_method(KdfMethod::Raw);
        StoreManager::new(
            Arc::new(SqliteBackend::new()),
            Arc::new(TokioFileSystem::new(dir)),
            StoreModuleConfig::new(store).with_scheme(scheme),
        )
    }

    fn backend_error(code: BackendErrorCode, message: &str) -> BackendError {
        BackendError::new(code, message)
    }

    #[test]
    fn null_pointer_quirk_reads_as_absent() {
        let quirk = || {
            backend_error(
                BackendErrorCode::Backend,
                "Received null pointer. The native library could not find the value.",
            )
        };
        assert!(matches!(absent_on_null_pointer::<u8>(Err(quirk()), "x"), Ok(None)));
        assert!(empty_on_null_pointer::<u8>(Err(quirk()), "x").unwrap().is_empty());

        let real = backend_error(BackendErrorCode::Backend, "disk I/O error");
        assert!(absent_on_null_pointer::<u8>(Err(real.clone()), "x").is_err());
        assert!(empty_on_null_pointer::<u8>(Err(real), "x").is_err());
    }

    #[test]
    fn write_errors_map_to_kinds() {
        let dup = write_error("r".into(), backend_error(BackendErrorCode::Duplicate, ""));
        assert!(dup.is_duplicate());
        let missing = write_error("r".into(), backend_error(BackendErrorCode::NotFound, ""));
        assert!(missing.is_not_found());
        let other = write_error("r".into(), backend_error(BackendErrorCode::Busy, ""));
        assert!(matches!(other, StoreError::Other { .. }));
    }

    #[tokio::test]
    async fn failing_body_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
        let root = StoreContext::root();

        let result: StoreResult<()> = manager
            .with_transaction(&root, |session| {
                Box::pin(async move {
                    session.insert("Note", "n1", b"{}", &RawTags::new()).await?;
                    Err(StoreError::other("abort", None))
                })
            })
            .await;
        assert!(result.is_err());

        let found = manager
            .with_session(&root, |session| {
                Box::pin(async move { session.fetch("Note", "n1", false).await })
            })
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn successful_body_commits() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
        let root = StoreContext::root();

        manager
            .with_transaction(&root, |session| {
                Box::pin(async move { session.insert("Note", "n1", b"{}", &RawTags::new()).await })
            })
            .await
            .unwrap();

        let count = manager
            .with_session(&root, |session| {
                Box::pin(async move { session.count("Note", None).await })
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn missing_tenant_profile_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet);
        let tenant = StoreContext::tenant("t1");

        for _ in 0..2 {
            let profile = manager
                .with_session(&tenant, |session| {
                    Box::pin(async move { Ok(session.profile().map(str::to_string)) })
                })
                .await
                .unwrap();
            assert_eq!(profile.as_deref(), Some("wallet-t1"));
        }

        let profiles = manager.list_profiles(&StoreContext::root()).await.unwrap();
        assert_eq!(
            profiles.iter().filter(|p| p.as_str() == "wallet-t1").count(),
            1
        );
    }

    async fn has_version_marker(manager: &StoreManager, context: &StoreContext) -> bool {
        manager
            .with_session(context, |session| {
                Box::pin(async move {
                    session
                        .fetch(StorageVersionRecord::TYPE, STORAGE_VERSION_RECORD_ID, false)
                        .await
                })
            })
            .await
            .unwrap()
            .is_some()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_sessions_share_one_profile() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet));
        manager.provision(&StoreContext::root()).await.unwrap();

        for round in 0..10 {
            let tenant = StoreContext::tenant(format!("t{round}"));
            let mut handles = Vec::new();
            for _ in 0..4 {
                let manager = Arc::clone(&manager);
                let tenant = tenant.clone();
                handles.push(tokio::spawn(async move {
                    manager
                        .with_session(&tenant, |session| {
                            Box::pin(async move { session.count("Note", None).await })
                        })
                        .await
                }));
            }
            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap(), 0, "round {round}");
            }
            assert!(has_version_marker(&manager, &tenant).await);
        }
    }

    #[tokio::test]
    async fn failed_first_transaction_keeps_profile_marker() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet);
        let tenant = StoreContext::tenant("t1");

        let result: StoreResult<()> = manager
            .with_transaction(&tenant, |session| {
                Box::pin(async move {
                    session.insert("Note", "n1", b"{}", &RawTags::new()).await?;
                    Err(StoreError::other("abort", None))
                })
            })
            .await;
        assert!(result.is_err());

        assert!(has_version_marker(&manager, &tenant).await);
        let count = manager
            .with_session(&tenant, |session| {
                Box::pin(async move { session.count("Note", None).await })
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
