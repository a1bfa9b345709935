//! Store lifecycle manager.
//!
//! Resolves which physical store and profile a [`StoreContext`] maps to
//! under the configured [`MultiWalletDatabaseScheme`], and drives the store
//! through provision / open / close / delete / rekey / export / import.
//!
//! Open handles live in a registry keyed by the *owning* context: the
//! context itself under database-per-wallet, the root context under
//! profile-per-wallet (where every tenant shares the root store and is told
//! apart only by profile).
//!
//! Whole-store operations are restricted to store-level contexts. A tenant
//! that shares the root store can never close, delete, rekey, export or
//! import it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::{
    Backend, BackendError, BackendErrorCode, BackendStore, KdfMethod, StoreOptions,
};
use crate::config::{
    DatabaseConfig, MultiWalletDatabaseScheme, ResolvedUri, StoreConfig, StoreModuleConfig,
    is_sqlite_in_memory_uri, uri_from_store_config,
};
use crate::context::{ROOT_CONTEXT_ID, StoreContext, TenantStoreConfigProvider};
use crate::error::{StoreError, StoreResult};
use crate::fs::FileSystem;
use crate::registry::StoreRegistry;
use crate::storage;

/// Everything needed to address the store of one context.
#[derive(Debug)]
struct ResolvedStore {
    config: StoreConfig,
    uri: String,
    path: Option<PathBuf>,
    /// Registry key.
    owner: String,
}

impl ResolvedStore {
    fn options(&self) -> StoreOptions {
        StoreOptions {
            uri: self.uri.clone(),
            key_method: self.config.kdf_method(),
            pass_key: self.config.key.clone(),
            profile: None,
        }
    }
}

fn options_for(config: &StoreConfig, uri: &ResolvedUri) -> StoreOptions {
    StoreOptions {
        uri: uri.uri.clone(),
        key_method: config.kdf_method(),
        pass_key: config.key.clone(),
        profile: None,
    }
}

/// Translate a backend failure raised while provisioning.
///
/// The backend reports reused credentials on an existing store as an
/// encryption mismatch, so `Encryption` counts as a duplicate here.
fn provision_error(store_id: &str, err: BackendError) -> StoreError {
    match err.code {
        BackendErrorCode::Duplicate | BackendErrorCode::Encryption => {
            StoreError::duplicate(format!("store '{store_id}'"), Some(err))
        }
        _ => StoreError::other(format!("error provisioning store '{store_id}'"), Some(err)),
    }
}

/// Translate a backend failure raised while opening.
///
/// An in-memory store that was never provisioned surfaces as a generic
/// `Backend` error, which is reported as not found.
fn open_error(store_id: &str, uri: &str, err: BackendError) -> StoreError {
    match err.code {
        BackendErrorCode::NotFound => StoreError::not_found(format!("store '{store_id}'"), Some(err)),
        BackendErrorCode::Backend if is_sqlite_in_memory_uri(uri) => {
            StoreError::not_found(format!("store '{store_id}'"), Some(err))
        }
        BackendErrorCode::Encryption => StoreError::InvalidKey {
            store_id: store_id.to_string(),
            source: err,
        },
        _ => StoreError::other(format!("error opening store '{store_id}'"), Some(err)),
    }
}

/// Owns the lifecycle of every store the process opens.
pub struct StoreManager {
    backend: Arc<dyn Backend>,
    file_system: Arc<dyn FileSystem>,
    config: StoreModuleConfig,
    tenant_configs: Option<Arc<dyn TenantStoreConfigProvider>>,
    registry: StoreRegistry,
}

impl StoreManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        file_system: Arc<dyn FileSystem>,
        config: StoreModuleConfig,
    ) -> Self {
        Self {
            backend,
            file_system,
            config,
            tenant_configs: None,
            registry: StoreRegistry::new(),
        }
    }

    /// Enable database-per-wallet tenants by supplying their store keys.
    pub fn with_tenant_config_provider(
        mut self,
        provider: Arc<dyn TenantStoreConfigProvider>,
    ) -> Self {
        self.tenant_configs = Some(provider);
        self
    }

    pub fn scheme(&self) -> MultiWalletDatabaseScheme {
        self.config.multi_wallet_database_scheme
    }

    pub fn config(&self) -> &StoreModuleConfig {
        &self.config
    }

    // ── resolution ───────────────────────────────────────────────────

    /// `true` when `context` owns a whole store rather than a profile.
    pub fn is_store_level(&self, context: &StoreContext) -> bool {
        context.is_root() || self.scheme() == MultiWalletDatabaseScheme::DatabasePerWallet
    }

    /// Fail with [`StoreError::Scope`] unless `context` is store level.
    pub fn ensure_store_level(
        &self,
        context: &StoreContext,
        operation: &'static str,
    ) -> StoreResult<()> {
        if self.is_store_level(context) {
            Ok(())
        } else {
            Err(StoreError::Scope {
                operation,
                context_id: context.id().to_string(),
            })
        }
    }

    /// Registry key of the store `context` uses.
    fn owner_of(&self, context: &StoreContext) -> String {
        if self.is_store_level(context) {
            context.id().to_string()
        } else {
            ROOT_CONTEXT_ID.to_string()
        }
    }

    /// Profile `context` works in; `None` selects the store default.
    pub(crate) fn profile_of(&self, context: &StoreContext) -> Option<String> {
        (!self.is_store_level(context)).then(|| context.tenant_wallet_name())
    }

    async fn store_config(&self, context: &StoreContext) -> StoreResult<StoreConfig> {
        if !context.is_root() && self.scheme() == MultiWalletDatabaseScheme::DatabasePerWallet {
            let provider = self.tenant_configs.as_ref().ok_or_else(|| {
                StoreError::other(
                    format!(
                        "context '{context}' needs its own store but no tenant store config provider is set"
                    ),
                    None,
                )
            })?;
            let key = provider.tenant_store_key(context).await?;

            // Tenants share the database settings but never an explicit
            // file, which would point every tenant at the root store.
            let database = self.config.store.database.clone().map(|database| match database {
                DatabaseConfig::Sqlite { config } => DatabaseConfig::Sqlite {
                    config: config.map(|mut c| {
                        c.path = None;
                        c
                    }),
                },
                postgres => postgres,
            });

            return Ok(StoreConfig {
                id: context.tenant_wallet_name(),
                key,
                key_derivation_method: Some(KdfMethod::Raw),
                database,
            });
        }

        Ok(self.config.store.clone())
    }

    async fn resolve(&self, context: &StoreContext) -> StoreResult<ResolvedStore> {
        let config = self.store_config(context).await?;
        let ResolvedUri { uri, path } =
            uri_from_store_config(&config, self.file_system.data_path())?;
        Ok(ResolvedStore {
            config,
            uri,
            path,
            owner: self.owner_of(context),
        })
    }

    fn open_store(&self, context: &StoreContext) -> StoreResult<Arc<dyn BackendStore>> {
        self.registry.get(&self.owner_of(context)).ok_or_else(|| {
            StoreError::other(format!("no open store for context '{context}'"), None)
        })
    }

    /// Remove a store that failed half way through being written.
    async fn discard(&self, uri: &str, created_dir: Option<&Path>) {
        if let Err(err) = self.backend.remove(uri).await {
            warn!(uri = %uri, %err, "failed to remove partially written store");
        }
        if let Some(dir) = created_dir {
            if let Err(err) = self.file_system.delete(dir).await {
                warn!(dir = %dir.display(), %err, "failed to remove store directory");
            }
        }
    }

    /// Create the parent directory of `path`, returning it if it was new.
    async fn prepare_directory(&self, path: &Path) -> StoreResult<Option<PathBuf>> {
        let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
            return Ok(None);
        };
        if self.file_system.exists(dir).await? {
            return Ok(None);
        }
        self.file_system.create_directory(dir).await?;
        Ok(Some(dir.to_path_buf()))
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// `true` if the store used by `context` is open.
    pub fn is_store_open(&self, context: &StoreContext) -> bool {
        self.registry.is_open(&self.owner_of(context))
    }

    /// Create the store for `context`, open it and write the storage
    /// version marker.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn provision(&self, context: &StoreContext) -> StoreResult<Arc<dyn BackendStore>> {
        let resolved = self.resolve(context).await?;
        let store_id = resolved.config.id.clone();
        let transition = self.registry.claim(&resolved.owner)?;
        if transition.previous().is_some() {
            return Err(StoreError::other(
                format!("store '{store_id}' is already provisioned, close it first"),
                None,
            ));
        }

        let mut created_dir = None;
        if let Some(path) = &resolved.path {
            if self.file_system.exists(path).await? {
                return Err(StoreError::duplicate(format!("store '{store_id}'"), None));
            }
            created_dir = self.prepare_directory(path).await?;
        }

        let store = match self.backend.provision(&resolved.options(), false).await {
            Ok(store) => store,
            Err(err) => {
                if !err.is(BackendErrorCode::Duplicate) && !err.is(BackendErrorCode::Encryption) {
                    self.discard(&resolved.uri, created_dir.as_deref()).await;
                }
                return Err(provision_error(&store_id, err));
            }
        };

        if let Err(err) = storage::bootstrap_store(store.as_ref(), None).await {
            if let Err(close_err) = store.close().await {
                warn!(store_id = %store_id, err = %close_err, "failed to close store after bootstrap failure");
            }
            self.discard(&resolved.uri, created_dir.as_deref()).await;
            return Err(StoreError::other(
                format!("error writing storage version to store '{store_id}'"),
                Some(err),
            ));
        }

        transition.open(Arc::clone(&store));
        info!(store_id = %store_id, "store provisioned");
        Ok(store)
    }

    /// Open the existing store for `context`.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn open(&self, context: &StoreContext) -> StoreResult<Arc<dyn BackendStore>> {
        let resolved = self.resolve(context).await?;
        let store_id = resolved.config.id.clone();
        let transition = self.registry.claim(&resolved.owner)?;
        if transition.previous().is_some() {
            return Err(StoreError::other(
                format!("store '{store_id}' is already opened, close it first"),
                None,
            ));
        }

        let store = self
            .backend
            .open(&resolved.options())
            .await
            .map_err(|err| open_error(&store_id, &resolved.uri, err))?;

        transition.open(Arc::clone(&store));
        info!(store_id = %store_id, "store opened");
        Ok(store)
    }

    /// The open store for `context`, opening or provisioning it on demand.
    ///
    /// Concurrent callers wait for one another; only the first one opens.
    pub async fn get_or_provision(
        &self,
        context: &StoreContext,
    ) -> StoreResult<Arc<dyn BackendStore>> {
        let owner = self.owner_of(context);
        if let Some(store) = self.registry.get(&owner) {
            return Ok(store);
        }

        let lock = self.registry.first_use_lock(&owner);
        let _first_use = lock.lock().await;
        // Another caller may have finished opening while we waited.
        if let Some(store) = self.registry.get(&owner) {
            return Ok(store);
        }

        match self.open(context).await {
            Ok(store) => Ok(store),
            Err(err) if err.is_not_found() => {
                debug!(context = %context, "store not found, provisioning");
                self.provision(context).await
            }
            Err(err) => Err(err),
        }
    }

    /// Re-encrypt the open store under `new_key`. Without `method` the
    /// configured key derivation method is kept.
    #[instrument(skip(self, new_key, context), fields(context = %context))]
    pub async fn rotate_key(
        &self,
        context: &StoreContext,
        new_key: &str,
        method: Option<KdfMethod>,
    ) -> StoreResult<()> {
        self.ensure_store_level(context, "rotate_key")?;
        let store = self.open_store(context)?;
        let method = match method {
            Some(method) => method,
            None => self.store_config(context).await?.kdf_method(),
        };

        store
            .rekey(method, new_key)
            .await
            .map_err(|err| StoreError::other("error rotating store key", Some(err)))?;
        info!(method = %method, "store key rotated");
        Ok(())
    }

    /// Copy the open store into a new store described by `destination`.
    #[instrument(skip(self, destination, context), fields(context = %context, destination = %destination.id))]
    pub async fn export_store(
        &self,
        context: &StoreContext,
        destination: &StoreConfig,
    ) -> StoreResult<()> {
        self.ensure_store_level(context, "export_store")?;
        let store = self.open_store(context)?;

        let target = uri_from_store_config(destination, self.file_system.data_path())?;
        let mut created_dir = None;
        if let Some(path) = &target.path {
            if self.file_system.exists(path).await? {
                return Err(StoreError::ExportPathExists { path: path.clone() });
            }
            created_dir = self.prepare_directory(path).await?;
        }

        if let Err(err) = store
            .copy_to(&options_for(destination, &target), false)
            .await
        {
            self.discard(&target.uri, created_dir.as_deref()).await;
            return Err(StoreError::other(
                format!("error exporting store to '{}'", destination.id),
                Some(err),
            ));
        }

        info!("store exported");
        Ok(())
    }

    /// Replace the (closed, absent) store of `context` with a copy of the
    /// store described by `source`.
    #[instrument(skip(self, source, context), fields(context = %context, source = %source.id))]
    pub async fn import_store(&self, context: &StoreContext, source: &StoreConfig) -> StoreResult<()> {
        self.ensure_store_level(context, "import_store")?;
        let resolved = self.resolve(context).await?;
        let transition = self.registry.claim(&resolved.owner)?;
        if transition.previous().is_some() {
            return Err(StoreError::other(
                format!(
                    "store '{}' must be closed before importing into it",
                    resolved.config.id
                ),
                None,
            ));
        }

        let mut created_dir = None;
        if let Some(path) = &resolved.path {
            if self.file_system.exists(path).await? {
                return Err(StoreError::ImportPathExists { path: path.clone() });
            }
            created_dir = self.prepare_directory(path).await?;
        }

        let source_uri = uri_from_store_config(source, self.file_system.data_path())?;
        let source_store = match self.backend.open(&options_for(source, &source_uri)).await {
            Ok(store) => store,
            Err(err) => {
                self.discard(&resolved.uri, created_dir.as_deref()).await;
                return Err(open_error(&source.id, &source_uri.uri, err));
            }
        };

        let copied = source_store.copy_to(&resolved.options(), false).await;
        if let Err(err) = source_store.close().await {
            warn!(source = %source.id, %err, "failed to close import source store");
        }

        if let Err(err) = copied {
            self.discard(&resolved.uri, created_dir.as_deref()).await;
            return Err(StoreError::other(
                format!("error importing store '{}'", source.id),
                Some(err),
            ));
        }

        transition.clear();
        info!(store_id = %resolved.config.id, "store imported");
        Ok(())
    }

    /// Close the store if open, then remove it.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn delete_store(&self, context: &StoreContext) -> StoreResult<()> {
        self.ensure_store_level(context, "delete_store")?;
        let resolved = self.resolve(context).await?;
        let transition = self.registry.claim(&resolved.owner)?;

        if let Some(store) = transition.previous() {
            store.close().await.map_err(|err| {
                StoreError::other(format!("error closing store '{}'", resolved.config.id), Some(err))
            })?;
        }

        // The handle is closed from here on; never restore it.
        transition.clear();

        let removed = self.backend.remove(&resolved.uri).await.map_err(|err| {
            StoreError::other(format!("error removing store '{}'", resolved.config.id), Some(err))
        })?;
        info!(store_id = %resolved.config.id, removed, "store deleted");
        Ok(())
    }

    /// Close the open store of `context`.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn close_store(&self, context: &StoreContext) -> StoreResult<()> {
        self.ensure_store_level(context, "close_store")?;
        let owner = self.owner_of(context);
        let transition = self.registry.claim(&owner)?;
        let Some(store) = transition.previous() else {
            return Err(StoreError::other(
                format!("no open store for context '{context}'"),
                None,
            ));
        };

        store.close().await.map_err(|err| {
            StoreError::other(format!("error closing store of context '{context}'"), Some(err))
        })?;
        transition.clear();
        info!("store closed");
        Ok(())
    }

    /// Delete everything `context` owns: the whole store for store-level
    /// contexts, only the tenant profile otherwise.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn delete_context(&self, context: &StoreContext) -> StoreResult<()> {
        if self.is_store_level(context) {
            return self.delete_store(context).await;
        }

        let store = self.get_or_provision(context).await?;
        let profile = context.tenant_wallet_name();
        let removed = store.remove_profile(&profile).await.map_err(|err| {
            StoreError::other(format!("error removing profile '{profile}'"), Some(err))
        })?;
        info!(profile = %profile, removed, "tenant profile deleted");
        Ok(())
    }

    /// Close what `context` owns. Tenants sharing the root store own
    /// nothing to close.
    pub async fn close_context(&self, context: &StoreContext) -> StoreResult<()> {
        if self.is_store_level(context) {
            self.close_store(context).await
        } else {
            debug!(context = %context, "tenant profile needs no close");
            Ok(())
        }
    }

    /// Profiles of the open store of `context`.
    pub async fn list_profiles(&self, context: &StoreContext) -> StoreResult<Vec<String>> {
        self.ensure_store_level(context, "list_profiles")?;
        self.open_store(context)?
            .list_profiles()
            .await
            .map_err(|err| StoreError::other("error listing profiles", Some(err)))
    }
}

// ── tests ────────────────────────────────────────────────────────────
