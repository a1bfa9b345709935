//! SQLite implementation of the backend capability interface.
//!
//! Each open store wraps one `rusqlite::Connection` behind an
//! `Arc<tokio::sync::Mutex<_>>`. A session takes the lock for its whole
//! lifetime, and every statement is dispatched onto the blocking pool with
//! `tokio::task::spawn_blocking` so the async runtime is never blocked.
//!
//! Entry values, tags and key material are sealed with AES-256-GCM under
//! the store key (see [`super::crypto`]). Tags are evaluated against
//! [`TagFilter`]s after decryption, so category scans are linear in the
//! size of the category.
//!
//! Supported URIs are `sqlite://:memory:` and `sqlite://<path>`; anything
//! else is reported as `Unsupported`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, params};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::crypto::{self, SALT_LEN, StoreKey};
use super::migration;
use super::{
    Backend, BackendError, BackendErrorCode, BackendResult, BackendSession, BackendStore, Entry,
    KdfMethod, KeyEntry, StoreOptions,
};
use crate::codec::RawTags;
use crate::query::TagFilter;

/// `items.kind` for records.
const ITEM_KIND: i64 = 1;
/// `items.kind` for key objects.
const KEY_KIND: i64 = 2;
/// Key objects all live in one category.
const KEY_CATEGORY: &str = "";
/// Plaintext sealed into the config table to detect a wrong store key.
const KEY_CHECK_MARKER: &[u8] = b"strongroom-store-key-check";

const CONFIG_DEFAULT_PROFILE: &str = "default_profile";
const CONFIG_KEY_METHOD: &str = "key_method";
const CONFIG_SALT: &str = "salt";
const CONFIG_KEY_CHECK: &str = "key_check";

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                BackendErrorCode::Duplicate
            }
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                BackendErrorCode::Busy
            }
            _ => BackendErrorCode::Backend,
        };
        BackendError::new(code, err.to_string())
    }
}

fn unexpected(message: impl Into<String>) -> BackendError {
    BackendError::new(BackendErrorCode::Unexpected, message)
}

fn store_closed() -> BackendError {
    BackendError::new(BackendErrorCode::Input, "store is closed")
}

fn session_closed() -> BackendError {
    BackendError::new(BackendErrorCode::Input, "session is closed")
}

// ═══════════════════════════════════════════════════════════════════════
//  URIs and files
// ═══════════════════════════════════════════════════════════════════════

/// Physical location of a SQLite store.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Memory,
    File(PathBuf),
}

fn parse_uri(uri: &str) -> BackendResult<Location> {
    let (scheme, rest) = uri.split_once("://").ok_or_else(|| {
        BackendError::new(BackendErrorCode::Input, format!("invalid store uri '{uri}'"))
    })?;

    if scheme != "sqlite" {
        return Err(BackendError::new(
            BackendErrorCode::Unsupported,
            format!("unsupported store scheme '{scheme}'"),
        ));
    }

    let path = rest.split_once('?').map_or(rest, |(path, _)| path);
    match path {
        ":memory:" => Ok(Location::Memory),
        "" => Err(BackendError::new(
            BackendErrorCode::Input,
            format!("store uri '{uri}' has no path"),
        )),
        path => Ok(Location::File(PathBuf::from(path))),
    }
}

/// The database file plus its WAL side files.
fn store_files(path: &Path) -> [PathBuf; 3] {
    let with_suffix = |suffix: &str| {
        let mut os = path.as_os_str().to_owned();
        os.push(suffix);
        PathBuf::from(os)
    };
    [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}

fn remove_store_files(path: &Path) -> BackendResult<bool> {
    let mut removed = false;
    for file in store_files(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BackendError::new(
                    BackendErrorCode::Backend,
                    format!("failed to remove '{}': {e}", file.display()),
                ));
            }
        }
    }
    Ok(removed)
}

/// Apply the connection pragmas used for every store.
fn apply_pragmas(conn: &Connection) -> BackendResult<()> {
    // WAL mode: concurrent readers, non-blocking writes. In-memory stores
    // report "memory" and ignore it.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    // Profile removal cascades to its items.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Connection state
// ═══════════════════════════════════════════════════════════════════════

/// Everything a session needs, guarded by the store mutex.
struct Inner {
    conn: Connection,
    key: StoreKey,
    default_profile: String,
}

type Guard = OwnedMutexGuard<Option<Inner>>;

/// Run `f` against the locked connection on the blocking pool.
///
/// The guard is handed back alongside the result so a session keeps its
/// lock across failed statements. It is only lost if the task panics.
async fn run_blocking<T, F>(guard: Guard, f: F) -> (Option<Guard>, BackendResult<T>)
where
    F: FnOnce(&mut Inner) -> BackendResult<T> + Send + 'static,
    T: Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        let result = match guard.as_mut() {
            Some(inner) => f(inner),
            None => Err(store_closed()),
        };
        (guard, result)
    })
    .await;

    match joined {
        Ok((guard, result)) => (Some(guard), result),
        Err(e) => (None, Err(unexpected(format!("blocking task failed: {e}")))),
    }
}

async fn spawn<T, F>(f: F) -> BackendResult<T>
where
    F: FnOnce() -> BackendResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| unexpected(format!("blocking task failed: {e}")))?
}

fn read_config(conn: &Connection, name: &str) -> BackendResult<Vec<u8>> {
    conn.query_row(
        "SELECT value FROM config WHERE name = ?1",
        params![name],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()?
    .ok_or_else(|| {
        BackendError::new(
            BackendErrorCode::Backend,
            format!("store is not initialized, missing config '{name}'"),
        )
    })
}

fn write_config(conn: &Connection, name: &str, value: &[u8]) -> BackendResult<()> {
    conn.execute(
        "INSERT INTO config (name, value) VALUES (?1, ?2) \
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

/// Write fresh key material and the key check marker.
fn write_key_config(
    conn: &Connection,
    method: KdfMethod,
    pass_key: &str,
) -> BackendResult<StoreKey> {
    let salt = crypto::random_bytes(SALT_LEN)?;
    let key = crypto::derive_store_key(method, pass_key, &salt)?;
    write_config(conn, CONFIG_KEY_METHOD, method.as_str().as_bytes())?;
    write_config(conn, CONFIG_SALT, &salt)?;
    write_config(conn, CONFIG_KEY_CHECK, &crypto::seal(&key, KEY_CHECK_MARKER)?)?;
    Ok(key)
}

fn generated_profile_name() -> BackendResult<String> {
    let suffix: String = crypto::random_bytes(8)?
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    Ok(format!("profile-{suffix}"))
}

/// Create the connection for a new store.
fn create_connection(location: &Location, recreate: bool) -> BackendResult<Connection> {
    match location {
        Location::Memory => Ok(Connection::open_in_memory()?),
        Location::File(path) => {
            if path.exists() {
                if !recreate {
                    return Err(BackendError::new(
                        BackendErrorCode::Duplicate,
                        format!("store at '{}' already exists", path.display()),
                    ));
                }
                remove_store_files(path)?;
            }
            Ok(Connection::open(path)?)
        }
    }
}

/// Lay down schema, key material and the default profile.
fn initialize(
    conn: Connection,
    method: KdfMethod,
    pass_key: &str,
    default_profile: String,
) -> BackendResult<Inner> {
    apply_pragmas(&conn)?;
    migration::run_all(&conn)?;

    let key = write_key_config(&conn, method, pass_key)?;
    write_config(&conn, CONFIG_DEFAULT_PROFILE, default_profile.as_bytes())?;
    conn.execute(
        "INSERT INTO profiles (name) VALUES (?1)",
        params![default_profile],
    )?;

    Ok(Inner {
        conn,
        key,
        default_profile,
    })
}

fn open_existing(location: &Location, options: &StoreOptions) -> BackendResult<Inner> {
    let conn = match location {
        Location::Memory => Connection::open_in_memory()?,
        Location::File(path) => {
            if !path.exists() {
                return Err(BackendError::new(
                    BackendErrorCode::NotFound,
                    format!("store at '{}' not found", path.display()),
                ));
            }
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        }
    };
    apply_pragmas(&conn)?;
    migration::run_all(&conn)?;

    let salt = read_config(&conn, CONFIG_SALT)?;
    let key = crypto::derive_store_key(options.key_method, &options.pass_key, &salt)?;
    let check = read_config(&conn, CONFIG_KEY_CHECK)?;
    crypto::open(&key, &check)
        .map_err(|_| BackendError::new(BackendErrorCode::Encryption, "invalid store key"))?;

    let default_profile = match &options.profile {
        Some(profile) => {
            profile_id(&conn, profile)?.ok_or_else(|| profile_not_found(profile))?;
            profile.clone()
        }
        None => String::from_utf8(read_config(&conn, CONFIG_DEFAULT_PROFILE)?)
            .map_err(|e| unexpected(format!("default profile is not utf-8: {e}")))?,
    };

    Ok(Inner {
        conn,
        key,
        default_profile,
    })
}

fn profile_not_found(name: &str) -> BackendError {
    BackendError::new(
        BackendErrorCode::NotFound,
        format!("profile '{name}' not found"),
    )
}

fn profile_id(conn: &Connection, name: &str) -> BackendResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM profiles WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?)
}

fn seal_tags(key: &StoreKey, tags: &RawTags) -> BackendResult<Vec<u8>> {
    let json = serde_json::to_vec(tags).map_err(|e| unexpected(format!("tags: {e}")))?;
    crypto::seal(key, &json)
}

fn open_tags(key: &StoreKey, sealed: &[u8]) -> BackendResult<RawTags> {
    serde_json::from_slice(&crypto::open(key, sealed)?)
        .map_err(|e| unexpected(format!("stored tags are corrupted: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════
//  Backend
// ═══════════════════════════════════════════════════════════════════════

/// Backend storing encrypted entries in SQLite.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

impl SqliteBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn provision(
        &self,
        options: &StoreOptions,
        recreate: bool,
    ) -> BackendResult<Arc<dyn BackendStore>> {
        let location = parse_uri(&options.uri)?;
        let uri = options.uri.clone();
        let method = options.key_method;
        let pass_key = options.pass_key.clone();
        let profile = options.profile.clone();

        let inner = spawn(move || {
            let conn = create_connection(&location, recreate)?;
            let default_profile = match profile {
                Some(profile) => profile,
                None => generated_profile_name()?,
            };
            initialize(conn, method, &pass_key, default_profile)
        })
        .await?;

        info!(uri = %uri, profile = %inner.default_profile, "provisioned sqlite store");
        Ok(Arc::new(SqliteStore::new(uri, inner)))
    }

    async fn open(&self, options: &StoreOptions) -> BackendResult<Arc<dyn BackendStore>> {
        let location = parse_uri(&options.uri)?;
        let uri = options.uri.clone();
        let options = options.clone();

        let inner = spawn(move || open_existing(&location, &options)).await?;

        debug!(uri = %uri, "opened sqlite store");
        Ok(Arc::new(SqliteStore::new(uri, inner)))
    }

    async fn remove(&self, uri: &str) -> BackendResult<bool> {
        match parse_uri(uri)? {
            Location::Memory => Ok(false),
            Location::File(path) => spawn(move || remove_store_files(&path)).await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Store
// ═══════════════════════════════════════════════════════════════════════

/// An open SQLite store.
pub struct SqliteStore {
    uri: String,
    inner: Arc<Mutex<Option<Inner>>>,
}

impl SqliteStore {
    fn new(uri: String, inner: Inner) -> Self {
        Self {
            uri,
            inner: Arc::new(Mutex::new(Some(inner))),
        }
    }

    async fn locked<T, F>(&self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut Inner) -> BackendResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        run_blocking(guard, f).await.1
    }
}

#[async_trait]
impl BackendStore for SqliteStore {
    async fn session(
        &self,
        profile: Option<&str>,
        transaction: bool,
    ) -> BackendResult<Box<dyn BackendSession>> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        let profile = profile.map(str::to_string);

        let (guard, result) = run_blocking(guard, move |inner| {
            let name = profile.unwrap_or_else(|| inner.default_profile.clone());
            let id = profile_id(&inner.conn, &name)?.ok_or_else(|| profile_not_found(&name))?;
            if transaction {
                inner.conn.execute_batch("BEGIN IMMEDIATE;")?;
            }
            Ok(id)
        })
        .await;

        let profile_id = result?;
        let guard = guard.ok_or_else(|| unexpected("session lock lost"))?;
        Ok(Box::new(SqliteSession {
            guard: Some(guard),
            profile_id,
            transaction,
        }))
    }

    async fn create_profile(&self, name: &str) -> BackendResult<String> {
        let name = name.to_string();
        self.locked(move |inner| {
            inner
                .conn
                .execute("INSERT INTO profiles (name) VALUES (?1)", params![name])?;
            debug!(profile = %name, "created profile");
            Ok(name)
        })
        .await
    }

    async fn list_profiles(&self) -> BackendResult<Vec<String>> {
        self.locked(|inner| {
            let mut stmt = inner.conn.prepare("SELECT name FROM profiles ORDER BY id")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn remove_profile(&self, name: &str) -> BackendResult<bool> {
        let name = name.to_string();
        self.locked(move |inner| {
            let removed = inner
                .conn
                .execute("DELETE FROM profiles WHERE name = ?1", params![name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn default_profile(&self) -> BackendResult<String> {
        self.locked(|inner| Ok(inner.default_profile.clone())).await
    }

    async fn rekey(&self, key_method: KdfMethod, pass_key: &str) -> BackendResult<()> {
        let pass_key = pass_key.to_string();
        self.locked(move |inner| {
            let tx = inner.conn.transaction()?;

            let rows = {
                let mut stmt = tx.prepare("SELECT id, value, tags FROM items")?;
                stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };

            let new_key = write_key_config(&tx, key_method, &pass_key)?;
            for (id, value, tags) in rows {
                let value = crypto::seal(&new_key, &crypto::open(&inner.key, &value)?)?;
                let tags = crypto::seal(&new_key, &crypto::open(&inner.key, &tags)?)?;
                tx.execute(
                    "UPDATE items SET value = ?1, tags = ?2 WHERE id = ?3",
                    params![value, tags, id],
                )?;
            }

            tx.commit()?;
            inner.key = new_key;
            info!(method = %key_method, "store rekeyed");
            Ok(())
        })
        .await
    }

    async fn copy_to(&self, target: &StoreOptions, recreate: bool) -> BackendResult<()> {
        let location = parse_uri(&target.uri)?;
        let target = target.clone();

        self.locked(move |inner| {
            let conn = create_connection(&location, recreate)?;
            let mut dest = initialize(
                conn,
                target.key_method,
                &target.pass_key,
                inner.default_profile.clone(),
            )?;

            let profiles = {
                let mut stmt = inner.conn.prepare("SELECT id, name FROM profiles ORDER BY id")?;
                stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let items = {
                let mut stmt = inner.conn.prepare(
                    "SELECT profile_id, kind, category, name, value, tags FROM items ORDER BY id",
                )?;
                stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?
            };

            let tx = dest.conn.transaction()?;
            let mut profile_ids = std::collections::HashMap::new();
            for (source_id, name) in profiles {
                tx.execute(
                    "INSERT OR IGNORE INTO profiles (name) VALUES (?1)",
                    params![name],
                )?;
                let dest_id = profile_id(&tx, &name)?
                    .ok_or_else(|| unexpected(format!("profile '{name}' missing after copy")))?;
                profile_ids.insert(source_id, dest_id);
            }

            let count = items.len();
            for (source_profile, kind, category, name, value, tags) in items {
                let dest_profile = profile_ids
                    .get(&source_profile)
                    .copied()
                    .ok_or_else(|| unexpected("item references an unknown profile"))?;
                let value = crypto::seal(&dest.key, &crypto::open(&inner.key, &value)?)?;
                let tags = crypto::seal(&dest.key, &crypto::open(&inner.key, &tags)?)?;
                tx.execute(
                    "INSERT INTO items (profile_id, kind, category, name, value, tags) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![dest_profile, kind, category, name, value, tags],
                )?;
            }
            tx.commit()?;

            info!(uri = %target.uri, entries = count, "copied store");
            Ok(())
        })
        .await
    }

    async fn close(&self) -> BackendResult<()> {
        let mut guard = self.inner.lock().await;
        match guard.take() {
            Some(inner) => {
                drop(inner);
                debug!(uri = %self.uri, "closed sqlite store");
                Ok(())
            }
            None => Err(store_closed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// A session holding the store lock until it is closed.
pub struct SqliteSession {
    guard: Option<Guard>,
    profile_id: i64,
    transaction: bool,
}

/// A scanned row: name, sealed value, decrypted tags.
type ScannedRow = (i64, String, Vec<u8>, RawTags);

fn scan(
    inner: &Inner,
    profile_id: i64,
    category: &str,
    filter: Option<&TagFilter>,
) -> BackendResult<Vec<ScannedRow>> {
    let mut stmt = inner.conn.prepare(
        "SELECT id, name, value, tags FROM items \
         WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![profile_id, ITEM_KIND, category], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut matched = Vec::new();
    for (id, name, value, tags) in rows {
        let tags = open_tags(&inner.key, &tags)?;
        if filter.is_none_or(|f| f.matches(&tags)) {
            matched.push((id, name, value, tags));
        }
    }
    Ok(matched)
}

impl SqliteSession {
    async fn call<T, F>(&mut self, f: F) -> BackendResult<T>
    where
        F: FnOnce(&mut Inner, i64) -> BackendResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.guard.take().ok_or_else(session_closed)?;
        let profile_id = self.profile_id;
        let (guard, result) = run_blocking(guard, move |inner| f(inner, profile_id)).await;
        self.guard = guard;
        result
    }

    /// Release the lock, running `sql` first if given.
    async fn finish(&mut self, sql: Option<&'static str>) -> BackendResult<()> {
        let guard = self.guard.take().ok_or_else(session_closed)?;
        let Some(sql) = sql else {
            return Ok(());
        };
        let (_released, result) = run_blocking(guard, move |inner| {
            inner.conn.execute_batch(sql).map_err(|e| {
                // Never hand the connection back with a transaction open.
                let _ = inner.conn.execute_batch("ROLLBACK;");
                BackendError::from(e)
            })
        })
        .await;
        result
    }

    fn require_transaction(&self, action: &str) -> BackendResult<()> {
        if self.transaction {
            Ok(())
        } else {
            Err(BackendError::new(
                BackendErrorCode::Input,
                format!("cannot {action} a session that is not a transaction"),
            ))
        }
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if !self.transaction {
            return;
        }
        if let Some(inner) = self.guard.as_mut().and_then(|guard| guard.as_mut()) {
            warn!("transaction dropped without being closed, rolling back");
            let _ = inner.conn.execute_batch("ROLLBACK;");
        }
    }
}

#[async_trait]
impl BackendSession for SqliteSession {
    fn is_open(&self) -> bool {
        self.guard.is_some()
    }

    fn is_transaction(&self) -> bool {
        self.transaction
    }

    async fn count(&mut self, category: &str, filter: Option<&TagFilter>) -> BackendResult<usize> {
        let category = category.to_string();
        let filter = filter.cloned();
        self.call(move |inner, profile_id| {
            Ok(scan(inner, profile_id, &category, filter.as_ref())?.len())
        })
        .await
    }

    async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        _for_update: bool,
    ) -> BackendResult<Option<Entry>> {
        // The session lock already serializes access, so `for_update`
        // needs no extra locking.
        let category = category.to_string();
        let name = name.to_string();
        self.call(move |inner, profile_id| {
            let row = inner
                .conn
                .query_row(
                    "SELECT value, tags FROM items \
                     WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
                    params![profile_id, ITEM_KIND, category, name],
                    |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )
                .optional()?;

            row.map(|(value, tags)| {
                Ok(Entry {
                    value: crypto::open(&inner.key, &value)?,
                    tags: open_tags(&inner.key, &tags)?,
                    category,
                    name,
                })
            })
            .transpose()
        })
        .await
    }

    async fn fetch_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
        offset: Option<usize>,
        limit: Option<usize>,
        _for_update: bool,
    ) -> BackendResult<Vec<Entry>> {
        let category = category.to_string();
        let filter = filter.cloned();
        self.call(move |inner, profile_id| {
            scan(inner, profile_id, &category, filter.as_ref())?
                .into_iter()
                .skip(offset.unwrap_or(0))
                .take(limit.unwrap_or(usize::MAX))
                .map(|(_, name, value, tags)| {
                    Ok(Entry {
                        category: category.clone(),
                        name,
                        value: crypto::open(&inner.key, &value)?,
                        tags,
                    })
                })
                .collect()
        })
        .await
    }

    async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> BackendResult<()> {
        let category = category.to_string();
        let name = name.to_string();
        let value = value.to_vec();
        let tags = tags.clone();
        self.call(move |inner, profile_id| {
            let value = crypto::seal(&inner.key, &value)?;
            let tags = seal_tags(&inner.key, &tags)?;
            inner.conn.execute(
                "INSERT INTO items (profile_id, kind, category, name, value, tags) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![profile_id, ITEM_KIND, category, name, value, tags],
            )?;
            Ok(())
        })
        .await
    }

    async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: &[u8],
        tags: &RawTags,
    ) -> BackendResult<()> {
        let category = category.to_string();
        let name = name.to_string();
        let value = value.to_vec();
        let tags = tags.clone();
        self.call(move |inner, profile_id| {
            let value = crypto::seal(&inner.key, &value)?;
            let tags = seal_tags(&inner.key, &tags)?;
            let updated = inner.conn.execute(
                "UPDATE items SET value = ?1, tags = ?2 \
                 WHERE profile_id = ?3 AND kind = ?4 AND category = ?5 AND name = ?6",
                params![value, tags, profile_id, ITEM_KIND, category, name],
            )?;
            if updated == 0 {
                return Err(BackendError::new(
                    BackendErrorCode::NotFound,
                    format!("entry '{category}/{name}' not found"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn remove(&mut self, category: &str, name: &str) -> BackendResult<()> {
        let category = category.to_string();
        let name = name.to_string();
        self.call(move |inner, profile_id| {
            let removed = inner.conn.execute(
                "DELETE FROM items \
                 WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
                params![profile_id, ITEM_KIND, category, name],
            )?;
            if removed == 0 {
                return Err(BackendError::new(
                    BackendErrorCode::NotFound,
                    format!("entry '{category}/{name}' not found"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn remove_all(
        &mut self,
        category: &str,
        filter: Option<&TagFilter>,
    ) -> BackendResult<usize> {
        let category = category.to_string();
        let filter = filter.cloned();
        self.call(move |inner, profile_id| {
            let ids: Vec<i64> = scan(inner, profile_id, &category, filter.as_ref())?
                .into_iter()
                .map(|(id, ..)| id)
                .collect();
            for id in &ids {
                inner
                    .conn
                    .execute("DELETE FROM items WHERE id = ?1", params![id])?;
            }
            Ok(ids.len())
        })
        .await
    }

    async fn insert_key(&mut self, key: &KeyEntry) -> BackendResult<()> {
        let key = key.clone();
        self.call(move |inner, profile_id| {
            let json = serde_json::to_vec(&key).map_err(|e| unexpected(format!("key: {e}")))?;
            let value = crypto::seal(&inner.key, &json)?;
            let tags = seal_tags(&inner.key, &key.tags)?;
            inner.conn.execute(
                "INSERT INTO items (profile_id, kind, category, name, value, tags) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![profile_id, KEY_KIND, KEY_CATEGORY, key.name, value, tags],
            )?;
            Ok(())
        })
        .await
    }

    async fn fetch_key(&mut self, name: &str, _for_update: bool) -> BackendResult<Option<KeyEntry>> {
        let name = name.to_string();
        self.call(move |inner, profile_id| {
            let sealed: Option<Vec<u8>> = inner
                .conn
                .query_row(
                    "SELECT value FROM items \
                     WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
                    params![profile_id, KEY_KIND, KEY_CATEGORY, name],
                    |row| row.get(0),
                )
                .optional()?;

            sealed
                .map(|sealed| {
                    serde_json::from_slice(&crypto::open(&inner.key, &sealed)?)
                        .map_err(|e| unexpected(format!("stored key is corrupted: {e}")))
                })
                .transpose()
        })
        .await
    }

    async fn remove_key(&mut self, name: &str) -> BackendResult<()> {
        let name = name.to_string();
        self.call(move |inner, profile_id| {
            let removed = inner.conn.execute(
                "DELETE FROM items \
                 WHERE profile_id = ?1 AND kind = ?2 AND category = ?3 AND name = ?4",
                params![profile_id, KEY_KIND, KEY_CATEGORY, name],
            )?;
            if removed == 0 {
                return Err(BackendError::new(
                    BackendErrorCode::NotFound,
                    format!("key '{name}' not found"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn commit(&mut self) -> BackendResult<()> {
        self.require_transaction("commit")?;
        self.finish(Some("COMMIT;")).await
    }

    async fn rollback(&mut self) -> BackendResult<()> {
        self.require_transaction("roll back")?;
        self.finish(Some("ROLLBACK;")).await
    }

    async fn close(&mut self) -> BackendResult<()> {
        let sql = self.transaction.then_some("ROLLBACK;");
        self.finish(sql).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
