//! Store configuration and URI resolution.
//!
//! The configuration mirrors what an agent hands to the storage module: a
//! store id and key, an optional key derivation method and an optional
//! database section discriminated by `type`. It can be built in code,
//! deserialized from JSON (camelCase) or loaded from a TOML file.
//!
//! ```toml
//! multiWalletDatabaseScheme = "ProfilePerWallet"
//!
//! [store]
//! id = "agent"
//! key = "correct horse battery staple"
//! keyDerivationMethod = "kdf:pbkdf2:int"
//!
//! [store.database]
//! type = "sqlite"
//! config = { path = "/var/lib/agent/agent.db" }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;
use url::form_urlencoded;

use crate::backend::KdfMethod;
use crate::error::{StoreError, StoreResult};

/// Credentials and location of one physical store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub id: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_derivation_method: Option<KdfMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

impl StoreConfig {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
            key_derivation_method: None,
            database: None,
        }
    }

    pub fn with_key_derivation_method(mut self, method: KdfMethod) -> Self {
        self.key_derivation_method = Some(method);
        self
    }

    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = Some(database);
        self
    }

    /// An in-memory SQLite store; contents vanish when it is closed.
    pub fn in_memory(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(id, key).with_database(DatabaseConfig::Sqlite {
            config: Some(SqliteConfig {
                in_memory: Some(true),
                ..SqliteConfig::default()
            }),
        })
    }

    /// Key method in effect, falling back to the default method.
    pub fn kdf_method(&self) -> KdfMethod {
        self.key_derivation_method.unwrap_or_default()
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("key_derivation_method", &self.key_derivation_method)
            .field("database", &self.database)
            .finish()
    }
}

/// Backend selection, tagged on `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<SqliteConfig>,
    },
    Postgres {
        config: PostgresConfig,
        credentials: PostgresCredentials,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqliteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_memory: Option<bool>,
    /// Database file; defaults to `{data_path}/wallet/{id}/sqlite.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfig {
    /// `host` or `host:port`.
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_connections: Option<u32>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresCredentials {
    pub account: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

impl fmt::Debug for PostgresCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresCredentials")
            .field("account", &self.account)
            .field("password", &"<redacted>")
            .field("admin_account", &self.admin_account)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// How tenants are mapped onto physical stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MultiWalletDatabaseScheme {
    /// Every tenant owns its own store.
    #[default]
    DatabasePerWallet,
    /// All tenants share the root store, one profile each.
    ProfilePerWallet,
}

/// Top-level configuration of the storage module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreModuleConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub multi_wallet_database_scheme: MultiWalletDatabaseScheme,
}

impl StoreModuleConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            multi_wallet_database_scheme: MultiWalletDatabaseScheme::default(),
        }
    }

    pub fn with_scheme(mut self, scheme: MultiWalletDatabaseScheme) -> Self {
        self.multi_wallet_database_scheme = scheme;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        toml::from_str(content).map_err(|e| {
            StoreError::other(format!("failed to parse store configuration: {e}"), None)
        })
    }

    /// Load and parse a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), store_id = %config.store.id, "store configuration loaded");
        Ok(config)
    }
}

/// A backend URI, plus the file it points at for file-backed stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUri {
    pub uri: String,
    pub path: Option<PathBuf>,
}

/// `true` for the in-memory SQLite URI, with or without parameters.
pub fn is_sqlite_in_memory_uri(uri: &str) -> bool {
    uri == "sqlite://:memory:" || uri.starts_with("sqlite://:memory:?")
}

/// Resolve the backend URI for `config`.
pub fn uri_from_store_config(config: &StoreConfig, data_path: &Path) -> StoreResult<ResolvedUri> {
    match &config.database {
        None => Ok(sqlite_uri(config, None, data_path)),
        Some(DatabaseConfig::Sqlite { config: sqlite }) => {
            Ok(sqlite_uri(config, sqlite.as_ref(), data_path))
        }
        Some(DatabaseConfig::Postgres {
            config: postgres,
            credentials,
        }) => postgres_uri(&config.id, postgres, credentials),
    }
}

fn sqlite_uri(config: &StoreConfig, sqlite: Option<&SqliteConfig>, data_path: &Path) -> ResolvedUri {
    let mut params = form_urlencoded::Serializer::new(String::new());
    let mut has_params = false;
    if let Some(max) = sqlite.and_then(|s| s.max_connections) {
        params.append_pair("max_connections", &max.to_string());
        has_params = true;
    }
    let query = has_params.then(|| params.finish());

    if sqlite.and_then(|s| s.in_memory).unwrap_or(false) {
        let mut uri = String::from("sqlite://:memory:");
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(&query);
        }
        return ResolvedUri { uri, path: None };
    }

    let path = sqlite
        .and_then(|s| s.path.clone())
        .unwrap_or_else(|| data_path.join("wallet").join(&config.id).join("sqlite.db"));

    let mut uri = format!("sqlite://{}", path.display());
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(&query);
    }
    ResolvedUri {
        uri,
        path: Some(path),
    }
}

fn postgres_uri(
    id: &str,
    config: &PostgresConfig,
    credentials: &PostgresCredentials,
) -> StoreResult<ResolvedUri> {
    let invalid = || StoreError::other(format!("invalid postgres host '{}'", config.host), None);

    let mut url = Url::parse(&format!("postgres://{}", config.host)).map_err(|_| invalid())?;
    url.set_username(&credentials.account).map_err(|_| invalid())?;
    url.set_password(Some(&credentials.password))
        .map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .clear()
        .push(id);

    let optional = [
        ("connect_timeout", config.connect_timeout.map(|v| v.to_string())),
        ("idle_timeout", config.idle_timeout.map(|v| v.to_string())),
        ("max_connections", config.max_connections.map(|v| v.to_string())),
        ("min_connections", config.min_connections.map(|v| v.to_string())),
        ("admin_account", credentials.admin_account.clone()),
        ("admin_password", credentials.admin_password.clone()),
    ];
    let present: Vec<(&str, String)> = optional
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
        .collect();
    if !present.is_empty() {
        url.query_pairs_mut().extend_pairs(present);
    }

    Ok(ResolvedUri {
        uri: url.to_string(),
        path: None,
    })
}

// ── tests ────────────────────────────────────────────────────────────
