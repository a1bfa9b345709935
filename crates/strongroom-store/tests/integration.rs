//! Integration tests for the strongroom-store crate.
//!
//! These drive the public API end to end against file-backed and in-memory
//! SQLite stores: lifecycle, tenancy, scoped transactions and queries.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strongroom_store::{
    DatabaseConfig, GeneratedTenantKeys, KdfMethod, MultiWalletDatabaseScheme, Query,
    QueryOptions, RawTags, SqliteBackend, SqliteConfig, StorageRecord, StorageService,
    StoreConfig, StoreContext, StoreError, StoreManager, StoreModuleConfig, TagValue, Tags,
    TokioFileSystem, generate_raw_store_key,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestRecord {
    id: String,
    foo: String,
    updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    tags: Tags,
}

impl TestRecord {
    fn new(tags: &[(&str, TagValue)]) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            foo: "bar".into(),
            updated_at: None,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

impl StorageRecord for TestRecord {
    const TYPE: &'static str = "TestRecord";

    fn id(&self) -> &str {
        &self.id
    }

    fn tags(&self) -> Tags {
        self.tags.clone()
    }

    fn replace_tags(&mut self, tags: Tags) {
        self.tags = tags;
    }

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = Some(updated_at);
    }
}

fn root_config(id: &str) -> StoreConfig {
    StoreConfig::new(id, generate_raw_store_key().unwrap()).with_key_derivation_method(KdfMethod::Raw)
}

fn manager_with(dir: &Path, store: StoreConfig, scheme: MultiWalletDatabaseScheme) -> Arc<StoreManager> {
    Arc::new(
        StoreManager::new(
            Arc::new(SqliteBackend::new()),
            Arc::new(TokioFileSystem::new(dir)),
            StoreModuleConfig::new(store).with_scheme(scheme),
        )
        .with_tenant_config_provider(Arc::new(GeneratedTenantKeys::new())),
    )
}

fn manager(dir: &Path, scheme: MultiWalletDatabaseScheme) -> Arc<StoreManager> {
    manager_with(dir, root_config("agent"), scheme)
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn provisioning_twice_is_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();

    manager.provision(&root).await.unwrap();
    manager.close_store(&root).await.unwrap();

    let err = manager.provision(&root).await.err().unwrap();
    assert!(matches!(err, StoreError::Duplicate { .. }), "{err}");
}

#[tokio::test]
async fn opening_unprovisioned_store_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);

    let err = manager.open(&StoreContext::root()).await.err().unwrap();
    assert!(matches!(err, StoreError::NotFound { .. }), "{err}");
}

#[tokio::test]
async fn in_memory_store_is_provisioned_on_first_use() {
    let dir = tempfile::tempdir().unwrap();
    let store = root_config("memory").with_database(DatabaseConfig::Sqlite {
        config: Some(SqliteConfig {
            in_memory: Some(true),
            ..SqliteConfig::default()
        }),
    });
    let manager = manager_with(dir.path(), store, MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();

    assert!(manager.open(&root).await.err().unwrap().is_not_found());

    let storage = StorageService::new(Arc::clone(&manager));
    let mut record = TestRecord::new(&[("myTag", "foobar".into())]);
    storage.save(&root, &mut record).await.unwrap();
    assert!(manager.is_store_open(&root));
    assert_eq!(storage.get_all::<TestRecord>(&root).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rotated_key_invalidates_old_key() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();
    let storage = StorageService::new(Arc::clone(&manager));

    let mut record = TestRecord::new(&[]);
    storage.save(&root, &mut record).await.unwrap();

    manager
        .rotate_key(&root, &generate_raw_store_key().unwrap(), None)
        .await
        .unwrap();
    let loaded: TestRecord = storage.get_by_id(&root, &record.id).await.unwrap();
    assert_eq!(loaded.id, record.id);

    manager.close_store(&root).await.unwrap();
    let err = manager.open(&root).await.err().unwrap();
    assert!(matches!(err, StoreError::InvalidKey { .. }), "{err}");
}

#[tokio::test]
async fn export_and_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let source_manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();
    let storage = StorageService::new(Arc::clone(&source_manager));

    let mut record = TestRecord::new(&[("myTag", "foobar".into())]);
    storage.save(&root, &mut record).await.unwrap();

    let backup = root_config("backup");
    source_manager.export_store(&root, &backup).await.unwrap();
    let err = source_manager.export_store(&root, &backup).await.unwrap_err();
    assert!(matches!(err, StoreError::ExportPathExists { .. }), "{err}");

    let target_manager = manager_with(
        dir.path(),
        root_config("restored"),
        MultiWalletDatabaseScheme::DatabasePerWallet,
    );
    target_manager.import_store(&root, &backup).await.unwrap();
    let err = target_manager.import_store(&root, &backup).await.unwrap_err();
    assert!(matches!(err, StoreError::ImportPathExists { .. }), "{err}");
}

#[tokio::test]
async fn import_into_open_store_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();
    manager.provision(&root).await.unwrap();

    let err = manager
        .import_store(&root, &root_config("elsewhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Other { .. }), "{err}");
    assert!(manager.is_store_open(&root));
}

#[tokio::test]
async fn imported_store_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let root = StoreContext::root();

    let backup = root_config("backup");
    let source = manager_with(dir.path(), backup.clone(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let mut record = TestRecord::new(&[("kind", vec!["a", "b"].into())]);
    StorageService::new(Arc::clone(&source))
        .save(&root, &mut record)
        .await
        .unwrap();
    source.close_store(&root).await.unwrap();

    let restored_config = root_config("restored");
    let target = manager_with(dir.path(), restored_config, MultiWalletDatabaseScheme::DatabasePerWallet);
    target.import_store(&root, &backup).await.unwrap();
    assert!(!target.is_store_open(&root));

    let loaded: TestRecord = StorageService::new(Arc::clone(&target))
        .get_by_id(&root, &record.id)
        .await
        .unwrap();
    assert_eq!(loaded, record);
}

#[tokio::test]
async fn failed_import_leaves_no_destination() {
    let dir = tempfile::tempdir().unwrap();
    let root = StoreContext::root();

    let source_config = root_config("src");
    let source = manager_with(dir.path(), source_config.clone(), MultiWalletDatabaseScheme::DatabasePerWallet);
    source.provision(&root).await.unwrap();
    source.close_store(&root).await.unwrap();

    let target = manager_with(dir.path(), root_config("dst"), MultiWalletDatabaseScheme::DatabasePerWallet);
    let destination = dir.path().join("wallet").join("dst");

    let wrong_key = StoreConfig {
        key: generate_raw_store_key().unwrap(),
        ..source_config
    };
    let err = target.import_store(&root, &wrong_key).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidKey { .. }), "{err}");
    assert!(!destination.exists());

    let err = target
        .import_store(&root, &root_config("never-created"))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");
    assert!(!destination.exists());
    assert!(!target.is_store_open(&root));
}

#[tokio::test]
async fn failed_export_leaves_no_destination() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let root = StoreContext::root();
    manager.provision(&root).await.unwrap();

    // A raw key that is not base64 fails after the file is created.
    let broken = StoreConfig::new("broken", "not a raw key").with_key_derivation_method(KdfMethod::Raw);
    let err = manager.export_store(&root, &broken).await.unwrap_err();
    assert!(matches!(err, StoreError::Other { .. }), "{err}");
    assert!(!dir.path().join("wallet").join("broken").exists());
    assert!(manager.is_store_open(&root));
}

// ═══════════════════════════════════════════════════════════════════════
//  Tenancy
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tenant_profile_is_created_on_first_session() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let tenant = StoreContext::tenant("alice");

    let mut record = TestRecord::new(&[]);
    storage.save(&tenant, &mut record).await.unwrap();
    storage.get_by_id::<TestRecord>(&tenant, &record.id).await.unwrap();

    let profiles = manager.list_profiles(&StoreContext::root()).await.unwrap();
    assert_eq!(profiles.iter().filter(|p| *p == "wallet-alice").count(), 1);

    // Profiles are isolated from each other and from the root.
    let err = storage
        .get_by_id::<TestRecord>(&StoreContext::root(), &record.id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn tenant_cannot_run_store_level_operations() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();
    let tenant = StoreContext::tenant("mallory");

    let mut record = TestRecord::new(&[]);
    storage.save(&root, &mut record).await.unwrap();

    for err in [
        manager.delete_store(&tenant).await.unwrap_err(),
        manager.close_store(&tenant).await.unwrap_err(),
        manager
            .rotate_key(&tenant, &generate_raw_store_key().unwrap(), None)
            .await
            .unwrap_err(),
        manager.export_store(&tenant, &root_config("copy")).await.unwrap_err(),
        manager.import_store(&tenant, &root_config("copy")).await.unwrap_err(),
    ] {
        assert!(matches!(err, StoreError::Scope { .. }), "{err}");
    }

    assert!(manager.is_store_open(&root));
    storage.get_by_id::<TestRecord>(&root, &record.id).await.unwrap();

    // Closing a tenant context leaves the shared store alone.
    manager.close_context(&tenant).await.unwrap();
    assert!(manager.is_store_open(&root));
}

#[tokio::test]
async fn deleting_tenant_context_removes_only_its_profile() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::ProfilePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();
    let tenant = StoreContext::tenant("bob");

    let mut mine = TestRecord::new(&[]);
    storage.save(&tenant, &mut mine).await.unwrap();
    let mut shared = TestRecord::new(&[]);
    storage.save(&root, &mut shared).await.unwrap();

    manager.delete_context(&tenant).await.unwrap();
    let profiles = manager.list_profiles(&root).await.unwrap();
    assert!(!profiles.iter().any(|p| p == "wallet-bob"));
    storage.get_by_id::<TestRecord>(&root, &shared.id).await.unwrap();
}

#[tokio::test]
async fn database_per_wallet_tenants_get_their_own_store() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let tenant = StoreContext::tenant("carol");

    let mut record = TestRecord::new(&[]);
    storage.save(&tenant, &mut record).await.unwrap();
    assert!(
        dir.path()
            .join("wallet")
            .join("wallet-carol")
            .join("sqlite.db")
            .exists()
    );
    assert!(!manager.is_store_open(&StoreContext::root()));

    manager.delete_context(&tenant).await.unwrap();
    assert!(!manager.is_store_open(&tenant));
}

// ═══════════════════════════════════════════════════════════════════════
//  Transactions and queries
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failed_transaction_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();

    let result: Result<(), StoreError> = manager
        .with_transaction(&root, |session| {
            Box::pin(async move {
                session
                    .insert(TestRecord::TYPE, "doomed", b"{}", &RawTags::new())
                    .await?;
                Err(StoreError::NotFound {
                    what: "something else".into(),
                    source: None,
                })
            })
        })
        .await;
    assert!(result.unwrap_err().is_not_found());

    let err = storage
        .get_by_id::<TestRecord>(&root, "doomed")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn pagination_applies_after_filtering() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();

    let mut saved = Vec::new();
    for tag in ["foobar", "notfoobar", "foobar", "notfoobar"] {
        let mut record = TestRecord::new(&[("myTag", tag.into())]);
        storage.save(&root, &mut record).await.unwrap();
        saved.push(record);
    }

    let matching: Vec<TestRecord> = storage
        .find_by_query(&root, &Query::all().field("myTag", "foobar"), QueryOptions::page(0, 2))
        .await
        .unwrap();
    let ids: Vec<_> = matching.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![saved[0].id.as_str(), saved[2].id.as_str()]);

    let tail: Vec<TestRecord> = storage
        .find_by_query(&root, &Query::all(), QueryOptions::page(3, 2))
        .await
        .unwrap();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].id, saved[3].id);
}

#[tokio::test]
async fn advanced_queries_over_typed_tags() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();

    let mut flagged = TestRecord::new(&[
        ("flag", true.into()),
        ("kind", vec!["a", "b"].into()),
        ("theNumber", "1".into()),
    ]);
    let mut plain = TestRecord::new(&[("flag", false.into()), ("theNumber", "0".into())]);
    storage.save(&root, &mut flagged).await.unwrap();
    storage.save(&root, &mut plain).await.unwrap();

    let loaded: TestRecord = storage.get_by_id(&root, &flagged.id).await.unwrap();
    assert_eq!(loaded.tags, flagged.tags);

    let by_array: Vec<TestRecord> = storage
        .find_by_query(&root, &Query::all().field("kind", vec!["b"]), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(by_array.len(), 1);
    assert_eq!(by_array[0].id, flagged.id);

    let either = Query::all().or(vec![
        Query::all().field("theNumber", "0"),
        Query::all().field("flag", true),
    ]);
    let both: Vec<TestRecord> = storage
        .find_by_query(&root, &either, QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(both.len(), 2);

    let none: Vec<TestRecord> = storage
        .find_by_query(&root, &Query::all().or(vec![]), QueryOptions::default())
        .await
        .unwrap();
    assert!(none.is_empty());

    let negated: Vec<TestRecord> = storage
        .find_by_query(
            &root,
            &Query::all().not(Query::all().field("flag", true)),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(negated.len(), 1);
    assert_eq!(negated[0].id, plain.id);
}

#[tokio::test]
async fn concurrent_updates_with_lock_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path(), MultiWalletDatabaseScheme::DatabasePerWallet);
    let storage = StorageService::new(Arc::clone(&manager));
    let root = StoreContext::root();

    let mut record = TestRecord::new(&[]);
    record.foo = String::new();
    storage.save(&root, &mut record).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let storage = storage.clone();
        let root = root.clone();
        let id = record.id.clone();
        handles.push(tokio::spawn(async move {
            storage
                .update_by_id_with_lock(&root, &id, |mut r: TestRecord| {
                    r.foo.push('x');
                    Ok(r)
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let loaded: TestRecord = storage.get_by_id(&root, &record.id).await.unwrap();
    assert_eq!(loaded.foo, "xxxxxxxx");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_opens_the_store_once() {
    for scheme in [
        MultiWalletDatabaseScheme::ProfilePerWallet,
        MultiWalletDatabaseScheme::DatabasePerWallet,
    ] {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), scheme);
        let storage = StorageService::new(Arc::clone(&manager));

        let contexts = [
            StoreContext::root(),
            StoreContext::root(),
            StoreContext::tenant("a"),
            StoreContext::tenant("b"),
            StoreContext::tenant("c"),
        ];
        let mut handles = Vec::new();
        for context in contexts {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                let mut record = TestRecord::new(&[]);
                storage.save(&context, &mut record).await?;
                storage.get_by_id::<TestRecord>(&context, &record.id).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(manager.is_store_open(&StoreContext::root()));
    }
}
