//! Record storage service.
//!
//! Records are serialized to JSON and stored under `(R::TYPE, id)` with
//! their tags run through the tag codec. Every call goes through
//! [`StoreManager::run_scoped`], so each operation gets its own session
//! and the read-modify-write of [`StorageService::update_by_id_with_lock`]
//! happens inside a single transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::backend::{BackendError, BackendErrorCode, BackendResult, BackendSession, BackendStore, Entry};
use crate::codec::{self, Tags};
use crate::context::StoreContext;
use crate::error::{StoreError, StoreResult};
use crate::manager::StoreManager;
use crate::query::{self, Query};

/// A record kept by the storage service.
///
/// The value is the record's JSON form. Tags are stored next to it so they
/// can be queried; after loading, the stored tags are handed back through
/// [`replace_tags`](Self::replace_tags).
pub trait StorageRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Category all records of this type are stored under.
    const TYPE: &'static str;

    fn id(&self) -> &str;

    /// Every tag to index the record by.
    fn tags(&self) -> Tags;

    fn replace_tags(&mut self, tags: Tags);

    fn set_updated_at(&mut self, updated_at: DateTime<Utc>);
}

/// Pagination applied after filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset: Some(offset),
            limit: Some(limit),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Storage version marker
// ═══════════════════════════════════════════════════════════════════════

/// Id of the single [`StorageVersionRecord`] in each profile.
pub const STORAGE_VERSION_RECORD_ID: &str = "STORAGE_VERSION_RECORD_ID";

/// Storage layout version written when a store or profile is created.
pub const CURRENT_STORAGE_VERSION: &str = "0.1";

/// Marks the storage layout version of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionRecord {
    #[serde(default = "storage_version_record_id")]
    pub id: String,
    pub storage_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    tags: Tags,
}

fn storage_version_record_id() -> String {
    STORAGE_VERSION_RECORD_ID.to_string()
}

impl StorageVersionRecord {
    pub fn current() -> Self {
        Self {
            id: storage_version_record_id(),
            storage_version: CURRENT_STORAGE_VERSION.to_string(),
            updated_at: None,
            tags: Tags::new(),
        }
    }
}

impl StorageRecord for StorageVersionRecord {
    const TYPE: &'static str = "StorageVersionRecord";

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

/// Write the storage version marker through a raw backend session.
async fn write_storage_version(session: &mut dyn BackendSession) -> BackendResult<()> {
    let mut record = StorageVersionRecord::current();
    record.set_updated_at(Utc::now());
    let value = serde_json::to_vec(&record).map_err(|e| {
        BackendError::new(BackendErrorCode::Unexpected, format!("storage version: {e}"))
    })?;
    let written = session
        .insert(
            StorageVersionRecord::TYPE,
            STORAGE_VERSION_RECORD_ID,
            &value,
            &codec::encode(&record.tags()),
        )
        .await;
    match written {
        Err(err) if err.is(BackendErrorCode::Duplicate) => Ok(()),
        other => other,
    }
}

/// Write the storage version marker into `profile` (the store default when
/// `None`) in a session of its own. A marker that is already there is kept.
pub(crate) async fn bootstrap_store(
    store: &dyn BackendStore,
    profile: Option<&str>,
) -> BackendResult<()> {
    let mut session = store.session(profile, false).await?;
    let written = write_storage_version(&mut *session).await;
    let closed = session.close().await;
    written.and(closed)
}

// ═══════════════════════════════════════════════════════════════════════
//  StorageService
// ═══════════════════════════════════════════════════════════════════════

fn serialize<R: StorageRecord>(record: &R) -> StoreResult<(Vec<u8>, codec::RawTags)> {
    Ok((serde_json::to_vec(record)?, codec::encode(&record.tags())))
}

fn record_from_entry<R: StorageRecord>(entry: Entry) -> StoreResult<R> {
    let mut record: R = serde_json::from_slice(&entry.value)?;
    record.replace_tags(codec::decode(&entry.tags));
    Ok(record)
}

fn missing<R: StorageRecord>(id: &str) -> StoreError {
    StoreError::not_found(format!("{} record with id '{id}'", R::TYPE), None)
}

/// CRUD and query operations over [`StorageRecord`]s.
#[derive(Clone)]
pub struct StorageService {
    manager: Arc<StoreManager>,
}

impl StorageService {
    pub fn new(manager: Arc<StoreManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<StoreManager> {
        &self.manager
    }

    /// Insert a new record, stamping `updated_at`.
    #[instrument(skip(self, record, context), fields(context = %context, category = R::TYPE, id = record.id()))]
    pub async fn save<R: StorageRecord>(&self, context: &StoreContext, record: &mut R) -> StoreResult<()> {
        record.set_updated_at(Utc::now());
        let (value, tags) = serialize(record)?;
        let id = record.id().to_string();

        self.manager
            .with_session(context, move |session| {
                Box::pin(async move { session.insert(R::TYPE, &id, &value, &tags).await })
            })
            .await
    }

    /// Replace an existing record, stamping `updated_at`.
    #[instrument(skip(self, record, context), fields(context = %context, category = R::TYPE, id = record.id()))]
    pub async fn update<R: StorageRecord>(&self, context: &StoreContext, record: &mut R) -> StoreResult<()> {
        record.set_updated_at(Utc::now());
        let (value, tags) = serialize(record)?;
        let id = record.id().to_string();

        self.manager
            .with_session(context, move |session| {
                Box::pin(async move { session.replace(R::TYPE, &id, &value, &tags).await })
            })
            .await
    }

    /// Fetch, mutate and write back a record in one transaction.
    ///
    /// The record is read with update intent, so no other transaction can
    /// change it between the read and the write. An error from `mutate`
    /// rolls the transaction back.
    #[instrument(skip(self, mutate, context), fields(context = %context, category = R::TYPE))]
    pub async fn update_by_id_with_lock<R, M>(
        &self,
        context: &StoreContext,
        id: &str,
        mutate: M,
    ) -> StoreResult<R>
    where
        R: StorageRecord,
        M: FnOnce(R) -> StoreResult<R> + Send + 'static,
    {
        let id = id.to_string();

        self.manager
            .with_transaction(context, move |session| {
                Box::pin(async move {
                    let entry = session
                        .fetch(R::TYPE, &id, true)
                        .await?
                        .ok_or_else(|| missing::<R>(&id))?;

                    let mut record = mutate(record_from_entry::<R>(entry)?)?;
                    record.set_updated_at(Utc::now());
                    let (value, tags) = serialize(&record)?;
                    session.replace(R::TYPE, &id, &value, &tags).await?;
                    Ok(record)
                })
            })
            .await
    }

    pub async fn delete<R: StorageRecord>(&self, context: &StoreContext, record: &R) -> StoreResult<()> {
        self.delete_by_id::<R>(context, record.id()).await
    }

    #[instrument(skip(self, context), fields(context = %context, category = R::TYPE))]
    pub async fn delete_by_id<R: StorageRecord>(&self, context: &StoreContext, id: &str) -> StoreResult<()> {
        let id = id.to_string();

        self.manager
            .with_session(context, move |session| {
                Box::pin(async move { session.remove(R::TYPE, &id).await })
            })
            .await
    }

    /// Fails with [`StoreError::NotFound`] if there is no such record.
    #[instrument(skip(self, context), fields(context = %context, category = R::TYPE))]
    pub async fn get_by_id<R: StorageRecord>(&self, context: &StoreContext, id: &str) -> StoreResult<R> {
        let id = id.to_string();

        let entry = self
            .manager
            .with_session(context, move |session| {
                Box::pin(async move {
                    session
                        .fetch(R::TYPE, &id, false)
                        .await?
                        .ok_or_else(|| missing::<R>(&id))
                })
            })
            .await?;

        record_from_entry(entry)
    }

    pub async fn get_all<R: StorageRecord>(&self, context: &StoreContext) -> StoreResult<Vec<R>> {
        self.find_by_query(context, &Query::all(), QueryOptions::default())
            .await
    }

    /// Records matching `query`, in insertion order, paginated after
    /// filtering.
    #[instrument(skip(self, query, context), fields(context = %context, category = R::TYPE))]
    pub async fn find_by_query<R: StorageRecord>(
        &self,
        context: &StoreContext,
        query: &Query,
        options: QueryOptions,
    ) -> StoreResult<Vec<R>> {
        let filter = Some(query::compile(query)).filter(|f| !f.is_unconstrained());

        let entries = self
            .manager
            .with_session(context, move |session| {
                Box::pin(async move {
                    session
                        .fetch_all(R::TYPE, filter.as_ref(), options.offset, options.limit, false)
                        .await
                })
            })
            .await?;

        debug!(matches = entries.len(), "query finished");
        entries.into_iter().map(record_from_entry).collect()
    }
}

// ── tests ────────────────────────────────────────────────────────────
