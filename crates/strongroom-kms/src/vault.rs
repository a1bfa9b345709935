//! Key vault backed by the store's key entries.
//!
//! Each operation opens one scoped session for the caller's context, so
//! tenant keys land in the tenant's profile or store like any record.

use std::sync::Arc;

use strongroom_store::{StoreContext, StoreManager};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{KmsError, KmsResult};
use crate::keys::{KeyMaterial, KeyType, PublicKeyInfo};

/// Creates, imports, looks up and deletes keys for a store context.
#[derive(Clone)]
pub struct KeyVault {
    manager: Arc<StoreManager>,
}

impl KeyVault {
    pub fn new(manager: Arc<StoreManager>) -> Self {
        Self { manager }
    }

    /// Generate a new key. The id defaults to a fresh UUID v7.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn create_key(
        &self,
        context: &StoreContext,
        key_type: KeyType,
        key_id: Option<String>,
    ) -> KmsResult<PublicKeyInfo> {
        let material = KeyMaterial::generate(key_type)?;
        self.store(context, material, key_id).await
    }

    /// Store caller-supplied key material after validating it.
    #[instrument(skip(self, context, material), fields(context = %context))]
    pub async fn import_key(
        &self,
        context: &StoreContext,
        material: KeyMaterial,
        key_id: Option<String>,
    ) -> KmsResult<PublicKeyInfo> {
        material.validate()?;
        self.store(context, material, key_id).await
    }

    async fn store(
        &self,
        context: &StoreContext,
        material: KeyMaterial,
        key_id: Option<String>,
    ) -> KmsResult<PublicKeyInfo> {
        let key_id = key_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let info = PublicKeyInfo::from_material(&key_id, &material)?;
        let entry = material.into_entry(&key_id);

        self.manager
            .with_session(context, move |session| {
                Box::pin(async move { session.insert_key(&entry).await })
            })
            .await
            .map_err(|err| {
                if err.is_duplicate() {
                    KmsError::KeyExists {
                        key_id: key_id.clone(),
                    }
                } else {
                    err.into()
                }
            })?;

        debug!(key_id = %key_id, key_type = ?info.key_type, "key stored");
        Ok(info)
    }

    /// Public view of a stored key, `None` when no key has that id.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn get_public_key(
        &self,
        context: &StoreContext,
        key_id: &str,
    ) -> KmsResult<Option<PublicKeyInfo>> {
        let name = key_id.to_string();
        let entry = self
            .manager
            .with_session(context, move |session| {
                Box::pin(async move { session.fetch_key(&name, false).await })
            })
            .await?;

        match entry {
            Some(entry) => {
                let material = KeyMaterial::from_entry(entry)?;
                PublicKeyInfo::from_material(key_id, &material).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Returns `false` when there was nothing to delete.
    #[instrument(skip(self, context), fields(context = %context))]
    pub async fn delete_key(&self, context: &StoreContext, key_id: &str) -> KmsResult<bool> {
        let name = key_id.to_string();
        let removed = self
            .manager
            .with_session(context, move |session| {
                Box::pin(async move { session.remove_key(&name).await })
            })
            .await;

        match removed {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn key_exists(&self, context: &StoreContext, key_id: &str) -> KmsResult<bool> {
        Ok(self.get_public_key(context, key_id).await?.is_some())
    }
}
