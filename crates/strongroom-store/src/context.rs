//! Caller identities and the tenant configuration capability.

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::backend::crypto;
use crate::error::{StoreError, StoreResult};

/// Context id of the root (non-tenant) caller.
pub const ROOT_CONTEXT_ID: &str = "default";

/// A logical caller identity. The root context owns the configured store;
/// every other context is a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreContext {
    id: String,
}

impl StoreContext {
    pub fn root() -> Self {
        Self {
            id: ROOT_CONTEXT_ID.to_string(),
        }
    }

    pub fn tenant(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_CONTEXT_ID
    }

    /// Profile (profile-per-wallet) or store id (database-per-wallet)
    /// assigned to this context when it acts as a tenant.
    pub fn tenant_wallet_name(&self) -> String {
        format!("wallet-{}", self.id)
    }
}

impl fmt::Display for StoreContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Supplies store keys for tenants that own a dedicated store.
///
/// Only consulted under the database-per-wallet scheme. Implementations are
/// expected to create a key the first time a tenant is seen and persist it
/// on their own tenant record.
#[async_trait]
pub trait TenantStoreConfigProvider: Send + Sync {
    /// Raw (base64, 32 bytes) store key for `context`.
    async fn tenant_store_key(&self, context: &StoreContext) -> StoreResult<String>;
}

/// Process-local provider generating a random raw key per tenant.
#[derive(Debug, Default)]
pub struct GeneratedTenantKeys {
    keys: DashMap<String, String>,
}

impl GeneratedTenantKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantStoreConfigProvider for GeneratedTenantKeys {
    async fn tenant_store_key(&self, context: &StoreContext) -> StoreResult<String> {
        if let Some(key) = self.keys.get(context.id()) {
            return Ok(key.clone());
        }

        let key = crypto::generate_raw_key()
            .map_err(|e| StoreError::other("failed to generate tenant store key", Some(e)))?;
        let key = self
            .keys
            .entry(context.id().to_string())
            .or_insert(key)
            .clone();
        debug!(context = %context, "assigned tenant store key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_tenant() {
        assert!(StoreContext::root().is_root());
        let tenant = StoreContext::tenant("abc");
        assert!(!tenant.is_root());
        assert_eq!(tenant.tenant_wallet_name(), "wallet-abc");
    }

    #[tokio::test]
    async fn generated_keys_are_stable_per_tenant() {
        let provider = GeneratedTenantKeys::new();
        let a = StoreContext::tenant("a");
        let first = provider.tenant_store_key(&a).await.unwrap();
        assert_eq!(provider.tenant_store_key(&a).await.unwrap(), first);
        assert_ne!(
            provider
                .tenant_store_key(&StoreContext::tenant("b"))
                .await
                .unwrap(),
            first
        );
    }
}
