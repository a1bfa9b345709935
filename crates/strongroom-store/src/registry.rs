//! Registry of open store handles, keyed by owning context id.
//!
//! A slot is either `Open` or `Busy`. Lifecycle operations claim a slot,
//! which marks it `Busy` for the duration of the transition, and settle
//! it when done. A second transition on a busy slot fails immediately.
//! Dropping an unsettled [`Transition`] restores the slot to what it was.
//!
//! Implicit first use goes through a per-owner async lock instead, so
//! concurrent data operations queue behind one open or provision rather
//! than tripping over its `Busy` slot.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;

use crate::backend::BackendStore;
use crate::error::{StoreError, StoreResult};

enum Slot {
    Busy,
    Open(Arc<dyn BackendStore>),
}

#[derive(Default)]
pub(crate) struct StoreRegistry {
    slots: DashMap<String, Slot>,
    first_use: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The open handle for `owner`, if any.
    pub(crate) fn get(&self, owner: &str) -> Option<Arc<dyn BackendStore>> {
        match self.slots.get(owner).as_deref() {
            Some(Slot::Open(store)) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    pub(crate) fn is_open(&self, owner: &str) -> bool {
        matches!(self.slots.get(owner).as_deref(), Some(Slot::Open(_)))
    }

    /// Lock serializing on-demand open or provision of `owner`'s store.
    pub(crate) fn first_use_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.first_use.entry(owner.to_string()).or_default().value())
    }

    /// Start a lifecycle transition for `owner`.
    pub(crate) fn claim(&self, owner: &str) -> StoreResult<Transition<'_>> {
        let previous = match self.slots.entry(owner.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Busy);
                None
            }
            Entry::Occupied(mut occupied) => match occupied.insert(Slot::Busy) {
                Slot::Open(store) => Some(store),
                Slot::Busy => {
                    return Err(StoreError::other(
                        format!("store of context '{owner}' is busy with another lifecycle operation"),
                        None,
                    ));
                }
            },
        };

        Ok(Transition {
            slots: &self.slots,
            owner: owner.to_string(),
            previous,
            settled: false,
        })
    }
}

/// An in-flight lifecycle transition holding a `Busy` slot.
pub(crate) struct Transition<'a> {
    slots: &'a DashMap<String, Slot>,
    owner: String,
    previous: Option<Arc<dyn BackendStore>>,
    settled: bool,
}

impl Transition<'_> {
    /// The handle that was open when the transition started.
    pub(crate) fn previous(&self) -> Option<&Arc<dyn BackendStore>> {
        self.previous.as_ref()
    }

    /// Settle with `store` registered as open.
    pub(crate) fn open(mut self, store: Arc<dyn BackendStore>) {
        self.slots.insert(self.owner.clone(), Slot::Open(store));
        self.settled = true;
    }

    /// Settle with nothing registered.
    pub(crate) fn clear(mut self) {
        self.slots.remove(&self.owner);
        self.settled = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        match self.previous.take() {
            Some(store) => {
                self.slots.insert(self.owner.clone(), Slot::Open(store));
            }
            None => {
                self.slots.remove(&self.owner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, KdfMethod, SqliteBackend, StoreOptions, crypto};

    async fn memory_store() -> Arc<dyn BackendStore> {
        let options = StoreOptions {
            uri: "sqlite://:memory:".into(),
            key_method: KdfMethod::Raw,
            pass_key: crypto::generate_raw_key().unwrap(),
            profile: None,
        };
        SqliteBackend.provision(&options, false).await.unwrap()
    }

    #[tokio::test]
    async fn claim_open_and_clear() {
        let registry = StoreRegistry::new();
        assert!(!registry.is_open("a"));

        let transition = registry.claim("a").unwrap();
        assert!(transition.previous().is_none());
        transition.open(memory_store().await);
        assert!(registry.is_open("a"));
        assert!(registry.get("a").is_some());

        let transition = registry.claim("a").unwrap();
        assert!(transition.previous().is_some());
        assert!(!registry.is_open("a"));
        transition.clear();
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn concurrent_transition_fails_fast() {
        let registry = StoreRegistry::new();
        let _busy = registry.claim("a").unwrap();
        assert!(registry.claim("a").is_err());
        assert!(registry.claim("b").is_ok());
    }

    #[test]
    fn first_use_lock_is_shared_per_owner() {
        let registry = StoreRegistry::new();
        let a = registry.first_use_lock("a");
        assert!(Arc::ptr_eq(&a, &registry.first_use_lock("a")));
        assert!(!Arc::ptr_eq(&a, &registry.first_use_lock("b")));

        let _held = a.try_lock().unwrap();
        assert!(registry.first_use_lock("a").try_lock().is_err());
    }

    #[tokio::test]
    async fn dropped_transition_restores_slot() {
        let registry = StoreRegistry::new();
        registry.claim("a").unwrap().open(memory_store().await);

        drop(registry.claim("a").unwrap());
        assert!(registry.is_open("a"));

        drop(registry.claim("b").unwrap());
        assert!(registry.claim("b").is_ok());
    }
}
