//! # strongroom-kms
//!
//! Key vault on top of `strongroom-store`. Keys are generated with `ring`
//! or imported by the caller, then kept as sealed key entries in the
//! profile that belongs to the calling [`StoreContext`](strongroom_store::StoreContext).

pub mod error;
pub mod keys;
pub mod vault;

pub use error::{KmsError, KmsResult};
pub use keys::{KeyMaterial, KeyType, PublicKeyInfo, SECRET_LEN};
pub use vault::KeyVault;
