//! Tenant-scoped encryption: primitives, vector codec and key management.

mod cache;
mod cipher;
mod codec;
mod keys;

pub use cache::KeyCache;
pub use cipher::{
    CryptoError, KEY_LEN, NONCE_LEN, SecretKey, TAG_LEN, derive_index_key, open, seal,
};
pub use codec::VectorCodec;
pub use keys::{KeyError, TenantKeyManager};
