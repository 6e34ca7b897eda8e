//! The storage facade: a typed, backend-agnostic key-value interface the host application
//! implements over whatever persistence technology it has (a database, a file, a keychain).
//!
//! Grounded in `original_source/tests/in_memory_storage.py`'s `_load`/`_store`/`_delete` shape.
//! The original's `Maybe[JSONType]` return convention becomes a plain `Option<T>` here — Rust
//! does not need a bespoke option type for "value or nothing" (see DESIGN.md Open Question 1).
//! Keys are opaque, slash-separated paths; callers (mostly `SessionManager` and its backends)
//! own their own namespacing, same as in the original.

use async_trait::async_trait;
use std::error::Error as StdError;

/// A typed, async key-value store. Implementors own the actual persistence; this crate only
/// ever reads and writes through this trait, never assuming a particular database or file
/// format.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The error type this storage implementation can fail with.
    type Error: StdError + Send + Sync + 'static;

    async fn load_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    async fn load_int(&self, key: &str) -> Result<Option<i64>, Self::Error>;
    async fn load_bool(&self, key: &str) -> Result<Option<bool>, Self::Error>;
    async fn load_str(&self, key: &str) -> Result<Option<String>, Self::Error>;

    async fn store_bytes(&self, key: &str, value: &[u8]) -> Result<(), Self::Error>;
    async fn store_int(&self, key: &str, value: i64) -> Result<(), Self::Error>;
    async fn store_bool(&self, key: &str, value: bool) -> Result<(), Self::Error>;
    async fn store_str(&self, key: &str, value: &str) -> Result<(), Self::Error>;

    /// Deletes whatever is stored under `key`, regardless of which `load_*`/`store_*` pair was
    /// used to write it. A delete of a key that was never set is not an error.
    async fn delete(&self, key: &str) -> Result<(), Self::Error>;
}

/// Serializes `value` with `bincode` and stores it under `key`. Used internally for the larger
/// structured values (bundles, ratchet state, session records) that don't fit the primitive
/// `load_*`/`store_*` methods; the wire format is this crate's own concern; the key's storage
/// representation is opaque to callers the same way `/ik/key` is in [`crate::identity`].
pub async fn store_bincode<S, T>(storage: &S, key: &str, value: &T) -> Result<(), S::Error>
where
    S: Storage,
    T: serde::Serialize,
{
    let bytes = bincode::serialize(value).expect("in-memory structures always serialize");
    storage.store_bytes(key, &bytes).await
}

/// Counterpart to [`store_bincode`].
///
/// Returns `Ok(None)` if nothing is stored under `key`. A malformed stored value (should not
/// happen outside of storage corruption or a version mismatch) is surfaced as `Ok(None)` as
/// well, since it is indistinguishable from "never written" at this layer.
pub async fn load_bincode<S, T>(storage: &S, key: &str) -> Result<Option<T>, S::Error>
where
    S: Storage,
    T: serde::de::DeserializeOwned,
{
    Ok(storage
        .load_bytes(key)
        .await?
        .and_then(|bytes| bincode::deserialize(&bytes).ok()))
}
