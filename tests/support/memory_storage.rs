//! A volatile, in-memory `Storage` implementation for integration tests.
//!
//! Grounded in `original_source/tests/in_memory_storage.py`'s `InMemoryStorage`: a single dict
//! backing `_load`/`_store`/`_delete`. The unit-test double in `src/storage.rs` is the same idea;
//! this copy exists because `tests/` compiles against `protocol` as an external crate, so the
//! `#[cfg(test)]`-only module in the library itself isn't visible here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use protocol::Storage;

#[derive(Debug, thiserror::Error)]
#[error("in-memory storage never fails")]
pub struct StorageError;

enum Slot {
    Bytes(Vec<u8>),
    Int(i64),
    Bool(bool),
    Str(String),
}

/// A `Mutex`-guarded key-value store good for exactly one simulated account's lifetime.
#[derive(Default)]
pub struct MemoryStorage {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Error = StorageError;

    async fn load_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(match self.slots.lock().unwrap().get(key) {
            Some(Slot::Bytes(v)) => Some(v.clone()),
            _ => None,
        })
    }

    async fn load_int(&self, key: &str) -> Result<Option<i64>, Self::Error> {
        Ok(match self.slots.lock().unwrap().get(key) {
            Some(Slot::Int(v)) => Some(*v),
            _ => None,
        })
    }

    async fn load_bool(&self, key: &str) -> Result<Option<bool>, Self::Error> {
        Ok(match self.slots.lock().unwrap().get(key) {
            Some(Slot::Bool(v)) => Some(*v),
            _ => None,
        })
    }

    async fn load_str(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(match self.slots.lock().unwrap().get(key) {
            Some(Slot::Str(v)) => Some(v.clone()),
            _ => None,
        })
    }

    async fn store_bytes(&self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.slots.lock().unwrap().insert(key.to_string(), Slot::Bytes(value.to_vec()));
        Ok(())
    }

    async fn store_int(&self, key: &str, value: i64) -> Result<(), Self::Error> {
        self.slots.lock().unwrap().insert(key.to_string(), Slot::Int(value));
        Ok(())
    }

    async fn store_bool(&self, key: &str, value: bool) -> Result<(), Self::Error> {
        self.slots.lock().unwrap().insert(key.to_string(), Slot::Bool(value));
        Ok(())
    }

    async fn store_str(&self, key: &str, value: &str) -> Result<(), Self::Error> {
        self.slots.lock().unwrap().insert(key.to_string(), Slot::Str(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.slots.lock().unwrap().remove(key);
        Ok(())
    }
}
