//! Durable key-value store abstraction used by the job store and the broker.
//!
//! The contract is deliberately small: per-key atomic read-modify-write through
//! [`KvStore::insert_if_absent`] and [`KvStore::compare_and_swap`], plus a scan
//! ordered by the store-assigned creation index. [`MemoryStore`] is the
//! in-process implementation; anything that can honour the same contract
//! (BoltDB, etcd, a SQL table) can be slotted in behind the trait.

pub mod memory;

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A value together with its concurrency token and creation order.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub version: u64,
    pub create_index: u64,
    pub value: V,
}

pub trait KvStore: Send + Sync {
    fn get(&self, table: &str, key: &str) -> StoreResult<Option<Versioned<Vec<u8>>>>;

    /// Insert a new key at version 1. Returns the assigned creation index.
    fn insert_if_absent(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<u64>;

    /// Replace the value iff the stored version equals `expected_version`.
    /// Returns the new version.
    fn compare_and_swap(
        &self,
        table: &str,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64>;

    fn delete(&self, table: &str, key: &str, expected_version: u64) -> StoreResult<()>;

    /// All entries of a table ordered by creation index.
    fn scan(&self, table: &str) -> StoreResult<Vec<(String, Versioned<Vec<u8>>)>>;
}

/// Typed view over one table, encoding values as JSON.
pub struct Table<T> {
    store: Arc<dyn KvStore>,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Table<T> {
    pub fn new(store: Arc<dyn KvStore>, name: &'static str) -> Self {
        Self {
            store,
            name,
            _marker: PhantomData,
        }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Versioned<T>>> {
        self.store
            .get(self.name, key)?
            .map(decode)
            .transpose()
    }

    pub fn insert(&self, key: &str, value: &T) -> StoreResult<u64> {
        self.store
            .insert_if_absent(self.name, key, serde_json::to_vec(value)?)
    }

    pub fn swap(&self, key: &str, expected_version: u64, value: &T) -> StoreResult<u64> {
        self.store
            .compare_and_swap(self.name, key, expected_version, serde_json::to_vec(value)?)
    }

    pub fn delete(&self, key: &str, expected_version: u64) -> StoreResult<()> {
        self.store.delete(self.name, key, expected_version)
    }

    pub fn scan(&self) -> StoreResult<Vec<(String, Versioned<T>)>> {
        self.store
            .scan(self.name)?
            .into_iter()
            .map(|(key, raw)| decode(raw).map(|v| (key, v)))
            .collect()
    }
}

fn decode<T: DeserializeOwned>(raw: Versioned<Vec<u8>>) -> StoreResult<Versioned<T>> {
    Ok(Versioned {
        version: raw.version,
        create_index: raw.create_index,
        value: serde_json::from_slice(&raw.value)?,
    })
}
