//! In-memory record store.
//!
//! Mirrors IndexedDB semantics closely enough to stand in for it in native
//! builds and tests: records are keyed by their key path, `get_all` returns
//! records in primary-key order, and unique indexes reject duplicates.
//! Data is not persisted across application restarts.

use super::{InitCell, RecordStore, StorageConfig, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

type Collection = BTreeMap<String, Value>;

#[derive(Default)]
struct MemoryData {
    collections: HashMap<String, Collection>,
    writes: u64,
    upgrades: u32,
    #[cfg(test)]
    faults: Faults,
}

#[cfg(test)]
#[derive(Default, Clone)]
pub(crate) struct Faults {
    pub(crate) put: Option<StorageError>,
    pub(crate) delete: Option<StorageError>,
}

/// A simple in-memory store for native builds and tests.
#[derive(Clone)]
pub struct MemoryStore {
    config: Rc<StorageConfig>,
    data: Rc<RefCell<MemoryData>>,
    ready: InitCell<()>,
    available: Rc<Cell<bool>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config: Rc::new(config),
            data: Rc::new(RefCell::new(MemoryData::default())),
            ready: InitCell::new(),
            available: Rc::new(Cell::new(true)),
        }
    }

    /// A store that behaves like a context without browser storage.
    pub fn unavailable() -> Self {
        let store = Self::default();
        store.available.set(false);
        store
    }

    /// Number of successful `put` calls since creation.
    pub fn write_count(&self) -> u64 {
        self.data.borrow().writes
    }

    /// Number of times the schema was declared (at most once per store).
    pub fn upgrade_count(&self) -> u32 {
        self.data.borrow().upgrades
    }

    /// Number of records currently in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.data
            .borrow()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    #[cfg(test)]
    pub(crate) fn set_faults(&self, faults: Faults) {
        self.data.borrow_mut().faults = faults;
    }

    fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.data
            .borrow()
            .collections
            .get(collection)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn ensure_open(&self) -> Result<(), StorageError> {
        if !self.available.get() {
            return Err(StorageError::Unavailable);
        }
        let config = self.config.clone();
        let data = self.data.clone();
        self.ready
            .get_or_init(move || async move {
                let mut data = data.borrow_mut();
                for schema in &config.collections {
                    data.collections.entry(schema.name.clone()).or_default();
                }
                data.upgrades += 1;
                log::info!(
                    "Opened in-memory database {} v{}",
                    config.database_name,
                    config.version
                );
                Ok(())
            })
            .await
    }
}

impl RecordStore for MemoryStore {
    async fn init(&self) -> Result<(), StorageError> {
        self.ensure_open().await
    }

    async fn get_all<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
    ) -> Result<Vec<T>, StorageError> {
        self.ensure_open().await?;
        self.config.collection(collection)?;
        self.snapshot(collection).into_iter().map(from_value).collect()
    }

    async fn get<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        self.ensure_open().await?;
        self.config.collection(collection)?;
        let value = self
            .data
            .borrow()
            .collections
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned();
        value.map(from_value).transpose()
    }

    async fn put<T: Serialize + 'static>(
        &self,
        collection: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        self.ensure_open().await?;
        let schema = self.config.collection(collection)?;

        let value = serde_json::to_value(value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let key = key_of(&value, &schema.key_path).ok_or_else(|| {
            StorageError::ConstraintViolation(format!(
                "record has no string key at '{}'",
                schema.key_path
            ))
        })?;

        let mut data = self.data.borrow_mut();
        #[cfg(test)]
        if let Some(error) = data.faults.put.clone() {
            return Err(error);
        }

        let records = data.collections.entry(collection.to_string()).or_default();
        for index in schema.indexes.iter().filter(|i| i.unique) {
            let Some(indexed) = value.get(&index.key_path).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = records
                .iter()
                .any(|(other_key, other)| other_key != &key && other.get(&index.key_path) == Some(indexed));
            if clash {
                return Err(StorageError::ConstraintViolation(format!(
                    "duplicate value for unique index '{}'",
                    index.name
                )));
            }
        }

        records.insert(key, value);
        data.writes += 1;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StorageError> {
        self.ensure_open().await?;
        self.config.collection(collection)?;
        let mut data = self.data.borrow_mut();
        #[cfg(test)]
        if let Some(error) = data.faults.delete.clone() {
            return Err(error);
        }
        if let Some(records) = data.collections.get_mut(collection) {
            records.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), StorageError> {
        self.ensure_open().await?;
        self.config.collection(collection)?;
        if let Some(records) = self.data.borrow_mut().collections.get_mut(collection) {
            records.clear();
        }
        Ok(())
    }

    async fn get_by_index<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<T>, StorageError> {
        self.ensure_open().await?;
        let schema = self.config.collection(collection)?;
        let index = schema.index(index).ok_or_else(|| {
            StorageError::TransactionFailed(format!("no index '{}' on '{}'", index, collection))
        })?;

        self.snapshot(collection)
            .into_iter()
            .filter(|record| record.get(&index.key_path).and_then(Value::as_str) == Some(value))
            .map(from_value)
            .collect()
    }
}

fn key_of(value: &Value, key_path: &str) -> Option<String> {
    value.get(key_path)?.as_str().map(str::to_string)
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, StorageError> {
    serde_json::from_value(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}
