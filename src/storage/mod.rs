//! Generic storage abstraction for persistent records.
//!
//! This module provides a collection-oriented interface over a transactional
//! key-value database. On WASM targets, `IndexedDbStore` persists records in the
//! browser's IndexedDB. On native targets the same type reports
//! `StorageError::Unavailable`, and `MemoryStore` offers a non-persistent
//! implementation with the same schema semantics.
//!
//! ## Schema
//! ```text
//! IndexedDB "ouvidoria-drafts"
//! ├── drafts     - keyPath "id", indexes: updatedAt, status
//! └── submitted  - keyPath "id", indexes: protocol (unique), updatedAt
//! ```

mod indexeddb;
mod init;
mod memory;

pub use indexeddb::IndexedDbStore;
pub use init::InitCell;
pub use memory::MemoryStore;

#[cfg(test)]
pub(crate) use memory::Faults;

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

/// Collection holding in-progress drafts.
pub const DRAFTS: &str = "drafts";

/// Collection holding server-acknowledged submissions.
pub const SUBMITTED: &str = "submitted";

/// Index names. Each index is declared on the record field of the same name.
pub const INDEX_UPDATED_AT: &str = "updatedAt";
pub const INDEX_STATUS: &str = "status";
pub const INDEX_PROTOCOL: &str = "protocol";

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The browser storage API does not exist in this execution context.
    #[error("browser storage is not available in this environment")]
    Unavailable,
    /// The database could not be opened or upgraded.
    #[error("database open failed: {0}")]
    DatabaseOpenFailed(String),
    /// A transaction failed to complete.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    /// The write did not fit into the origin's storage quota.
    #[error("storage quota exceeded")]
    QuotaExceeded,
    /// A unique index or key path constraint was violated.
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),
    /// The collection is not declared in the schema.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),
    /// An unexpected error occurred.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Returns true when persistence is impossible in the current environment,
    /// as opposed to a failure of one particular operation.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable)
    }
}

/// A collection-oriented record storage interface.
///
/// Every record carries its own primary key under the collection's key path,
/// so `put` takes only the value. Each operation runs in its own short-lived
/// transaction scoped to one collection.
///
/// Note: This trait does not require `Send` bounds since WASM is single-threaded
/// and JS types cannot be sent between threads.
pub trait RecordStore {
    /// Opens the database, declaring collections and indexes on first run.
    ///
    /// Safe to call any number of times; concurrent callers share one open.
    fn init(&self) -> impl Future<Output = Result<(), StorageError>>;

    /// Retrieves every record of a collection, ordered by primary key.
    fn get_all<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<T>, StorageError>>;

    /// Retrieves a record by primary key.
    ///
    /// Returns `Ok(None)` if the key doesn't exist.
    fn get<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<T>, StorageError>>;

    /// Stores a record, overwriting any record with the same primary key.
    fn put<T: Serialize + 'static>(
        &self,
        collection: &str,
        value: &T,
    ) -> impl Future<Output = Result<(), StorageError>>;

    /// Deletes a record by primary key.
    ///
    /// Returns `Ok(())` even if the key didn't exist.
    fn delete(&self, collection: &str, key: &str) -> impl Future<Output = Result<(), StorageError>>;

    /// Removes all records from a collection.
    fn clear(&self, collection: &str) -> impl Future<Output = Result<(), StorageError>>;

    /// Retrieves all records whose indexed field equals `value`.
    fn get_by_index<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> impl Future<Output = Result<Vec<T>, StorageError>>;
}

/// A secondary index declared on a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: String,
    /// Record field the index is built on.
    pub key_path: String,
    pub unique: bool,
}

impl IndexSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A named collection (IndexedDB object store) and its indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    /// Record field holding the primary key.
    pub key_path: String,
    pub indexes: Vec<IndexSchema>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Configuration for creating a storage instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Name of the database (used as IndexedDB database name on web).
    pub database_name: String,
    /// Database version (incrementing triggers upgrade).
    pub version: u32,
    /// Collections declared on upgrade.
    pub collections: Vec<CollectionSchema>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_name: "ouvidoria-drafts".to_string(),
            version: 1,
            collections: vec![
                CollectionSchema::new(DRAFTS, "id")
                    .with_index(IndexSchema::new(INDEX_UPDATED_AT, "updatedAt"))
                    .with_index(IndexSchema::new(INDEX_STATUS, "status")),
                CollectionSchema::new(SUBMITTED, "id")
                    .with_index(IndexSchema::new(INDEX_PROTOCOL, "protocol").unique())
                    .with_index(IndexSchema::new(INDEX_UPDATED_AT, "updatedAt")),
            ],
        }
    }
}

impl StorageConfig {
    /// Creates a configuration with the default schema under another database name.
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            ..Self::default()
        }
    }

    /// Sets the database version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Looks up a declared collection.
    pub fn collection(&self, name: &str) -> Result<&CollectionSchema, StorageError> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| StorageError::UnknownCollection(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_matches_record_layout() {
        let config = StorageConfig::default();

        let drafts = config.collection(DRAFTS).unwrap();
        assert_eq!(drafts.key_path, "id");
        assert!(drafts.index(INDEX_UPDATED_AT).is_some());
        assert!(!drafts.index(INDEX_STATUS).unwrap().unique);

        let submitted = config.collection(SUBMITTED).unwrap();
        assert!(submitted.index(INDEX_PROTOCOL).unwrap().unique);
        assert!(submitted.index(INDEX_STATUS).is_none());
    }

    #[test]
    fn test_unknown_collection() {
        let config = StorageConfig::new("other").with_version(3);
        assert_eq!(config.version, 3);
        assert_eq!(
            config.collection("archive"),
            Err(StorageError::UnknownCollection("archive".to_string()))
        );
    }
}
