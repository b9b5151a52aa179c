//! IndexedDB-based storage implementation for WASM targets.
//!
//! This module provides persistent storage using the browser's IndexedDB API.
//! It wraps the low-level web-sys bindings in a Rust-friendly async interface.
//! Records are stored as plain JS objects so the declared key path and
//! indexes apply to them directly.
//!
//! Native builds get the same type, but every operation fails with
//! `StorageError::Unavailable`, which callers treat as "no persistence".

use super::{RecordStore, StorageConfig, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use std::rc::Rc;

#[cfg(target_arch = "wasm32")]
use super::InitCell;
#[cfg(target_arch = "wasm32")]
use web_sys::IdbDatabase;

/// IndexedDB-backed record store.
///
/// The database is opened lazily on first use; all clones share one
/// connection.
#[derive(Clone)]
pub struct IndexedDbStore {
    config: Rc<StorageConfig>,
    #[cfg(target_arch = "wasm32")]
    db: InitCell<IdbDatabase>,
}

impl Default for IndexedDbStore {
    fn default() -> Self {
        Self::new(StorageConfig::default())
    }
}

impl IndexedDbStore {
    /// Creates a new IndexedDB store with the given configuration.
    ///
    /// Note: The database is opened lazily on first use.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config: Rc::new(config),
            #[cfg(target_arch = "wasm32")]
            db: InitCell::new(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns true if the IndexedDB API exists in the current context.
    pub fn is_available() -> bool {
        #[cfg(target_arch = "wasm32")]
        {
            web::idb_factory().is_ok()
        }
        #[cfg(not(target_arch = "wasm32"))]
        {
            false
        }
    }
}

#[cfg(target_arch = "wasm32")]
impl IndexedDbStore {
    async fn get_db(&self) -> Result<IdbDatabase, StorageError> {
        let config = self.config.clone();
        self.db
            .get_or_init(move || web::open_database(config))
            .await
    }
}

#[cfg(target_arch = "wasm32")]
impl RecordStore for IndexedDbStore {
    async fn init(&self) -> Result<(), StorageError> {
        self.get_db().await.map(|_| ())
    }

    async fn get_all<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
    ) -> Result<Vec<T>, StorageError> {
        let db = self.get_db().await?;
        let (_, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readonly)?;
        let request = store.get_all().map_err(web::transaction_error)?;
        let result = web::wait_for_request(&request).await?;
        web::from_js_array(&result)
    }

    async fn get<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let db = self.get_db().await?;
        let (_, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readonly)?;
        let request = store
            .get(&wasm_bindgen::JsValue::from_str(key))
            .map_err(web::transaction_error)?;
        let result = web::wait_for_request(&request).await?;

        if result.is_undefined() || result.is_null() {
            return Ok(None);
        }
        web::from_js(result).map(Some)
    }

    async fn put<T: Serialize + 'static>(
        &self,
        collection: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let js_value = web::to_js(value)?;
        let db = self.get_db().await?;
        let (tx, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readwrite)?;
        store.put(&js_value).map_err(web::transaction_error)?;
        web::wait_for_transaction(&tx).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StorageError> {
        let db = self.get_db().await?;
        let (tx, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readwrite)?;
        store
            .delete(&wasm_bindgen::JsValue::from_str(key))
            .map_err(web::transaction_error)?;
        web::wait_for_transaction(&tx).await
    }

    async fn clear(&self, collection: &str) -> Result<(), StorageError> {
        let db = self.get_db().await?;
        let (tx, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readwrite)?;
        store.clear().map_err(web::transaction_error)?;
        web::wait_for_transaction(&tx).await
    }

    async fn get_by_index<T: DeserializeOwned + 'static>(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> Result<Vec<T>, StorageError> {
        let db = self.get_db().await?;
        let (_, store) = web::object_store(&db, collection, web_sys::IdbTransactionMode::Readonly)?;
        let request = store
            .index(index)
            .map_err(web::transaction_error)?
            .get_all_with_key(&wasm_bindgen::JsValue::from_str(value))
            .map_err(web::transaction_error)?;
        let result = web::wait_for_request(&request).await?;
        web::from_js_array(&result)
    }
}

// Native stub - browser storage never exists outside the browser.
#[cfg(not(target_arch = "wasm32"))]
impl RecordStore for IndexedDbStore {
    async fn init(&self) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn get_all<T: DeserializeOwned + 'static>(
        &self,
        _collection: &str,
    ) -> Result<Vec<T>, StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn get<T: DeserializeOwned + 'static>(
        &self,
        _collection: &str,
        _key: &str,
    ) -> Result<Option<T>, StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn put<T: Serialize + 'static>(
        &self,
        _collection: &str,
        _value: &T,
    ) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn delete(&self, _collection: &str, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn clear(&self, _collection: &str) -> Result<(), StorageError> {
        Err(StorageError::Unavailable)
    }

    async fn get_by_index<T: DeserializeOwned + 'static>(
        &self,
        _collection: &str,
        _index: &str,
        _value: &str,
    ) -> Result<Vec<T>, StorageError> {
        Err(StorageError::Unavailable)
    }
}

#[cfg(target_arch = "wasm32")]
mod web {
    use crate::storage::{CollectionSchema, StorageConfig, StorageError};
    use js_sys::Array;
    use serde::{de::DeserializeOwned, Serialize};
    use std::cell::RefCell;
    use std::rc::Rc;
    use wasm_bindgen::prelude::*;
    use wasm_bindgen::JsCast;
    use web_sys::{
        IdbDatabase, IdbFactory, IdbIndexParameters, IdbObjectStore, IdbObjectStoreParameters,
        IdbOpenDbRequest, IdbRequest, IdbTransaction, IdbTransactionMode, IdbVersionChangeEvent,
        WorkerGlobalScope,
    };

    /// Finds the IndexedDB factory on the window or worker global scope.
    pub(super) fn idb_factory() -> Result<IdbFactory, StorageError> {
        let global = js_sys::global();
        let factory = if let Some(window) = global.dyn_ref::<web_sys::Window>() {
            window.indexed_db()
        } else if let Some(worker) = global.dyn_ref::<WorkerGlobalScope>() {
            worker.indexed_db()
        } else {
            return Err(StorageError::Unavailable);
        };
        factory
            .ok()
            .flatten()
            .ok_or(StorageError::Unavailable)
    }

    /// Opens the database, creating/upgrading schema as needed.
    pub(super) async fn open_database(
        config: Rc<StorageConfig>,
    ) -> Result<IdbDatabase, StorageError> {
        let factory = idb_factory()?;

        let open_request = factory
            .open_with_u32(&config.database_name, config.version)
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{:?}", e)))?;

        let upgrade_config = config.clone();
        let onupgradeneeded = Closure::wrap(Box::new(move |event: IdbVersionChangeEvent| {
            let Some(request) = event
                .target()
                .and_then(|t| t.dyn_into::<IdbOpenDbRequest>().ok())
            else {
                log::error!("Upgrade event without an open request");
                return;
            };
            log::info!(
                "Upgrading IndexedDB {} from v{} to v{}",
                upgrade_config.database_name,
                event.old_version() as u32,
                upgrade_config.version
            );
            if let Err(e) = upgrade_schema(&request, &upgrade_config) {
                log::error!("Schema upgrade failed: {}", e);
                if let Some(tx) = request.transaction() {
                    let _ = tx.abort();
                }
            }
        }) as Box<dyn FnMut(_)>);

        open_request.set_onupgradeneeded(Some(onupgradeneeded.as_ref().unchecked_ref()));

        let db_result = wait_for_request(&open_request).await.map_err(|e| match e {
            StorageError::TransactionFailed(msg) => StorageError::DatabaseOpenFailed(msg),
            other => other,
        });
        open_request.set_onupgradeneeded(None);
        drop(onupgradeneeded);

        let db: IdbDatabase = db_result?.dyn_into().map_err(|_| {
            StorageError::DatabaseOpenFailed("Failed to cast to IdbDatabase".to_string())
        })?;

        log::info!(
            "Opened IndexedDB {} v{}",
            config.database_name,
            config.version
        );

        Ok(db)
    }

    /// Declares collections and indexes that do not exist yet.
    fn upgrade_schema(
        request: &IdbOpenDbRequest,
        config: &StorageConfig,
    ) -> Result<(), StorageError> {
        let db: IdbDatabase = request
            .result()
            .map_err(|e| StorageError::DatabaseOpenFailed(format!("{:?}", e)))?
            .dyn_into()
            .map_err(|_| StorageError::DatabaseOpenFailed("Expected IdbDatabase".to_string()))?;

        for schema in &config.collections {
            let store = if db.object_store_names().contains(&schema.name) {
                // Existing collection: reach it through the upgrade transaction.
                request
                    .transaction()
                    .ok_or_else(|| {
                        StorageError::DatabaseOpenFailed("No upgrade transaction".to_string())
                    })?
                    .object_store(&schema.name)
                    .map_err(|e| StorageError::DatabaseOpenFailed(format!("{:?}", e)))?
            } else {
                let params = IdbObjectStoreParameters::new();
                params.set_key_path(&JsValue::from_str(&schema.key_path));
                let store = db
                    .create_object_store_with_optional_parameters(&schema.name, &params)
                    .map_err(|e| StorageError::DatabaseOpenFailed(format!("{:?}", e)))?;
                log::info!("Created {} store", schema.name);
                store
            };
            create_missing_indexes(&store, schema)?;
        }
        Ok(())
    }

    fn create_missing_indexes(
        store: &IdbObjectStore,
        schema: &CollectionSchema,
    ) -> Result<(), StorageError> {
        let existing = store.index_names();
        for index in &schema.indexes {
            if existing.contains(&index.name) {
                continue;
            }
            let params = IdbIndexParameters::new();
            params.set_unique(index.unique);
            store
                .create_index_with_str_and_optional_parameters(&index.name, &index.key_path, &params)
                .map_err(|e| StorageError::DatabaseOpenFailed(format!("{:?}", e)))?;
            log::info!("Created index {} on {}", index.name, schema.name);
        }
        Ok(())
    }

    /// Opens a one-collection transaction and returns it with its object store.
    pub(super) fn object_store(
        db: &IdbDatabase,
        collection: &str,
        mode: IdbTransactionMode,
    ) -> Result<(IdbTransaction, IdbObjectStore), StorageError> {
        if !db.object_store_names().contains(collection) {
            return Err(StorageError::UnknownCollection(collection.to_string()));
        }
        let tx = db
            .transaction_with_str_and_mode(collection, mode)
            .map_err(transaction_error)?;
        let store = tx.object_store(collection).map_err(transaction_error)?;
        Ok((tx, store))
    }

    pub(super) fn transaction_error(e: JsValue) -> StorageError {
        match e.dyn_ref::<web_sys::DomException>() {
            Some(exception) => dom_error(exception),
            None => StorageError::TransactionFailed(format!("{:?}", e)),
        }
    }

    fn dom_error(exception: &web_sys::DomException) -> StorageError {
        match exception.name().as_str() {
            "QuotaExceededError" => StorageError::QuotaExceeded,
            "ConstraintError" => StorageError::ConstraintViolation(exception.message()),
            _ => StorageError::TransactionFailed(exception.message()),
        }
    }

    pub(super) fn to_js<T: Serialize>(value: &T) -> Result<JsValue, StorageError> {
        let serializer = serde_wasm_bindgen::Serializer::json_compatible();
        value
            .serialize(&serializer)
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    pub(super) fn from_js<T: DeserializeOwned>(value: JsValue) -> Result<T, StorageError> {
        serde_wasm_bindgen::from_value(value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    pub(super) fn from_js_array<T: DeserializeOwned>(value: &JsValue) -> Result<Vec<T>, StorageError> {
        Array::from(value).iter().map(from_js).collect()
    }

    /// Waits for an IDB request to complete.
    pub(super) async fn wait_for_request(request: &IdbRequest) -> Result<JsValue, StorageError> {
        let (tx, rx) = futures_channel::oneshot::channel::<Result<JsValue, StorageError>>();
        let tx = Rc::new(RefCell::new(Some(tx)));

        let tx_success = tx.clone();
        let success_request = request.clone();
        let onsuccess = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let result = success_request.result().unwrap_or(JsValue::UNDEFINED);
            if let Some(tx) = tx_success.borrow_mut().take() {
                let _ = tx.send(Ok(result));
            }
        }) as Box<dyn FnMut(_)>);

        let tx_error = tx;
        let error_request = request.clone();
        let onerror = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            let error = error_request
                .error()
                .ok()
                .flatten()
                .map(|e| dom_error(&e))
                .unwrap_or_else(|| StorageError::TransactionFailed("Unknown error".to_string()));
            if let Some(tx) = tx_error.borrow_mut().take() {
                let _ = tx.send(Err(error));
            }
        }) as Box<dyn FnMut(_)>);

        request.set_onsuccess(Some(onsuccess.as_ref().unchecked_ref()));
        request.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        let result = rx
            .await
            .map_err(|_| StorageError::Other("Channel closed".to_string()));

        request.set_onsuccess(None);
        request.set_onerror(None);

        drop(onsuccess);
        drop(onerror);

        result?
    }

    /// Waits for an IDB transaction to commit.
    ///
    /// A write is only durable once the transaction completes; an aborted
    /// transaction leaves the previous record in place.
    pub(super) async fn wait_for_transaction(tx: &IdbTransaction) -> Result<(), StorageError> {
        let (sender, rx) = futures_channel::oneshot::channel::<Result<(), StorageError>>();
        let sender = Rc::new(RefCell::new(Some(sender)));

        let tx_complete = sender.clone();
        let oncomplete = Closure::wrap(Box::new(move |_: web_sys::Event| {
            if let Some(tx) = tx_complete.borrow_mut().take() {
                let _ = tx.send(Ok(()));
            }
        }) as Box<dyn FnMut(_)>);

        let tx_failed = sender;
        let failed_tx = tx.clone();
        let onfailed = Closure::wrap(Box::new(move |_: web_sys::Event| {
            let error = failed_tx
                .error()
                .map(|e| dom_error(&e))
                .unwrap_or_else(|| StorageError::TransactionFailed("Transaction aborted".to_string()));
            if let Some(tx) = tx_failed.borrow_mut().take() {
                let _ = tx.send(Err(error));
            }
        }) as Box<dyn FnMut(_)>);

        tx.set_oncomplete(Some(oncomplete.as_ref().unchecked_ref()));
        tx.set_onerror(Some(onfailed.as_ref().unchecked_ref()));
        tx.set_onabort(Some(onfailed.as_ref().unchecked_ref()));

        let result = rx
            .await
            .map_err(|_| StorageError::Other("Channel closed".to_string()));

        tx.set_oncomplete(None);
        tx.set_onerror(None);
        tx.set_onabort(None);

        drop(oncomplete);
        drop(onfailed);

        result?
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::storage::DRAFTS;
    use futures_executor::block_on;

    #[test]
    fn test_native_build_reports_unavailable() {
        let store = IndexedDbStore::default();
        assert!(!IndexedDbStore::is_available());
        assert_eq!(store.config().database_name, "ouvidoria-drafts");

        let err = block_on(store.init()).unwrap_err();
        assert!(err.is_unavailable());
        let err = block_on(store.get::<serde_json::Value>(DRAFTS, "x")).unwrap_err();
        assert!(err.is_unavailable());
    }
}
