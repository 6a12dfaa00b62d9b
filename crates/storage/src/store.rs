//! Provider façade.
//!
//! Chooses a backend, gates transactions through the lock helper and offers
//! one-shot helpers that each run in their own scoped transaction.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use docstore_common::Document;
use docstore_common::fulltext::FullTextTermResolution;
use docstore_common::keys::Key;
use docstore_common::schema::DbSchema;

use crate::api::{SortOrder, StoreEngine};
use crate::error::StoreError;
use crate::lock::TransactionLockHelper;
use crate::store_db::in_memory::InMemoryStoreEngine;
#[cfg(feature = "sql")]
use crate::store_db::sql::SqlStoreEngine;
use crate::transaction::{IndexHandle, StoreHandle, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    InMemory,
    #[cfg(feature = "sql")]
    Sql,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Logs every one-shot operation at debug level instead of trace.
    pub verbose: bool,
    /// Strips U+2028/U+2029 from stored JSON for hosts that cannot hold
    /// them.
    pub requires_unicode_replacement: bool,
}

#[derive(Clone)]
pub struct Provider {
    engine: Arc<dyn StoreEngine>,
    locks: TransactionLockHelper,
    schema: Arc<DbSchema>,
    options: ProviderOptions,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("engine", &self.engine).finish()
    }
}

/// Tries each candidate engine in order and returns the first that opens.
/// Errors accumulate; when every candidate fails the caller gets the single
/// error if there was one candidate, otherwise the whole list.
pub async fn open_list_of_providers(
    candidates: &[EngineType],
    path: &str,
    schema: &DbSchema,
    wipe_if_exists: bool,
    options: &ProviderOptions,
) -> Result<Provider, StoreError> {
    let mut errors = Vec::new();
    for engine_type in candidates {
        match Provider::open(
            path,
            *engine_type,
            schema.clone(),
            wipe_if_exists,
            options.clone(),
        )
        .await
        {
            Ok(provider) => return Ok(provider),
            Err(err) => {
                warn!("provider {engine_type:?} failed to open: {err}");
                errors.push(err);
            }
        }
    }
    match errors.len() {
        0 => Err(StoreError::BackendUnavailable(
            "no candidate providers given".to_string(),
        )),
        1 => Err(errors.remove(0)),
        _ => Err(StoreError::AllProvidersFailed(errors)),
    }
}

impl Provider {
    /// Opens a database at `path` (ignored by the in-memory engine) with the
    /// declared schema, migrating or wiping as needed.
    pub async fn open(
        path: &str,
        engine_type: EngineType,
        schema: DbSchema,
        wipe_if_exists: bool,
        options: ProviderOptions,
    ) -> Result<Self, StoreError> {
        schema.validate()?;
        info!("starting docstore engine ({engine_type:?})");
        let engine: Arc<dyn StoreEngine> = match engine_type {
            EngineType::InMemory => {
                let _ = (path, wipe_if_exists);
                Arc::new(InMemoryStoreEngine::new(schema.clone()))
            }
            #[cfg(feature = "sql")]
            EngineType::Sql => Arc::new(
                SqlStoreEngine::open(
                    path,
                    schema.clone(),
                    wipe_if_exists,
                    options.requires_unicode_replacement,
                )
                .await?,
            ),
        };
        let locks = TransactionLockHelper::new(&schema);
        info!("started docstore engine");
        Ok(Provider {
            engine,
            locks,
            schema: Arc::new(schema),
            options,
        })
    }

    pub fn schema(&self) -> &DbSchema {
        &self.schema
    }

    /// Opens a transaction over the named stores, waiting on the lock
    /// helper when the stores are busy.
    pub async fn open_transaction(
        &self,
        store_names: &[&str],
        write_needed: bool,
    ) -> Result<Transaction, StoreError> {
        let names: Vec<String> = store_names.iter().map(|name| name.to_string()).collect();
        let token = self.locks.open_transaction(&names, write_needed).await?;
        match self.engine.begin_transaction(&names, write_needed).await {
            Ok(engine_txn) => Ok(Transaction::new(engine_txn, token, self.locks.clone())),
            Err(err) => {
                self.locks.transaction_failed(&token, &err.to_string());
                Err(err)
            }
        }
    }

    /// Refuses new transactions and resolves once in-flight ones finish.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.locks.close_when_possible().await?;
        self.engine.close().await
    }

    pub async fn delete_database(&self) -> Result<(), StoreError> {
        self.engine.delete_database().await
    }

    fn log_operation(&self, operation: &str, store_name: &str) {
        if self.options.verbose {
            debug!(store = store_name, "{operation}");
        } else {
            trace!(store = store_name, "{operation}");
        }
    }

    pub async fn get(
        &self,
        store_name: &str,
        key: impl Into<Key>,
    ) -> Result<Option<Document>, StoreError> {
        self.log_operation("get", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            store.get(key).await
        };
        finish(txn, result).await
    }

    pub async fn get_multiple(
        &self,
        store_name: &str,
        keys: &[Key],
    ) -> Result<Vec<Document>, StoreError> {
        self.log_operation("get_multiple", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            store.get_multiple(keys).await
        };
        finish(txn, result).await
    }

    pub async fn put(&self, store_name: &str, items: &[Document]) -> Result<(), StoreError> {
        self.log_operation("put", store_name);
        let txn = self.open_transaction(&[store_name], true).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            store.put(items).await
        };
        finish(txn, result).await
    }

    pub async fn remove(&self, store_name: &str, keys: &[Key]) -> Result<(), StoreError> {
        self.log_operation("remove", store_name);
        let txn = self.open_transaction(&[store_name], true).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            store.remove(keys).await
        };
        finish(txn, result).await
    }

    pub async fn clear_all_data(&self, store_name: &str) -> Result<(), StoreError> {
        self.log_operation("clear_all_data", store_name);
        let txn = self.open_transaction(&[store_name], true).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            store.clear_all_data().await
        };
        finish(txn, result).await
    }

    pub async fn get_all(
        &self,
        store_name: &str,
        index_name: Option<&str>,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.log_operation("get_all", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => index.get_all(sort, limit, offset).await,
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    pub async fn get_only(
        &self,
        store_name: &str,
        index_name: Option<&str>,
        key: impl Into<Key>,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.log_operation("get_only", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => index.get_only(key, sort, limit, offset).await,
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_range(
        &self,
        store_name: &str,
        index_name: Option<&str>,
        key_low: impl Into<Key>,
        key_high: impl Into<Key>,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.log_operation("get_range", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => {
                    index
                        .get_range(
                            key_low,
                            key_high,
                            low_exclusive,
                            high_exclusive,
                            sort,
                            limit,
                            offset,
                        )
                        .await
                }
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    pub async fn count_all(
        &self,
        store_name: &str,
        index_name: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.log_operation("count_all", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => index.count_all().await,
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    pub async fn count_only(
        &self,
        store_name: &str,
        index_name: Option<&str>,
        key: impl Into<Key>,
    ) -> Result<u64, StoreError> {
        self.log_operation("count_only", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => index.count_only(key).await,
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    pub async fn count_range(
        &self,
        store_name: &str,
        index_name: Option<&str>,
        key_low: impl Into<Key>,
        key_high: impl Into<Key>,
        low_exclusive: bool,
        high_exclusive: bool,
    ) -> Result<u64, StoreError> {
        self.log_operation("count_range", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match open_index(&store, index_name) {
                Ok(index) => {
                    index
                        .count_range(key_low, key_high, low_exclusive, high_exclusive)
                        .await
                }
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }

    pub async fn full_text_search(
        &self,
        store_name: &str,
        index_name: &str,
        search_phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.log_operation("full_text_search", store_name);
        let txn = self.open_transaction(&[store_name], false).await?;
        let result = {
            let store = txn.get_store(store_name)?;
            match store.open_index(index_name) {
                Ok(index) => index.full_text_search(search_phrase, resolution, limit).await,
                Err(err) => Err(err),
            }
        };
        finish(txn, result).await
    }
}

fn open_index<'s>(
    store: &'s StoreHandle<'s>,
    index_name: Option<&str>,
) -> Result<IndexHandle<'s>, StoreError> {
    match index_name {
        Some(name) => store.open_index(name),
        None => store.open_primary_key(),
    }
}

/// Commits on success; aborts (best effort) on failure so the error keeps
/// propagating.
async fn finish<T>(txn: Transaction, result: Result<T, StoreError>) -> Result<T, StoreError> {
    match result {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let _ = txn.abort().await;
            Err(err)
        }
    }
}
