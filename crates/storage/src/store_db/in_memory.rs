//! In-memory engine.
//!
//! Committed data lives in one ordered map per store, keyed by serialized
//! primary key, next to one ordered tree per index keyed by serialized index
//! key. A write transaction clones the committed map as its working set and
//! maintains the index trees in place; commit swaps the working set in,
//! abort rebuilds the trees from the untouched committed data.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use docstore_common::Document;
use docstore_common::fulltext::{FullTextTermResolution, break_and_normalize_search_phrase};
use docstore_common::keypath::{get_key_for_keypath, serialized_index_entries};
use docstore_common::keys::{Key, form_list_of_serialized_keys, serialize_key_to_string};
use docstore_common::schema::{DbSchema, IndexSchema, StoreSchema};

use crate::api::{IndexAccess, SortOrder, StoreAccess, StoreEngine, TransactionEngine};
use crate::error::StoreError;

type IndexTree = BTreeMap<String, Vec<Document>>;

#[derive(Clone)]
pub struct InMemoryStoreEngine {
    schema: Arc<DbSchema>,
    inner: Arc<Mutex<EngineState>>,
}

#[derive(Debug)]
struct EngineState {
    stores: HashMap<String, MemStore>,
    closed: bool,
}

#[derive(Debug, Default)]
struct MemStore {
    data: BTreeMap<String, Document>,
    indexes: HashMap<String, IndexTree>,
}

impl InMemoryStoreEngine {
    pub fn new(schema: DbSchema) -> Self {
        let stores = schema
            .stores
            .iter()
            .map(|store| {
                let indexes = store
                    .indexes
                    .iter()
                    .map(|index| (index.name.clone(), IndexTree::new()))
                    .collect();
                (
                    store.name.clone(),
                    MemStore {
                        data: BTreeMap::new(),
                        indexes,
                    },
                )
            })
            .collect();
        InMemoryStoreEngine {
            schema: Arc::new(schema),
            inner: Arc::new(Mutex::new(EngineState {
                stores,
                closed: false,
            })),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, EngineState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Custom("failed to lock the in-memory store".to_string()))
    }
}

impl Debug for InMemoryStoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStoreEngine").finish()
    }
}

#[async_trait::async_trait]
impl StoreEngine for InMemoryStoreEngine {
    async fn begin_transaction(
        &self,
        store_names: &[String],
        write_needed: bool,
    ) -> Result<Box<dyn TransactionEngine>, StoreError> {
        let working = {
            let state = self.state()?;
            if state.closed {
                return Err(StoreError::BackendUnavailable(
                    "the in-memory store is closed".to_string(),
                ));
            }
            let mut working = HashMap::new();
            if write_needed {
                for name in store_names {
                    let store = state
                        .stores
                        .get(name)
                        .ok_or_else(|| StoreError::StoreNotFound(name.clone()))?;
                    working.insert(name.clone(), store.data.clone());
                }
            }
            working
        };
        Ok(Box::new(MemTransaction {
            engine: self.clone(),
            store_names: store_names.to_vec(),
            write: write_needed,
            working: Mutex::new(working),
        }))
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.state()?.closed = true;
        Ok(())
    }

    async fn delete_database(&self) -> Result<(), StoreError> {
        let mut state = self.state()?;
        for store in state.stores.values_mut() {
            store.data.clear();
            for tree in store.indexes.values_mut() {
                tree.clear();
            }
        }
        Ok(())
    }
}

struct MemTransaction {
    engine: InMemoryStoreEngine,
    store_names: Vec<String>,
    write: bool,
    /// Serialized-PK -> document working sets, one per writable store.
    working: Mutex<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemTransaction {
    fn working(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<String, BTreeMap<String, Document>>>, StoreError> {
        self.working
            .lock()
            .map_err(|_| StoreError::Custom("failed to lock the working set".to_string()))
    }
}

#[async_trait::async_trait]
impl TransactionEngine for MemTransaction {
    fn store(&self, store_name: &str) -> Result<Box<dyn StoreAccess + '_>, StoreError> {
        let store_schema = self
            .engine
            .schema
            .store(store_name)
            .ok_or_else(|| StoreError::StoreNotFound(store_name.to_string()))?;
        if !self.store_names.iter().any(|name| name == store_name) {
            return Err(StoreError::Custom(format!(
                "store {store_name} is not part of this transaction"
            )));
        }
        Ok(Box::new(MemStoreAccess {
            txn: self,
            store_schema,
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if !self.write {
            return Ok(());
        }
        let mut working = self.working()?;
        let mut state = self.engine.state()?;
        for (name, data) in working.drain() {
            if let Some(store) = state.stores.get_mut(&name) {
                store.data = data;
            }
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), StoreError> {
        if !self.write {
            return Ok(());
        }
        let mut state = self.engine.state()?;
        for name in &self.store_names {
            let Some(store_schema) = self.engine.schema.store(name) else {
                continue;
            };
            if let Some(store) = state.stores.get_mut(name) {
                rebuild_indexes(store, store_schema);
            }
        }
        Ok(())
    }
}

fn rebuild_indexes(store: &mut MemStore, store_schema: &StoreSchema) {
    for index in &store_schema.indexes {
        let mut tree = IndexTree::new();
        for doc in store.data.values() {
            if let Ok(entries) = serialized_index_entries(index, doc) {
                for entry in entries {
                    tree.entry(entry).or_default().push(doc.clone());
                }
            }
        }
        store.indexes.insert(index.name.clone(), tree);
    }
}

fn primary_key_of(store_schema: &StoreSchema, doc: &Document) -> Option<String> {
    let key = get_key_for_keypath(doc, &store_schema.primary_key_path).ok()??;
    serialize_key_to_string(&key, &store_schema.primary_key_path).ok()
}

fn add_index_entries(
    store: &mut MemStore,
    store_schema: &StoreSchema,
    doc: &Document,
) -> Result<(), StoreError> {
    for index in &store_schema.indexes {
        let entries = serialized_index_entries(index, doc)?;
        let tree = store.indexes.entry(index.name.clone()).or_default();
        for entry in entries {
            tree.entry(entry).or_default().push(doc.clone());
        }
    }
    Ok(())
}

fn remove_index_entries(
    store: &mut MemStore,
    store_schema: &StoreSchema,
    doc: &Document,
    serialized_pk: &str,
) {
    for index in &store_schema.indexes {
        let Ok(entries) = serialized_index_entries(index, doc) else {
            continue;
        };
        let Some(tree) = store.indexes.get_mut(&index.name) else {
            continue;
        };
        for entry in entries {
            if let Some(docs) = tree.get_mut(&entry) {
                docs.retain(|candidate| {
                    primary_key_of(store_schema, candidate).as_deref() != Some(serialized_pk)
                });
                if docs.is_empty() {
                    tree.remove(&entry);
                }
            }
        }
    }
}

struct MemStoreAccess<'t> {
    txn: &'t MemTransaction,
    store_schema: &'t StoreSchema,
}

impl MemStoreAccess<'_> {
    fn serialize_pk(&self, key: &Key) -> Result<String, StoreError> {
        Ok(serialize_key_to_string(
            key,
            &self.store_schema.primary_key_path,
        )?)
    }

    fn require_write(&self) -> Result<(), StoreError> {
        if self.txn.write {
            Ok(())
        } else {
            Err(StoreError::Custom(
                "write operation on a read-only transaction".to_string(),
            ))
        }
    }

    fn read_doc(&self, serialized_pk: &str) -> Result<Option<Document>, StoreError> {
        if self.txn.write {
            let working = self.txn.working()?;
            Ok(working
                .get(&self.store_schema.name)
                .and_then(|data| data.get(serialized_pk))
                .cloned())
        } else {
            let state = self.txn.engine.state()?;
            Ok(state
                .stores
                .get(&self.store_schema.name)
                .and_then(|store| store.data.get(serialized_pk))
                .cloned())
        }
    }
}

#[async_trait::async_trait]
impl StoreAccess for MemStoreAccess<'_> {
    async fn get(&self, key: &Key) -> Result<Option<Document>, StoreError> {
        let pk = self.serialize_pk(key)?;
        self.read_doc(&pk)
    }

    async fn get_multiple(&self, keys: &[Key]) -> Result<Vec<Document>, StoreError> {
        let pks = form_list_of_serialized_keys(keys, &self.store_schema.primary_key_path)?;
        let mut found = Vec::new();
        for pk in pks {
            if let Some(doc) = self.read_doc(&pk)? {
                found.push(doc);
            }
        }
        Ok(found)
    }

    async fn put(&self, items: &[Document]) -> Result<(), StoreError> {
        self.require_write()?;
        let mut working = self.txn.working()?;
        let mut state = self.txn.engine.state()?;
        let data = working
            .get_mut(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        let store = state
            .stores
            .get_mut(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        for item in items {
            let key = get_key_for_keypath(item, &self.store_schema.primary_key_path)?
                .ok_or_else(|| {
                    StoreError::Custom(format!(
                        "document has no primary key at {:?}",
                        self.store_schema.primary_key_path
                    ))
                })?;
            let pk = serialize_key_to_string(&key, &self.store_schema.primary_key_path)?;
            if let Some(previous) = data.insert(pk.clone(), item.clone()) {
                remove_index_entries(store, self.store_schema, &previous, &pk);
            }
            add_index_entries(store, self.store_schema, item)?;
        }
        Ok(())
    }

    async fn remove(&self, keys: &[Key]) -> Result<(), StoreError> {
        self.require_write()?;
        let pks = form_list_of_serialized_keys(keys, &self.store_schema.primary_key_path)?;
        let mut working = self.txn.working()?;
        let mut state = self.txn.engine.state()?;
        let data = working
            .get_mut(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        let store = state
            .stores
            .get_mut(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        for pk in pks {
            if let Some(previous) = data.remove(&pk) {
                remove_index_entries(store, self.store_schema, &previous, &pk);
            }
        }
        Ok(())
    }

    async fn clear_all_data(&self) -> Result<(), StoreError> {
        self.require_write()?;
        let mut working = self.txn.working()?;
        let mut state = self.txn.engine.state()?;
        if let Some(data) = working.get_mut(&self.store_schema.name) {
            data.clear();
        }
        if let Some(store) = state.stores.get_mut(&self.store_schema.name) {
            for tree in store.indexes.values_mut() {
                tree.clear();
            }
        }
        Ok(())
    }

    fn open_index(&self, index_name: &str) -> Result<Box<dyn IndexAccess + '_>, StoreError> {
        let index = self.store_schema.index(index_name).ok_or_else(|| {
            StoreError::IndexNotFound(self.store_schema.name.clone(), index_name.to_string())
        })?;
        Ok(Box::new(MemIndexAccess {
            txn: self.txn,
            store_schema: self.store_schema,
            index: Some(index),
        }))
    }

    fn open_primary_key(&self) -> Result<Box<dyn IndexAccess + '_>, StoreError> {
        Ok(Box::new(MemIndexAccess {
            txn: self.txn,
            store_schema: self.store_schema,
            index: None,
        }))
    }
}

struct MemIndexAccess<'t> {
    txn: &'t MemTransaction,
    store_schema: &'t StoreSchema,
    /// `None` queries the primary key.
    index: Option<&'t IndexSchema>,
}

fn take_page<'a>(
    iter: impl DoubleEndedIterator<Item = &'a Document>,
    sort: SortOrder,
    limit: Option<u64>,
    offset: Option<u64>,
) -> Vec<Document> {
    let offset = offset.unwrap_or(0) as usize;
    let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    match sort {
        SortOrder::Reverse => iter.rev().skip(offset).take(limit).cloned().collect(),
        SortOrder::Forward | SortOrder::None => {
            iter.skip(offset).take(limit).cloned().collect()
        }
    }
}

impl MemIndexAccess<'_> {
    fn key_path(&self) -> &docstore_common::schema::KeyPath {
        match self.index {
            Some(index) => &index.key_path,
            None => &self.store_schema.primary_key_path,
        }
    }

    fn serialize_bound(&self, key: &Key) -> Result<String, StoreError> {
        Ok(serialize_key_to_string(key, self.key_path())?)
    }

    /// Runs `consume` over the documents inside the given serialized-key
    /// bounds, in key order. Primary key scans in a write transaction read
    /// the transaction's own working set.
    fn scan<R>(
        &self,
        low: Bound<String>,
        high: Bound<String>,
        consume: impl FnOnce(&mut dyn DoubleEndedIterator<Item = &Document>) -> R,
    ) -> Result<R, StoreError> {
        if self.index.is_none() && self.txn.write {
            let working = self.txn.working()?;
            let data = working
                .get(&self.store_schema.name)
                .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
            let mut iter = data.range((low, high)).map(|(_, doc)| doc);
            return Ok(consume(&mut iter));
        }

        let state = self.txn.engine.state()?;
        let store = state
            .stores
            .get(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        match self.index {
            None => {
                let mut iter = store.data.range((low, high)).map(|(_, doc)| doc);
                Ok(consume(&mut iter))
            }
            Some(index) => {
                let tree = store.indexes.get(&index.name).ok_or_else(|| {
                    StoreError::IndexNotFound(self.store_schema.name.clone(), index.name.clone())
                })?;
                let mut iter = tree
                    .range((low, high))
                    .flat_map(|(_, docs)| docs.iter());
                Ok(consume(&mut iter))
            }
        }
    }

    fn full_text_matches(
        &self,
        index: &IndexSchema,
        terms: &[String],
        resolution: FullTextTermResolution,
    ) -> Result<BTreeMap<String, Document>, StoreError> {
        let state = self.txn.engine.state()?;
        let store = state
            .stores
            .get(&self.store_schema.name)
            .ok_or_else(|| StoreError::StoreNotFound(self.store_schema.name.clone()))?;
        let tree = store.indexes.get(&index.name).ok_or_else(|| {
            StoreError::IndexNotFound(self.store_schema.name.clone(), index.name.clone())
        })?;

        let mut merged: Option<BTreeMap<String, Document>> = None;
        for term in terms {
            let prefix = format!("C{term}");
            let mut matches = BTreeMap::new();
            for (_, docs) in tree
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
            {
                for doc in docs {
                    if let Some(pk) = primary_key_of(self.store_schema, doc) {
                        matches.insert(pk, doc.clone());
                    }
                }
            }
            merged = Some(match (merged, resolution) {
                (None, _) => matches,
                (Some(mut acc), FullTextTermResolution::And) => {
                    acc.retain(|pk, _| matches.contains_key(pk));
                    acc
                }
                (Some(mut acc), FullTextTermResolution::Or) => {
                    acc.extend(matches);
                    acc
                }
            });
        }
        Ok(merged.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl IndexAccess for MemIndexAccess<'_> {
    async fn get_all(
        &self,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.scan(Bound::Unbounded, Bound::Unbounded, |iter| {
            take_page(iter, sort, limit, offset)
        })
    }

    async fn get_only(
        &self,
        key: &Key,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.get_range(key, key, false, false, sort, limit, offset)
            .await
    }

    async fn get_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        let low = self.serialize_bound(key_low)?;
        let high = self.serialize_bound(key_high)?;
        let low = if low_exclusive {
            Bound::Excluded(low)
        } else {
            Bound::Included(low)
        };
        let high = if high_exclusive {
            Bound::Excluded(high)
        } else {
            Bound::Included(high)
        };
        self.scan(low, high, |iter| take_page(iter, sort, limit, offset))
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        self.scan(Bound::Unbounded, Bound::Unbounded, |iter| iter.count() as u64)
    }

    async fn count_only(&self, key: &Key) -> Result<u64, StoreError> {
        self.count_range(key, key, false, false).await
    }

    async fn count_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
    ) -> Result<u64, StoreError> {
        let low = self.serialize_bound(key_low)?;
        let high = self.serialize_bound(key_high)?;
        let low = if low_exclusive {
            Bound::Excluded(low)
        } else {
            Bound::Included(low)
        };
        let high = if high_exclusive {
            Bound::Excluded(high)
        } else {
            Bound::Included(high)
        };
        self.scan(low, high, |iter| iter.count() as u64)
    }

    async fn full_text_search(
        &self,
        search_phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        let Some(index) = self.index.filter(|index| index.full_text) else {
            return Err(StoreError::Custom(
                "full text search requires a full-text index".to_string(),
            ));
        };
        let terms = break_and_normalize_search_phrase(search_phrase);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let matches = self.full_text_matches(index, &terms, resolution)?;
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(matches.into_values().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn engine_with_index() -> InMemoryStoreEngine {
        let mut index = IndexSchema::new("key", "k.k");
        index.multi_entry = true;
        InMemoryStoreEngine::new(DbSchema::new(
            1,
            vec![StoreSchema::new("test", "id").with_index(index)],
        ))
    }

    fn names() -> Vec<String> {
        vec!["test".to_string()]
    }

    #[tokio::test]
    async fn commit_replaces_committed_data() {
        let engine = engine_with_index();
        let txn = engine
            .begin_transaction(&names(), true)
            .await
            .expect("transaction");
        txn.store("test")
            .expect("store")
            .put(&[json!({"id": "a", "k": {"k": ["w", "x"]}})])
            .await
            .expect("put");
        txn.commit().await.expect("commit");

        let state = engine.state().expect("state");
        let store = state.stores.get("test").expect("store state");
        assert_eq!(store.data.len(), 1);
        assert!(store.data.contains_key("Ca"));
        let tree = store.indexes.get("key").expect("index tree");
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn abort_rebuilds_index_trees_from_committed_data() {
        let engine = engine_with_index();
        let txn = engine
            .begin_transaction(&names(), true)
            .await
            .expect("transaction");
        txn.store("test")
            .expect("store")
            .put(&[json!({"id": "a", "k": {"k": ["w"]}})])
            .await
            .expect("put");
        txn.commit().await.expect("commit");

        let txn = engine
            .begin_transaction(&names(), true)
            .await
            .expect("transaction");
        txn.store("test")
            .expect("store")
            .put(&[json!({"id": "b", "k": {"k": ["y", "z"]}})])
            .await
            .expect("put");
        // The shared index trees already saw the write...
        {
            let state = engine.state().expect("state");
            let tree = state.stores.get("test").expect("store").indexes["key"].clone();
            assert_eq!(tree.len(), 3);
        }
        // ...and abort restores them from the untouched committed data.
        txn.abort().await.expect("abort");
        let state = engine.state().expect("state");
        let store = state.stores.get("test").expect("store");
        assert_eq!(store.data.len(), 1);
        let tree = store.indexes.get("key").expect("index tree");
        assert_eq!(tree.len(), 1);
        assert!(tree.contains_key("Cw"));
    }

    #[tokio::test]
    async fn replacing_a_document_replaces_its_index_entries() {
        let engine = engine_with_index();
        let txn = engine
            .begin_transaction(&names(), true)
            .await
            .expect("transaction");
        {
            let store = txn.store("test").expect("store");
            store
                .put(&[json!({"id": "a", "k": {"k": ["w", "x", "y", "z"]}})])
                .await
                .expect("first put");
            store
                .put(&[json!({"id": "a", "k": {"k": ["z"]}})])
                .await
                .expect("second put");
        }
        txn.commit().await.expect("commit");

        let state = engine.state().expect("state");
        let tree = state.stores.get("test").expect("store").indexes["key"].clone();
        assert_eq!(tree.keys().cloned().collect::<Vec<_>>(), vec!["Cz"]);
    }

    #[tokio::test]
    async fn read_transactions_do_not_see_writer_working_set() {
        let engine = engine_with_index();
        let writer = engine
            .begin_transaction(&names(), true)
            .await
            .expect("writer");
        writer
            .store("test")
            .expect("store")
            .put(&[json!({"id": "a", "k": {"k": ["w"]}})])
            .await
            .expect("put");

        // A primary key read inside the writer sees the pending document.
        let pending = writer
            .store("test")
            .expect("store")
            .get(&Key::from("a"))
            .await
            .expect("get");
        assert!(pending.is_some());

        // Committed state still holds nothing.
        let reader = engine
            .begin_transaction(&names(), false)
            .await
            .expect("reader");
        let seen = reader
            .store("test")
            .expect("store")
            .get(&Key::from("a"))
            .await
            .expect("get");
        assert_eq!(seen, None);
    }
}
