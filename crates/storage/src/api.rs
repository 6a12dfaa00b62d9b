//! Engine-facing storage API.

use std::fmt::Debug;

use docstore_common::Document;
use docstore_common::fulltext::FullTextTermResolution;
use docstore_common::keys::Key;

use crate::error::StoreError;

/// Requested ordering of range and scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    None,
    Forward,
    Reverse,
}

impl From<bool> for SortOrder {
    /// `true` means reverse, matching the boolean form of the original API.
    fn from(reverse: bool) -> Self {
        if reverse {
            SortOrder::Reverse
        } else {
            SortOrder::Forward
        }
    }
}

// We need async_trait because the stabilized feature lacks support for object
// safety (i.e. dyn StoreEngine)
#[async_trait::async_trait]
pub trait StoreEngine: Debug + Send + Sync {
    /// Starts a backend transaction over the given stores. Lock scheduling
    /// has already happened at the provider layer.
    async fn begin_transaction(
        &self,
        store_names: &[String],
        write_needed: bool,
    ) -> Result<Box<dyn TransactionEngine>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Removes every store's data and, where applicable, the backing files.
    async fn delete_database(&self) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait TransactionEngine: Send + Sync {
    /// Resolves a store participating in this transaction. The handle may
    /// not outlive the transaction.
    fn store(&self, store_name: &str) -> Result<Box<dyn StoreAccess + '_>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn abort(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait::async_trait]
pub trait StoreAccess: Send + Sync {
    async fn get(&self, key: &Key) -> Result<Option<Document>, StoreError>;

    async fn get_multiple(&self, keys: &[Key]) -> Result<Vec<Document>, StoreError>;

    async fn put(&self, items: &[Document]) -> Result<(), StoreError>;

    async fn remove(&self, keys: &[Key]) -> Result<(), StoreError>;

    async fn clear_all_data(&self) -> Result<(), StoreError>;

    fn open_index(&self, index_name: &str) -> Result<Box<dyn IndexAccess + '_>, StoreError>;

    fn open_primary_key(&self) -> Result<Box<dyn IndexAccess + '_>, StoreError>;
}

#[async_trait::async_trait]
pub trait IndexAccess: Send + Sync {
    async fn get_all(
        &self,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError>;

    async fn get_only(
        &self,
        key: &Key,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError>;

    #[allow(clippy::too_many_arguments)]
    async fn get_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count_all(&self) -> Result<u64, StoreError>;

    async fn count_only(&self, key: &Key) -> Result<u64, StoreError>;

    async fn count_range(
        &self,
        key_low: &Key,
        key_high: &Key,
        low_exclusive: bool,
        high_exclusive: bool,
    ) -> Result<u64, StoreError>;

    async fn full_text_search(
        &self,
        search_phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Document>, StoreError>;
}
