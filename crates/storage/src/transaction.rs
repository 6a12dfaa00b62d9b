//! Public transaction handles.
//!
//! A [`Transaction`] owns its backend transaction and lock token. Store and
//! index handles borrow the transaction and stop working the moment it
//! commits or aborts. The completion future resolves exactly once.

use docstore_common::Document;
use docstore_common::fulltext::FullTextTermResolution;
use docstore_common::keys::Key;
use tokio::sync::watch;

use crate::api::{IndexAccess, SortOrder, StoreAccess, TransactionEngine};
use crate::error::StoreError;
use crate::lock::{TransactionLockHelper, TransactionToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Open,
    Committed,
    Aborted,
}

pub struct Transaction {
    engine: Option<Box<dyn TransactionEngine>>,
    token: TransactionToken,
    locks: TransactionLockHelper,
    status: watch::Sender<TransactionStatus>,
}

impl Transaction {
    pub(crate) fn new(
        engine: Box<dyn TransactionEngine>,
        token: TransactionToken,
        locks: TransactionLockHelper,
    ) -> Self {
        let (status, _) = watch::channel(TransactionStatus::Open);
        Transaction {
            engine: Some(engine),
            token,
            locks,
            status,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.borrow()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StoreError> {
        match self.status() {
            TransactionStatus::Open => Ok(()),
            TransactionStatus::Aborted => Err(StoreError::TransactionAborted),
            TransactionStatus::Committed => Err(StoreError::TransactionClosed),
        }
    }

    /// A handle onto one of the stores this transaction covers.
    pub fn get_store(&self, store_name: &str) -> Result<StoreHandle<'_>, StoreError> {
        self.ensure_open()?;
        let engine = self.engine.as_ref().ok_or(StoreError::TransactionClosed)?;
        Ok(StoreHandle {
            access: engine.store(store_name)?,
            transaction: self,
        })
    }

    /// Resolves once the transaction commits or aborts. Usable from any
    /// task; does not borrow the transaction.
    pub fn completion(&self) -> TransactionCompletion {
        TransactionCompletion {
            receiver: self.status.subscribe(),
        }
    }

    /// Marks the transaction completed, applying its writes.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let engine = self.engine.take().ok_or(StoreError::TransactionClosed)?;
        match engine.commit().await {
            Ok(()) => {
                self.locks.transaction_complete(&self.token);
                self.status.send_replace(TransactionStatus::Committed);
                Ok(())
            }
            Err(err) => {
                self.locks.transaction_failed(&self.token, &err.to_string());
                self.status.send_replace(TransactionStatus::Aborted);
                Err(err)
            }
        }
    }

    /// Discards pending writes and releases the transaction's locks.
    pub async fn abort(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let engine = self.engine.take().ok_or(StoreError::TransactionClosed)?;
        let result = engine.abort().await;
        self.locks
            .transaction_failed(&self.token, "transaction aborted");
        self.status.send_replace(TransactionStatus::Aborted);
        result
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status() != TransactionStatus::Open {
            return;
        }
        self.status.send_replace(TransactionStatus::Aborted);
        self.locks
            .transaction_failed(&self.token, "transaction dropped without commit");
        if let Some(engine) = self.engine.take() {
            // Backend rollback is async; run it out-of-band when a runtime
            // is still around.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = engine.abort().await;
                });
            }
        }
    }
}

pub struct TransactionCompletion {
    receiver: watch::Receiver<TransactionStatus>,
}

impl TransactionCompletion {
    pub async fn wait(mut self) -> TransactionStatus {
        loop {
            let status = *self.receiver.borrow();
            if status != TransactionStatus::Open {
                return status;
            }
            if self.receiver.changed().await.is_err() {
                return *self.receiver.borrow();
            }
        }
    }
}

pub struct StoreHandle<'t> {
    access: Box<dyn StoreAccess + 't>,
    transaction: &'t Transaction,
}

impl StoreHandle<'_> {
    pub async fn get(&self, key: impl Into<Key>) -> Result<Option<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access.get(&key.into()).await
    }

    pub async fn get_multiple(&self, keys: &[Key]) -> Result<Vec<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access.get_multiple(keys).await
    }

    pub async fn put(&self, items: &[Document]) -> Result<(), StoreError> {
        self.transaction.ensure_open()?;
        self.access.put(items).await
    }

    pub async fn remove(&self, keys: &[Key]) -> Result<(), StoreError> {
        self.transaction.ensure_open()?;
        self.access.remove(keys).await
    }

    pub async fn clear_all_data(&self) -> Result<(), StoreError> {
        self.transaction.ensure_open()?;
        self.access.clear_all_data().await
    }

    pub fn open_index(&self, index_name: &str) -> Result<IndexHandle<'_>, StoreError> {
        self.transaction.ensure_open()?;
        Ok(IndexHandle {
            access: self.access.open_index(index_name)?,
            transaction: self.transaction,
        })
    }

    pub fn open_primary_key(&self) -> Result<IndexHandle<'_>, StoreError> {
        self.transaction.ensure_open()?;
        Ok(IndexHandle {
            access: self.access.open_primary_key()?,
            transaction: self.transaction,
        })
    }
}

pub struct IndexHandle<'t> {
    access: Box<dyn IndexAccess + 't>,
    transaction: &'t Transaction,
}

impl IndexHandle<'_> {
    pub async fn get_all(
        &self,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access.get_all(sort, limit, offset).await
    }

    pub async fn get_only(
        &self,
        key: impl Into<Key>,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access.get_only(&key.into(), sort, limit, offset).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn get_range(
        &self,
        key_low: impl Into<Key>,
        key_high: impl Into<Key>,
        low_exclusive: bool,
        high_exclusive: bool,
        sort: SortOrder,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access
            .get_range(
                &key_low.into(),
                &key_high.into(),
                low_exclusive,
                high_exclusive,
                sort,
                limit,
                offset,
            )
            .await
    }

    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.transaction.ensure_open()?;
        self.access.count_all().await
    }

    pub async fn count_only(&self, key: impl Into<Key>) -> Result<u64, StoreError> {
        self.transaction.ensure_open()?;
        self.access.count_only(&key.into()).await
    }

    pub async fn count_range(
        &self,
        key_low: impl Into<Key>,
        key_high: impl Into<Key>,
        low_exclusive: bool,
        high_exclusive: bool,
    ) -> Result<u64, StoreError> {
        self.transaction.ensure_open()?;
        self.access
            .count_range(&key_low.into(), &key_high.into(), low_exclusive, high_exclusive)
            .await
    }

    pub async fn full_text_search(
        &self,
        search_phrase: &str,
        resolution: FullTextTermResolution,
        limit: Option<u64>,
    ) -> Result<Vec<Document>, StoreError> {
        self.transaction.ensure_open()?;
        self.access
            .full_text_search(search_phrase, resolution, limit)
            .await
    }
}
