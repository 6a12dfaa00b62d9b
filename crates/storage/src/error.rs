use docstore_common::error::{KeyError, SchemaError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    InvalidKey(#[from] KeyError),
    #[error("schema conflict: {0}")]
    MigrationConflict(#[from] SchemaError),
    #[error("store {0} not found in schema")]
    StoreNotFound(String),
    #[error("index {1} not found in store {0}")]
    IndexNotFound(String, String),
    #[error("transaction is closed")]
    TransactionClosed,
    #[error("transaction was aborted")]
    TransactionAborted,
    #[error("database schema version {on_disk} is newer than the requested version {requested}")]
    SchemaTooNew { on_disk: u32, requested: u32 },
    #[error("database schema version {on_disk} is older than the last usable version {floor}")]
    SchemaTooOld { on_disk: u32, floor: u32 },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("every candidate provider failed to open: {0:?}")]
    AllProvidersFailed(Vec<StoreError>),
    #[cfg(feature = "sql")]
    #[error(transparent)]
    Sql(#[from] libsql::Error),
    #[error("stored document is unreadable: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Custom(String),
}
