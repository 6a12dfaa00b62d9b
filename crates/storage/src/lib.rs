mod api;
mod error;
mod lock;
mod store;
mod store_db;
mod transaction;

pub use api::{IndexAccess, SortOrder, StoreAccess, StoreEngine, TransactionEngine};
pub use error::StoreError;
pub use lock::{TransactionLockHelper, TransactionToken};
pub use store::{EngineType, Provider, ProviderOptions, open_list_of_providers};
pub use transaction::{IndexHandle, StoreHandle, Transaction, TransactionStatus};

pub use docstore_common::Document;
pub use docstore_common::fulltext::FullTextTermResolution;
pub use docstore_common::keys::{Key, KeyValue};
pub use docstore_common::schema::{DbSchema, IndexSchema, KeyPath, StoreSchema};
