use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key type: {0}")]
    InvalidKeyType(String),
    #[error("key shape does not match the key path: {0}")]
    ShapeMismatch(String),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("multi-entry index {0} cannot use a compound key path")]
    MultiEntryCompoundKeyPath(String),
    #[error("full-text index {0} requires a single string key path")]
    FullTextCompoundKeyPath(String),
    #[error("full-text index {0} cannot also be multi-entry")]
    FullTextMultiEntry(String),
    #[error("duplicate store name {0}")]
    DuplicateStore(String),
    #[error("duplicate index name {1} in store {0}")]
    DuplicateIndex(String, String),
    #[error("invalid name {0}: only ASCII alphanumerics and underscores are allowed")]
    InvalidName(String),
}
