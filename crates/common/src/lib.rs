pub mod error;
pub mod fulltext;
pub mod keypath;
pub mod keys;
pub mod schema;

/// A stored document. Always a JSON object with string keys at the top
/// level; nested values are arbitrary JSON.
pub type Document = serde_json::Value;
