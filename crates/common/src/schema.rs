use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// Names a value inside a document: either one dotted path ("a.b") or an
/// ordered list of dotted paths. A list of length >= 2 is a compound key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    Single(String),
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(paths) if paths.len() >= 2)
    }

    /// The ordered dotted paths this key path resolves, one per component.
    pub fn components(&self) -> Vec<&str> {
        match self {
            KeyPath::Single(path) => vec![path.as_str()],
            KeyPath::Compound(paths) => paths.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(paths: Vec<String>) -> Self {
        KeyPath::Compound(paths)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Compound(paths.into_iter().map(str::to_string).collect())
    }
}

/// One secondary index over a store. Serialized as-is into the SQL engine's
/// `metadata` table, so the field shape doubles as the on-disk meta format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
    pub name: String,
    pub key_path: KeyPath,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub multi_entry: bool,
    #[serde(default)]
    pub full_text: bool,
    #[serde(default)]
    pub include_data_in_index: bool,
    #[serde(default)]
    pub do_not_backfill: bool,
}

impl IndexSchema {
    pub fn new(name: &str, key_path: impl Into<KeyPath>) -> Self {
        IndexSchema {
            name: name.to_string(),
            key_path: key_path.into(),
            unique: false,
            multi_entry: false,
            full_text: false,
            include_data_in_index: false,
            do_not_backfill: false,
        }
    }

    /// Whether a persisted meta row still describes this index. Any
    /// difference forces the migrator to recreate it; `do_not_backfill` only
    /// matters at creation time and is deliberately not compared.
    pub fn same_shape(&self, other: &IndexSchema) -> bool {
        self.key_path == other.key_path
            && self.unique == other.unique
            && self.multi_entry == other.multi_entry
            && self.full_text == other.full_text
            && self.include_data_in_index == other.include_data_in_index
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSchema {
    pub name: String,
    pub primary_key_path: KeyPath,
    #[serde(default)]
    pub indexes: Vec<IndexSchema>,
    /// Average serialized document size, used to size migration batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_obj_bytes: Option<u32>,
}

impl StoreSchema {
    pub fn new(name: &str, primary_key_path: impl Into<KeyPath>) -> Self {
        StoreSchema {
            name: name.to_string(),
            primary_key_path: primary_key_path.into(),
            indexes: Vec::new(),
            estimated_obj_bytes: None,
        }
    }

    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|index| index.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSchema {
    pub version: u32,
    /// On-disk versions older than this are wiped instead of migrated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_usable_version: Option<u32>,
    pub stores: Vec<StoreSchema>,
}

impl DbSchema {
    pub fn new(version: u32, stores: Vec<StoreSchema>) -> Self {
        DbSchema {
            version,
            last_usable_version: None,
            stores,
        }
    }

    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|store| store.name == name)
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|store| store.name.clone()).collect()
    }

    /// Rejects declarations the engines cannot represent. Store and index
    /// names become SQL identifiers, hence the character restriction.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut store_names = HashSet::new();
        for store in &self.stores {
            if !is_valid_name(&store.name) {
                return Err(SchemaError::InvalidName(store.name.clone()));
            }
            if !store_names.insert(store.name.as_str()) {
                return Err(SchemaError::DuplicateStore(store.name.clone()));
            }
            let mut index_names = HashSet::new();
            for index in &store.indexes {
                if !is_valid_name(&index.name) {
                    return Err(SchemaError::InvalidName(index.name.clone()));
                }
                if !index_names.insert(index.name.as_str()) {
                    return Err(SchemaError::DuplicateIndex(
                        store.name.clone(),
                        index.name.clone(),
                    ));
                }
                if index.multi_entry && index.key_path.is_compound() {
                    return Err(SchemaError::MultiEntryCompoundKeyPath(index.name.clone()));
                }
                if index.full_text && index.key_path.is_compound() {
                    return Err(SchemaError::FullTextCompoundKeyPath(index.name.clone()));
                }
                if index.full_text && index.multi_entry {
                    return Err(SchemaError::FullTextMultiEntry(index.name.clone()));
                }
            }
        }
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with_index(index: IndexSchema) -> DbSchema {
        DbSchema::new(1, vec![StoreSchema::new("test", "id").with_index(index)])
    }

    #[test]
    fn compound_key_path_detection() {
        assert!(!KeyPath::from("a.b").is_compound());
        assert!(!KeyPath::Compound(vec!["a".to_string()]).is_compound());
        assert!(KeyPath::from(vec!["a", "b"]).is_compound());
    }

    #[test]
    fn multi_entry_compound_rejected() {
        let mut index = IndexSchema::new("bad", vec!["a", "b"]);
        index.multi_entry = true;
        assert!(matches!(
            schema_with_index(index).validate(),
            Err(SchemaError::MultiEntryCompoundKeyPath(_))
        ));
    }

    #[test]
    fn full_text_compound_rejected() {
        let mut index = IndexSchema::new("bad", vec!["a", "b"]);
        index.full_text = true;
        assert!(matches!(
            schema_with_index(index).validate(),
            Err(SchemaError::FullTextCompoundKeyPath(_))
        ));
    }

    #[test]
    fn index_meta_round_trips_through_json() {
        let mut index = IndexSchema::new("ind1", "k.k");
        index.multi_entry = true;
        let encoded = serde_json::to_string(&index).expect("serialize");
        let decoded: IndexSchema = serde_json::from_str(&encoded).expect("deserialize");
        assert!(index.same_shape(&decoded));
        assert_eq!(index, decoded);
    }

    #[test]
    fn shape_comparison_ignores_backfill_flag() {
        let mut a = IndexSchema::new("ind1", "tt");
        let mut b = a.clone();
        b.do_not_backfill = true;
        assert!(a.same_shape(&b));
        a.unique = true;
        assert!(!a.same_shape(&b));
    }
}
