//! Key path resolution against documents.

use serde_json::Value;

use crate::error::KeyError;
use crate::fulltext::get_full_text_index_words_for_item;
use crate::keys::{self, Key, KeyValue};
use crate::schema::{IndexSchema, KeyPath};

/// Walks one dotted path through nested objects. Absent segments and
/// non-object intermediates resolve to `None`.
pub fn get_value_for_single_keypath<'a>(obj: &'a Value, key_path: &str) -> Option<&'a Value> {
    let mut current = obj;
    for segment in key_path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub fn is_compound_key_path(key_path: &KeyPath) -> bool {
    key_path.is_compound()
}

/// Wraps a scalar in a one-element list; passes arrays through as their
/// elements. Multi-entry extraction treats both shapes uniformly.
pub fn arrayify(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn key_value_from_json(value: &Value) -> Result<KeyValue, KeyError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(KeyValue::Number)
            .ok_or_else(|| KeyError::InvalidKeyType(format!("unrepresentable number {n}"))),
        Value::String(s) => Ok(KeyValue::Text(s.clone())),
        other => Err(KeyError::InvalidKeyType(format!(
            "key component must be a number or string, got {other}"
        ))),
    }
}

/// Extracts the key a key path names inside a document.
///
/// `Ok(None)` when any component is absent or `null` (the document then has
/// no entry under this key path); `Err` when a component resolves to a value
/// that cannot be a key.
pub fn get_key_for_keypath(obj: &Value, key_path: &KeyPath) -> Result<Option<Key>, KeyError> {
    if key_path.is_compound() {
        let mut values = Vec::new();
        for path in key_path.components() {
            match get_value_for_single_keypath(obj, path) {
                None | Some(Value::Null) => return Ok(None),
                Some(value) => values.push(key_value_from_json(value)?),
            }
        }
        Ok(Some(Key::Compound(values)))
    } else {
        let path = key_path.components()[0];
        match get_value_for_single_keypath(obj, path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(Key::Value(key_value_from_json(value)?))),
        }
    }
}

/// The serialized index-tree keys one document contributes to an index:
/// one per unique token for full-text, one per array element for
/// multi-entry, at most one otherwise.
pub fn serialized_index_entries(
    index: &IndexSchema,
    doc: &Value,
) -> Result<Vec<String>, KeyError> {
    if index.full_text {
        let words = get_full_text_index_words_for_item(&index.key_path, doc);
        return Ok(words
            .iter()
            .map(|word| keys::serialize_value(&KeyValue::Text(word.clone())))
            .collect());
    }
    if index.multi_entry {
        let path = index.key_path.components()[0];
        let entries = match get_value_for_single_keypath(doc, path) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => arrayify(value)
                .into_iter()
                .filter(|element| !element.is_null())
                .map(|element| Ok(keys::serialize_value(&key_value_from_json(element)?)))
                .collect::<Result<Vec<_>, KeyError>>()?,
        };
        return Ok(entries);
    }
    match get_key_for_keypath(doc, &index.key_path)? {
        None => Ok(Vec::new()),
        Some(key) => Ok(vec![keys::serialize_key_to_string(&key, &index.key_path)?]),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn walks_nested_objects() {
        let doc = json!({"a": {"b": {"c": 5}}});
        assert_eq!(
            get_value_for_single_keypath(&doc, "a.b.c"),
            Some(&json!(5))
        );
        assert_eq!(get_value_for_single_keypath(&doc, "a.x"), None);
        assert_eq!(get_value_for_single_keypath(&doc, "a.b.c.d"), None);
    }

    #[test]
    fn compound_key_requires_every_component() {
        let key_path = KeyPath::from(vec!["a", "b"]);
        let complete = json!({"a": "x", "b": 2});
        let extracted = get_key_for_keypath(&complete, &key_path)
            .expect("valid")
            .expect("present");
        assert_eq!(
            extracted,
            Key::Compound(vec![KeyValue::from("x"), KeyValue::Number(2.0)])
        );

        let partial = json!({"a": "x"});
        assert_eq!(get_key_for_keypath(&partial, &key_path).expect("valid"), None);

        let with_null = json!({"a": "x", "b": null});
        assert_eq!(
            get_key_for_keypath(&with_null, &key_path).expect("valid"),
            None
        );
    }

    #[test]
    fn object_key_component_is_rejected() {
        let doc = json!({"a": {"nested": true}});
        assert!(get_key_for_keypath(&doc, &KeyPath::from("a")).is_err());
    }

    #[test]
    fn multi_entry_entries_come_from_array_elements() {
        let mut index = IndexSchema::new("key", "k.k");
        index.multi_entry = true;
        let doc = json!({"id": "a", "k": {"k": ["w", "x"]}});
        assert_eq!(
            serialized_index_entries(&index, &doc).expect("valid"),
            vec!["Cw".to_string(), "Cx".to_string()]
        );

        let absent = json!({"id": "a"});
        assert!(serialized_index_entries(&index, &absent)
            .expect("valid")
            .is_empty());
    }

    #[test]
    fn scalar_multi_entry_value_is_arrayified() {
        let mut index = IndexSchema::new("key", "k");
        index.multi_entry = true;
        let doc = json!({"k": "solo"});
        assert_eq!(
            serialized_index_entries(&index, &doc).expect("valid"),
            vec!["Csolo".to_string()]
        );
    }
}
