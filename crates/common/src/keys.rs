//! Order-preserving key encoding.
//!
//! Every key component serializes to a string such that lexicographic
//! comparison of the encoded forms matches the intended order: numbers sort
//! below dates, dates below strings, and within each type by natural order.
//! Range queries on every backend compare these encoded strings only.

use chrono::{DateTime, Utc};

use crate::error::KeyError;
use crate::schema::KeyPath;

/// Joins the serialized components of a compound key.
pub const COMPOUND_KEY_SEPARATOR: &str = "%&";

/// A single key component: number, date (epoch milliseconds) or string.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Number(f64),
    Date(i64),
    Text(String),
}

impl From<f64> for KeyValue {
    fn from(n: f64) -> Self {
        KeyValue::Number(n)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Number(n as f64)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        KeyValue::Number(n.into())
    }
}

impl From<u32> for KeyValue {
    fn from(n: u32) -> Self {
        KeyValue::Number(n.into())
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Text(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Text(s)
    }
}

impl From<DateTime<Utc>> for KeyValue {
    fn from(date: DateTime<Utc>) -> Self {
        KeyValue::Date(date.timestamp_millis())
    }
}

/// A full key for a store or index: one component for scalar key paths, an
/// ordered list for compound ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Value(KeyValue),
    Compound(Vec<KeyValue>),
}

impl Key {
    pub fn compound<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<KeyValue>,
    {
        Key::Compound(values.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<KeyValue>> From<V> for Key {
    fn from(value: V) -> Self {
        Key::Value(value.into())
    }
}

impl From<Vec<KeyValue>> for Key {
    fn from(values: Vec<KeyValue>) -> Self {
        Key::Compound(values)
    }
}

/// Serializes one key component with its type prefix.
pub fn serialize_value(value: &KeyValue) -> String {
    match value {
        KeyValue::Number(n) => format!("A{}", serialize_number_to_orderable_string(*n)),
        KeyValue::Date(ms) => format!("B{}", serialize_number_to_orderable_string(*ms as f64)),
        KeyValue::Text(s) => format!("C{s}"),
    }
}

/// Encodes a number so the encodings sort like the numbers themselves.
///
/// The exponent is biased by 1024 and zero-padded to four digits so that
/// larger magnitudes sort above smaller ones; for negatives the bias flips
/// and the mantissa is inverted (`10 - m`) to reverse the in-magnitude
/// order. Zero, NaN and the infinities keep their literal spellings.
pub fn serialize_number_to_orderable_string(n: f64) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == f64::INFINITY {
        return "Infinity".to_string();
    }
    if n == f64::NEG_INFINITY {
        return "-Infinity".to_string();
    }

    let mut exponent = n.abs().log10().floor() as i64;
    let mut mantissa = n.abs() / 10f64.powi(exponent as i32);
    // log10 is not exact at power-of-ten boundaries; renormalize.
    if mantissa >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    } else if mantissa < 1.0 {
        mantissa *= 10.0;
        exponent -= 1;
    }

    if n > 0.0 {
        format!("{:04}{}", 1024 + exponent, mantissa)
    } else {
        format!("-{:04}{}", 1024 - exponent, 10.0 - mantissa)
    }
}

/// Serializes a full key against its key path, validating the shape.
pub fn serialize_key_to_string(key: &Key, key_path: &KeyPath) -> Result<String, KeyError> {
    if key_path.is_compound() {
        let Key::Compound(values) = key else {
            return Err(KeyError::ShapeMismatch(
                "scalar key given for a compound key path".to_string(),
            ));
        };
        let arity = key_path.components().len();
        if values.len() != arity {
            return Err(KeyError::ShapeMismatch(format!(
                "compound key has {} components, key path expects {arity}",
                values.len()
            )));
        }
        Ok(values
            .iter()
            .map(serialize_value)
            .collect::<Vec<_>>()
            .join(COMPOUND_KEY_SEPARATOR))
    } else {
        match key {
            Key::Value(value) => Ok(serialize_value(value)),
            Key::Compound(values) if values.len() == 1 => Ok(serialize_value(&values[0])),
            Key::Compound(values) => Err(KeyError::ShapeMismatch(format!(
                "compound key of {} components given for a scalar key path",
                values.len()
            ))),
        }
    }
}

/// Normalizes a batch of keys to their serialized forms, validating each
/// against the key path's shape.
pub fn form_list_of_serialized_keys(
    keys: &[Key],
    key_path: &KeyPath,
) -> Result<Vec<String>, KeyError> {
    keys.iter()
        .map(|key| serialize_key_to_string(key, key_path))
        .collect()
}
