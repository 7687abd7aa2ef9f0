//! Keys and key paths
//!
//! Keys are ordered Number < String < Array, arrays compared element by
//! element. `Key::encode` preserves that order byte-wise, so SQLite can sort
//! and compare encoded keys as plain BLOBs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::error::StorageError;
use crate::Result;

const TAG_TERMINATOR: u8 = 0x00;
const TAG_NUMBER: u8 = 0x10;
const TAG_STRING: u8 = 0x30;
const TAG_ARRAY: u8 = 0x50;

/// Largest integer a key generator may hand out (2^53)
pub const MAX_GENERATED_KEY: i64 = 9_007_199_254_740_992;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => TAG_NUMBER,
            Key::String(_) => TAG_STRING,
            Key::Array(_) => TAG_ARRAY,
        }
    }

    /// Order-preserving binary encoding
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.rank());
        match self {
            Key::Number(n) => {
                let bits = zero_signless(*n).to_bits();
                let flipped = if bits >> 63 == 1 {
                    !bits
                } else {
                    bits | (1 << 63)
                };
                out.extend_from_slice(&flipped.to_be_bytes());
            }
            Key::String(s) => {
                for byte in s.bytes() {
                    match byte {
                        0x00 => out.extend_from_slice(&[0x01, 0x01]),
                        0x01 => out.extend_from_slice(&[0x01, 0x02]),
                        b => out.push(b),
                    }
                }
                out.push(TAG_TERMINATOR);
            }
            Key::Array(items) => {
                for item in items {
                    item.encode_into(out);
                }
                out.push(TAG_TERMINATOR);
            }
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Key::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_GENERATED_KEY as f64 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => zero_signless(*a).total_cmp(&zero_signless(*b)),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

/// -0.0 and 0.0 are the same key
fn zero_signless(n: f64) -> f64 {
    if n == 0.0 {
        0.0
    } else {
        n
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(zero_signless(n))
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<Key>> for Key {
    fn from(items: Vec<Key>) -> Self {
        Key::Array(items)
    }
}

impl TryFrom<&Value> for Key {
    type Error = StorageError;

    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .filter(|n| !n.is_nan())
                .map(Key::from)
                .ok_or_else(|| StorageError::Data(format!("{} is not a valid key", n))),
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::try_from)
                .collect::<Result<Vec<_>>>()
                .map(Key::Array),
            other => Err(StorageError::Data(format!("{} is not a valid key", other))),
        }
    }
}

/// Where a key lives inside a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// Dotted path; the empty string addresses the record itself
    Single(String),
    /// Several paths combined into an array key
    Compound(Vec<String>),
}

impl KeyPath {
    /// Build from an ordered list of field names: one field gives a scalar
    /// key path, several give a compound one
    pub fn from_fields(fields: &[String]) -> Self {
        match fields {
            [single] => KeyPath::Single(single.clone()),
            many => KeyPath::Compound(many.to_vec()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            KeyPath::Single(path) => validate_path(path),
            KeyPath::Compound(paths) => {
                if paths.is_empty() {
                    return Err(StorageError::Syntax("empty compound key path".into()));
                }
                paths.iter().try_for_each(|p| validate_path(p))
            }
        }
    }

    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    pub fn is_empty_path(&self) -> bool {
        matches!(self, KeyPath::Single(p) if p.is_empty())
    }

    /// Extract a key from a record.
    ///
    /// `None` when a field is missing; `Some(Err)` when a field holds a value
    /// that cannot be a key.
    pub fn extract(&self, value: &Value) -> Option<Result<Key>> {
        match self {
            KeyPath::Single(path) => lookup(value, path).map(Key::try_from),
            KeyPath::Compound(paths) => {
                let mut items = Vec::with_capacity(paths.len());
                for path in paths {
                    match lookup(value, path).map(Key::try_from)? {
                        Ok(key) => items.push(key),
                        Err(e) => return Some(Err(e)),
                    }
                }
                Some(Ok(Key::Array(items)))
            }
        }
    }

    /// Write a generated key into the record at this path, creating
    /// intermediate objects as needed
    pub fn inject(&self, value: &mut Value, key: &Key) -> Result<()> {
        let KeyPath::Single(path) = self else {
            return Err(StorageError::InvalidAccess(
                "cannot inject a key at a compound key path".into(),
            ));
        };

        let mut segments = path.split('.').peekable();
        let mut current = value;
        while let Some(segment) = segments.next() {
            let object = current
                .as_object_mut()
                .ok_or_else(|| StorageError::Data(format!("cannot inject key at '{}'", path)))?;
            if segments.peek().is_none() {
                object.insert(segment.to_string(), key.to_value());
                return Ok(());
            }
            current = object
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }

    for segment in path.split('.') {
        let mut chars = segment.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$');
        if !valid_start || !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
            return Err(StorageError::Syntax(format!("'{}'", path)));
        }
    }

    Ok(())
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::Array(vec![Key::from(1)]),
            Key::from("b"),
            Key::from(10),
            Key::from("a"),
            Key::from(-3.5),
            Key::Array(vec![]),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::from(-3.5),
                Key::from(10),
                Key::from("a"),
                Key::from("b"),
                Key::Array(vec![]),
                Key::Array(vec![Key::from(1)]),
            ]
        );
    }

    #[test]
    fn test_encoding_preserves_order() {
        let keys = [
            Key::from(-100),
            Key::from(-0.5),
            Key::from(0),
            Key::from(2),
            Key::from(1e10),
            Key::from(""),
            Key::from("a"),
            Key::from("a\u{0}"),
            Key::from("a\u{1}"),
            Key::from("ab"),
            Key::Array(vec![]),
            Key::Array(vec![Key::from(1), Key::from("z")]),
            Key::Array(vec![Key::from("a")]),
            Key::Array(vec![Key::from("a"), Key::from(1)]),
        ];

        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
            assert!(
                pair[0].encode() < pair[1].encode(),
                "encoding of {:?} should sort before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_negative_zero_equals_zero() {
        let negative = Key::try_from(&json!(-0.0)).unwrap();
        assert_eq!(negative, Key::from(0));
        assert_eq!(Key::Number(-0.0), Key::Number(0.0));
        assert_eq!(Key::Number(-0.0).encode(), Key::from(0).encode());
        assert!(Key::from(-0.5) < Key::Number(-0.0));
    }

    #[test]
    fn test_extract_single_and_nested() {
        let record = json!({"id": 7, "meta": {"tag": "x"}, "flag": true});

        let id = KeyPath::Single("id".into()).extract(&record).unwrap().unwrap();
        assert_eq!(id, Key::from(7));

        let tag = KeyPath::Single("meta.tag".into())
            .extract(&record)
            .unwrap()
            .unwrap();
        assert_eq!(tag, Key::from("x"));

        assert!(KeyPath::Single("missing".into()).extract(&record).is_none());
        assert!(KeyPath::Single("flag".into())
            .extract(&record)
            .unwrap()
            .is_err());
    }

    #[test]
    fn test_extract_compound() {
        let record = json!({"a": "x", "b": 2});
        let path = KeyPath::from_fields(&["a".to_string(), "b".to_string()]);

        let key = path.extract(&record).unwrap().unwrap();
        assert_eq!(key, Key::Array(vec![Key::from("x"), Key::from(2)]));

        let partial = json!({"a": "x"});
        assert!(path.extract(&partial).is_none());
    }

    #[test]
    fn test_single_field_is_scalar_path() {
        assert_eq!(
            KeyPath::from_fields(&["tag".to_string()]),
            KeyPath::Single("tag".into())
        );
    }

    #[test]
    fn test_inject_generated_key() {
        let mut record = json!({"text": "a"});
        KeyPath::Single("id".into())
            .inject(&mut record, &Key::from(1))
            .unwrap();
        assert_eq!(record, json!({"text": "a", "id": 1}));

        let mut nested = json!({});
        KeyPath::Single("meta.id".into())
            .inject(&mut nested, &Key::from(4))
            .unwrap();
        assert_eq!(nested, json!({"meta": {"id": 4}}));
    }

    #[test]
    fn test_validate_key_paths() {
        assert!(KeyPath::Single("id".into()).validate().is_ok());
        assert!(KeyPath::Single("a.b_c".into()).validate().is_ok());
        assert!(KeyPath::Single("".into()).validate().is_ok());
        assert!(KeyPath::Single("1abc".into()).validate().is_err());
        assert!(KeyPath::Single("a..b".into()).validate().is_err());
        assert!(KeyPath::Compound(vec![]).validate().is_err());
    }

    #[test]
    fn test_non_key_values_rejected() {
        assert!(Key::try_from(&json!(null)).is_err());
        assert!(Key::try_from(&json!({"a": 1})).is_err());
        assert!(Key::try_from(&json!([1, true])).is_err());
        assert_eq!(Key::try_from(&json!([1, "a"])).unwrap().to_value(), json!([1, "a"]));
    }
}
