//! Tagged values stored in shared data
//!
//! [`Value`] is a closed set of shapes. Application types travel as
//! [`Value::Record`]: a type tag plus the postcard encoding of the value.
//! Peers decode records back into the concrete type through
//! [`Value::to_record`], and reject tags their [`TypeRegistry`] does not
//! know.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GrapevineError, GrapevineResult};

/// Deepest list/map nesting accepted when decoding a [`Value`]
pub const MAX_VALUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// An application type registered as a [`SharedType`]
    Record { type_tag: String, bytes: Vec<u8> },
}

/// Decoding mirror of [`Value`]; variant order must match
#[derive(Deserialize)]
#[serde(rename = "Value")]
enum ValueRepr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Record { type_tag: String, bytes: Vec<u8> },
}

thread_local! {
    static DECODE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Counts one level of `Value` nesting for the current decode
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        DECODE_DEPTH.with(|depth| {
            if depth.get() >= MAX_VALUE_DEPTH {
                return None;
            }
            depth.set(depth.get() + 1);
            Some(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DECODE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let _guard = DepthGuard::enter().ok_or_else(|| {
            D::Error::custom(format!("value nested deeper than {MAX_VALUE_DEPTH}"))
        })?;

        Ok(match ValueRepr::deserialize(deserializer)? {
            ValueRepr::Null => Value::Null,
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(i) => Value::Int(i),
            ValueRepr::Float(f) => Value::Float(f),
            ValueRepr::Text(s) => Value::Text(s),
            ValueRepr::Bytes(b) => Value::Bytes(b),
            ValueRepr::List(items) => Value::List(items),
            ValueRepr::Map(map) => Value::Map(map),
            ValueRepr::Record { type_tag, bytes } => Value::Record { type_tag, bytes },
        })
    }
}

/// An application type that can be stored in shared data
pub trait SharedType: Serialize + DeserializeOwned {
    /// Stable name identifying the type on every peer
    const TYPE_TAG: &'static str;
}

impl Value {
    pub fn record<T: SharedType>(value: &T) -> GrapevineResult<Self> {
        Ok(Value::Record {
            type_tag: T::TYPE_TAG.to_string(),
            bytes: postcard::to_allocvec(value)?,
        })
    }

    /// Decode a record back into `T`; fails if this is not a `T` record
    pub fn to_record<T: SharedType>(&self) -> GrapevineResult<T> {
        match self {
            Value::Record { type_tag, bytes } if type_tag == T::TYPE_TAG => {
                Ok(postcard::from_bytes(bytes)?)
            }
            Value::Record { type_tag, .. } => Err(GrapevineError::UnknownRecordType(format!(
                "expected {}, found {}",
                T::TYPE_TAG,
                type_tag
            ))),
            other => Err(GrapevineError::Serialization(format!(
                "expected {} record, found {}",
                T::TYPE_TAG,
                other.kind()
            ))),
        }
    }

    /// Short name of the shape, for messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Record { .. } => "record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// JSON rendering; records and bytes become descriptive objects/arrays
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Text(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::from(b.clone()),
            Value::List(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Record { type_tag, bytes } => serde_json::json!({
                "type": type_tag,
                "len": bytes.len(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            Json::String(s) => Value::Text(s),
            Json::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

type RecordCheck = fn(&[u8]) -> GrapevineResult<()>;

fn check_decodes<T: SharedType>(bytes: &[u8]) -> GrapevineResult<()> {
    postcard::from_bytes::<T>(bytes)?;
    Ok(())
}

/// Record types this peer accepts from the network
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<String, RecordCheck>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: SharedType>(&self) {
        self.types
            .write()
            .insert(T::TYPE_TAG.to_string(), check_decodes::<T>);
    }

    pub fn is_registered(&self, type_tag: &str) -> bool {
        self.types.read().contains_key(type_tag)
    }

    /// Check that every record inside `value` is registered and decodes
    pub fn validate(&self, value: &Value) -> GrapevineResult<()> {
        match value {
            Value::Record { type_tag, bytes } => {
                let check = self
                    .types
                    .read()
                    .get(type_tag)
                    .copied()
                    .ok_or_else(|| GrapevineError::UnknownRecordType(type_tag.clone()))?;
                check(bytes)
            }
            Value::List(items) => items.iter().try_for_each(|v| self.validate(v)),
            Value::Map(map) => map.values().try_for_each(|v| self.validate(v)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Move {
        row: u8,
        col: u8,
    }

    impl SharedType for Move {
        const TYPE_TAG: &'static str = "tictactoe.move";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other(u32);

    impl SharedType for Other {
        const TYPE_TAG: &'static str = "other";
    }

    #[test]
    fn test_record_roundtrip() {
        let mv = Move { row: 1, col: 2 };
        let value = Value::record(&mv).unwrap();
        assert_eq!(value.to_record::<Move>().unwrap(), mv);
        assert!(matches!(
            value.to_record::<Other>(),
            Err(GrapevineError::UnknownRecordType(_))
        ));
        assert!(Value::Int(3).to_record::<Move>().is_err());
    }

    #[test]
    fn test_registry_rejects_unknown_nested_record() {
        let registry = TypeRegistry::new();
        let nested = Value::List(vec![
            Value::Int(1),
            Value::record(&Move { row: 0, col: 0 }).unwrap(),
        ]);
        assert!(matches!(
            registry.validate(&nested),
            Err(GrapevineError::UnknownRecordType(_))
        ));

        registry.register::<Move>();
        assert!(registry.is_registered("tictactoe.move"));
        registry.validate(&nested).unwrap();
    }

    #[test]
    fn test_registry_rejects_undecodable_record() {
        let registry = TypeRegistry::new();
        registry.register::<Move>();
        let bogus = Value::Record {
            type_tag: "tictactoe.move".into(),
            bytes: vec![],
        };
        assert!(registry.validate(&bogus).is_err());
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::from(serde_json::json!({"score": 5, "names": ["a", "b"], "ok": true}));
        let map = value.as_map().unwrap();
        assert_eq!(map["score"].as_int(), Some(5));
        assert_eq!(map["names"].as_list().unwrap().len(), 2);
        assert_eq!(value.to_json()["ok"], serde_json::json!(true));
        assert_eq!(Value::from("x").to_string(), "\"x\"");
    }

    /// Postcard bytes for `depth` single-element lists around a null
    fn nested_list_bytes(depth: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = std::iter::repeat([6u8, 1u8]).take(depth).flatten().collect();
        bytes.push(0);
        bytes
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let err = postcard::from_bytes::<Value>(&nested_list_bytes(200_000)).unwrap_err();
        assert!(matches!(
            GrapevineError::from(err),
            GrapevineError::Serialization(_)
        ));

        // The depth count unwinds with the error
        let shallow: Value = postcard::from_bytes(&nested_list_bytes(3)).unwrap();
        assert_eq!(
            shallow,
            Value::List(vec![Value::List(vec![Value::List(vec![Value::Null])])])
        );
    }

    #[test]
    fn test_nesting_limit_boundary() {
        assert!(postcard::from_bytes::<Value>(&nested_list_bytes(MAX_VALUE_DEPTH - 1)).is_ok());
        assert!(postcard::from_bytes::<Value>(&nested_list_bytes(MAX_VALUE_DEPTH)).is_err());
    }

    #[test]
    fn test_postcard_preserves_shape() {
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::Float(1.5));
        let value = Value::List(vec![Value::Null, Value::Map(map), Value::Bytes(vec![7])]);
        let bytes = postcard::to_allocvec(&value).unwrap();
        let back: Value = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, value);
    }
}
