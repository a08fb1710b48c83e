//! Dynamically typed values carried in envelopes.
//!
//! Parameters and results cross the wire as [`Value`]s tagged with a
//! [`TypeDescriptor`]. The enum is self-contained so that both the
//! self-describing JSON serializer and the schema-driven postcard serializer
//! can carry it unchanged.
//!
//! Typed code never has to build `Value`s by hand: [`Value::encode`] and
//! [`Value::decode`] bridge any serde type through `serde_json`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::error::{KrpcError, Result};

/// A dynamically typed RPC value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Describes the type of a parameter or result.
///
/// `Named` identifies a user type (a struct sent as a map), mirroring the
/// class descriptor a caller would attach to a parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Null,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
    Named(String),
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Null => f.write_str("null"),
            TypeDescriptor::Bool => f.write_str("bool"),
            TypeDescriptor::Int => f.write_str("int"),
            TypeDescriptor::Float => f.write_str("float"),
            TypeDescriptor::String => f.write_str("string"),
            TypeDescriptor::Bytes => f.write_str("bytes"),
            TypeDescriptor::List => f.write_str("list"),
            TypeDescriptor::Map => f.write_str("map"),
            TypeDescriptor::Named(name) => f.write_str(name),
        }
    }
}

impl Value {
    /// The structural type descriptor of this value.
    pub fn type_descriptor(&self) -> TypeDescriptor {
        match self {
            Value::Null => TypeDescriptor::Null,
            Value::Bool(_) => TypeDescriptor::Bool,
            Value::Int(_) => TypeDescriptor::Int,
            Value::Float(_) => TypeDescriptor::Float,
            Value::String(_) => TypeDescriptor::String,
            Value::Bytes(_) => TypeDescriptor::Bytes,
            Value::List(_) => TypeDescriptor::List,
            Value::Map(_) => TypeDescriptor::Map,
        }
    }

    /// Whether every float in this value, however deeply nested, is finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::List(items) => items.iter().all(Value::is_finite),
            Value::Map(entries) => entries.values().all(Value::is_finite),
            _ => true,
        }
    }

    /// Converts any serializable type into a `Value`.
    ///
    /// # Example
    ///
    /// ```
    /// use krpc_common::protocol::Value;
    ///
    /// let value = Value::encode(&vec![1, 2]).unwrap();
    /// assert_eq!(value, Value::List(vec![Value::Int(1), Value::Int(2)]));
    /// ```
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::from_json(serde_json::to_value(value)?))
    }

    /// Converts this value into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_json()).map_err(|e| {
            KrpcError::Serialization(format!(
                "cannot decode {} value: {}",
                self.type_descriptor(),
                e
            ))
        })
    }

    /// Builds a value from a JSON document.
    ///
    /// Integers that do not fit in an `i64` become floats.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders this value as JSON.
    ///
    /// Bytes become an array of numbers and non-finite floats become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| serde_json::Value::from(*b)).collect())
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
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
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct User {
        id: i32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_struct_encode_decode() {
        let user = User {
            id: 7,
            name: "ada".to_string(),
            active: true,
        };

        let value = Value::encode(&user).unwrap();
        assert_eq!(value.type_descriptor(), TypeDescriptor::Map);

        let decoded: User = value.decode().unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_non_finite_floats_found_when_nested() {
        assert!(Value::Float(1.5).is_finite());
        assert!(!Value::Float(f64::NAN).is_finite());

        let mut map = BTreeMap::new();
        map.insert("score".to_string(), Value::Float(f64::NEG_INFINITY));
        let nested = Value::List(vec![Value::Int(1), Value::Map(map)]);
        assert!(!nested.is_finite());
    }

    #[test]
    fn test_from_json_numbers() {
        assert_eq!(Value::from_json(json!(42)), Value::Int(42));
        assert_eq!(Value::from_json(json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_json(json!(u64::MAX)),
            Value::Float(u64::MAX as f64)
        );
    }

    #[test]
    fn test_decode_type_mismatch_is_serialization_error() {
        let value = Value::String("not a number".to_string());
        let result: Result<i64> = value.decode();
        assert!(matches!(result, Err(KrpcError::Serialization(_))));
    }

    #[test]
    fn test_non_finite_float_renders_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_named_descriptor_display() {
        assert_eq!(TypeDescriptor::Named("User".to_string()).to_string(), "User");
        assert_eq!(TypeDescriptor::Int.to_string(), "int");
    }
}
