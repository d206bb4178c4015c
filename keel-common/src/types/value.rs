// Function values
//
// INTENTION:
// A closed set of value kinds that can cross a service boundary: function parameters,
// function results and event items. Structured kinds (object/array) stay as JSON so that
// they can be forwarded to RPC peers untouched. Raw buffers never go through a queue in
// process; over the wire they are carried as base64 strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Declared type of a parameter or event item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Boolean,
    Number,
    String,
    Object,
    Array,
    RawBuffer,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Boolean => "Boolean",
            ValueType::Number => "Number",
            ValueType::String => "String",
            ValueType::Object => "Object",
            ValueType::Array => "Array",
            ValueType::RawBuffer => "RawBuffer",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value passed to or returned from a service function, or carried by an event
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionValue {
    Boolean(bool),
    Number(f64),
    String(String),
    Object(Map<String, Value>),
    Array(Vec<Value>),
    RawBuffer(Bytes),
}

/// Parameters of a function call, keyed by parameter name
pub type FunctionParameterMap = HashMap<String, FunctionValue>;

/// Items of an event, keyed by item name
pub type EventItemMap = HashMap<String, FunctionValue>;

impl FunctionValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            FunctionValue::Boolean(_) => ValueType::Boolean,
            FunctionValue::Number(_) => ValueType::Number,
            FunctionValue::String(_) => ValueType::String,
            FunctionValue::Object(_) => ValueType::Object,
            FunctionValue::Array(_) => ValueType::Array,
            FunctionValue::RawBuffer(_) => ValueType::RawBuffer,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FunctionValue::Boolean(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FunctionValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FunctionValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            FunctionValue::Object(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            FunctionValue::Array(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            FunctionValue::RawBuffer(value) => Some(value),
            _ => None,
        }
    }

    /// JSON form of the value. Raw buffers become base64 strings.
    pub fn to_json(&self) -> Value {
        match self {
            FunctionValue::Boolean(value) => Value::Bool(*value),
            FunctionValue::Number(value) => serde_json::Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FunctionValue::String(value) => Value::String(value.clone()),
            FunctionValue::Object(value) => Value::Object(value.clone()),
            FunctionValue::Array(value) => Value::Array(value.clone()),
            FunctionValue::RawBuffer(value) => Value::String(BASE64.encode(value)),
        }
    }

    /// Convert an untyped JSON value. `null` has no counterpart and is rejected.
    pub fn from_json(value: Value) -> Result<Self, String> {
        match value {
            Value::Null => Err("null is not a valid function value".to_string()),
            Value::Bool(value) => Ok(FunctionValue::Boolean(value)),
            Value::Number(value) => value
                .as_f64()
                .map(FunctionValue::Number)
                .ok_or_else(|| format!("number `{value}` is not representable")),
            Value::String(value) => Ok(FunctionValue::String(value)),
            Value::Array(value) => Ok(FunctionValue::Array(value)),
            Value::Object(value) => Ok(FunctionValue::Object(value)),
        }
    }

    /// Convert a JSON value guided by the declared type.
    ///
    /// Only a string declared as `RawBuffer` is treated differently from `from_json`:
    /// it is decoded from base64. Any other mismatch is left for schema validation.
    pub fn from_json_as(value: Value, expected: ValueType) -> Result<Self, String> {
        match (expected, value) {
            (ValueType::RawBuffer, Value::String(encoded)) => BASE64
                .decode(encoded.as_bytes())
                .map(|decoded| FunctionValue::RawBuffer(Bytes::from(decoded)))
                .map_err(|e| format!("invalid base64 raw buffer: {e}")),
            (_, value) => Self::from_json(value),
        }
    }
}

impl fmt::Display for FunctionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionValue::RawBuffer(value) => write!(f, "RawBuffer({} bytes)", value.len()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl Serialize for FunctionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FunctionValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FunctionValue::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for FunctionValue {
    fn from(value: bool) -> Self {
        FunctionValue::Boolean(value)
    }
}

impl From<f64> for FunctionValue {
    fn from(value: f64) -> Self {
        FunctionValue::Number(value)
    }
}

macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for FunctionValue {
            fn from(value: $t) -> Self {
                FunctionValue::Number(value as f64)
            }
        })*
    };
}

impl_from_integer!(i32, i64, u8, u16, u32, u64, usize, f32);

impl From<&str> for FunctionValue {
    fn from(value: &str) -> Self {
        FunctionValue::String(value.to_string())
    }
}

impl From<String> for FunctionValue {
    fn from(value: String) -> Self {
        FunctionValue::String(value)
    }
}

impl From<Map<String, Value>> for FunctionValue {
    fn from(value: Map<String, Value>) -> Self {
        FunctionValue::Object(value)
    }
}

impl From<Vec<Value>> for FunctionValue {
    fn from(value: Vec<Value>) -> Self {
        FunctionValue::Array(value)
    }
}

impl From<Bytes> for FunctionValue {
    fn from(value: Bytes) -> Self {
        FunctionValue::RawBuffer(value)
    }
}

impl From<Vec<u8>> for FunctionValue {
    fn from(value: Vec<u8>) -> Self {
        FunctionValue::RawBuffer(Bytes::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_rejects_null() {
        assert!(FunctionValue::from_json(Value::Null).is_err());
        assert_eq!(
            FunctionValue::from_json(json!(3)).unwrap(),
            FunctionValue::Number(3.0)
        );
        assert_eq!(
            FunctionValue::from_json(json!({"a": 1})).unwrap().value_type(),
            ValueType::Object
        );
    }

    #[test]
    fn test_raw_buffer_travels_as_base64() {
        let value = FunctionValue::from(vec![1u8, 2, 3, 255]);
        let encoded = value.to_json();
        assert_eq!(encoded, json!("AQID/w=="));

        let decoded = FunctionValue::from_json_as(encoded.clone(), ValueType::RawBuffer).unwrap();
        assert_eq!(decoded, value);

        // Without the declared type the same JSON is just a string
        assert_eq!(
            FunctionValue::from_json(encoded).unwrap().value_type(),
            ValueType::String
        );
        assert!(FunctionValue::from_json_as(json!("not base64!"), ValueType::RawBuffer).is_err());
    }
}
