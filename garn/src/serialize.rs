use std::{cell::RefCell, collections::HashMap, rc::Rc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ArrayKey, ObjectData, Value};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SerializeError {
    #[error("value of type {0} cannot be serialized")]
    Unserializable(&'static str),
    #[error("corrupt serialized payload: {0}")]
    Corrupt(String),
}

/// Owned, thread-safe mirror of the serializable subset of [`Value`].
///
/// `Plain` does double duty: it is the wire form behind serialized
/// entries, and the compile-time constant form stored in function
/// literal tables and class property defaults. It carries no interior
/// mutability and no handles, so it is `Send + Sync` by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Plain {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(ArrayKey, Plain)>),
    Object {
        class: String,
        properties: Vec<(String, Plain)>,
    },
}

impl Plain {
    pub fn from_value(value: &Value) -> Result<Plain, SerializeError> {
        match value {
            Value::Null => Ok(Plain::Null),
            Value::Bool(b) => Ok(Plain::Bool(*b)),
            Value::Int(n) => Ok(Plain::Int(*n)),
            Value::Float(f) => Ok(Plain::Float(*f)),
            Value::Str(s) => Ok(Plain::Str(s.to_string())),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (key, item) in items {
                    out.push((key.clone(), Plain::from_value(item)?));
                }
                Ok(Plain::Array(out))
            }
            Value::Object(obj) => {
                let obj = obj.borrow();
                let mut properties = Vec::with_capacity(obj.properties.len());
                for (name, prop) in &obj.properties {
                    properties.push((name.clone(), Plain::from_value(prop)?));
                }
                // Property tables hash-iterate in arbitrary order; sort so
                // equal objects serialize to equal bytes.
                properties.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Plain::Object {
                    class: obj.class.clone(),
                    properties,
                })
            }
            other => Err(SerializeError::Unserializable(other.type_name())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Plain::Null => Value::Null,
            Plain::Bool(b) => Value::Bool(*b),
            Plain::Int(n) => Value::Int(*n),
            Plain::Float(f) => Value::Float(*f),
            Plain::Str(s) => Value::Str(Rc::from(s.as_str())),
            Plain::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|(key, item)| (key.clone(), item.to_value()))
                    .collect(),
            ),
            Plain::Object { class, properties } => {
                let properties: HashMap<String, Value> = properties
                    .iter()
                    .map(|(name, prop)| (name.clone(), prop.to_value()))
                    .collect();
                Value::Object(Rc::new(RefCell::new(ObjectData {
                    class: class.clone(),
                    properties,
                })))
            }
        }
    }
}

/// Serializes a value into an owned byte payload. Fails on resources,
/// closures and container handles, at any nesting depth.
pub fn serialize_value(value: &Value) -> Result<Box<[u8]>, SerializeError> {
    let plain = Plain::from_value(value)?;
    match bincode::serialize(&plain) {
        Ok(bytes) => Ok(bytes.into_boxed_slice()),
        Err(err) => Err(SerializeError::Corrupt(err.to_string())),
    }
}

/// Rebuilds a fresh value tree from a serialized payload. The result
/// shares no memory with whatever produced the bytes.
pub fn deserialize_value(bytes: &[u8]) -> Result<Value, SerializeError> {
    let plain: Plain =
        bincode::deserialize(bytes).map_err(|err| SerializeError::Corrupt(err.to_string()))?;
    Ok(plain.to_value())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nested_data() {
        let value = Value::Array(vec![
            (ArrayKey::Int(0), Value::Int(42)),
            (ArrayKey::Str("name".into()), Value::str("worker")),
            (
                ArrayKey::Int(1),
                Value::Array(vec![(ArrayKey::Int(0), Value::Float(2.5))]),
            ),
            (ArrayKey::Int(2), Value::Bool(true)),
            (ArrayKey::Int(3), Value::Null),
        ]);
        let bytes = serialize_value(&value).unwrap();
        assert_eq!(deserialize_value(&bytes).unwrap(), value);
    }

    #[test]
    fn round_trips_objects_by_structure() {
        let obj = Value::Object(Rc::new(RefCell::new(ObjectData {
            class: "Point".into(),
            properties: HashMap::from([
                ("x".into(), Value::Int(3)),
                ("y".into(), Value::Int(4)),
            ]),
        })));
        let bytes = serialize_value(&obj).unwrap();
        let back = deserialize_value(&bytes).unwrap();
        // Structurally equal, but a distinct allocation.
        assert_eq!(back, obj);
        match (&back, &obj) {
            (Value::Object(a), Value::Object(b)) => assert!(!Rc::ptr_eq(a, b)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn rejects_resources_at_any_depth() {
        let shallow = Value::Resource(3);
        assert_eq!(
            Plain::from_value(&shallow),
            Err(SerializeError::Unserializable("resource"))
        );

        let nested = Value::Array(vec![(ArrayKey::Int(0), Value::Resource(3))]);
        assert_eq!(
            Plain::from_value(&nested),
            Err(SerializeError::Unserializable("resource"))
        );
    }

    #[test]
    fn rejects_container_handles_inside_data() {
        let q = crate::Queue::new();
        let nested = Value::Array(vec![(ArrayKey::Int(0), Value::Queue(q))]);
        assert!(matches!(
            Plain::from_value(&nested),
            Err(SerializeError::Unserializable("Queue"))
        ));
    }

    #[test]
    fn corrupt_payload_is_an_error_not_a_panic() {
        assert!(matches!(
            deserialize_value(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(SerializeError::Corrupt(_))
        ));
    }
}
