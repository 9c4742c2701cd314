use std::{cell::RefCell, collections::HashMap, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{AtomicInteger, Function, HashTable, Queue, Vector};

/// Key of one array slot. Integer and string keys are independent
/// namespaces: `Int(1)` and `Str("1")` address different slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrayKey {
    Int(i64),
    Str(String),
}

/// Backing storage of a plain (non-shared) object: the class it was
/// instantiated from plus its property table.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectData {
    pub class: String,
    pub properties: HashMap<String, Value>,
}

/// Value: what interpreted code talks about.
///
/// A `Value` belongs to exactly one interpreter instance and is
/// deliberately not `Send` (`Rc`, `RefCell`). The only representation
/// that crosses a thread boundary is [`crate::Entry`]; container handles
/// are the only values that share state rather than copy it.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),

    /// Ordered key/value pairs, insertion order preserved.
    Array(Vec<(ArrayKey, Value)>),

    /// Plain object; shared within one interpreter only.
    Object(Rc<RefCell<ObjectData>>),

    /// Callable with an owned copy of its compiled metadata.
    Closure(Rc<Function>),

    /// Opaque handle to out-of-band state. Never marshalable.
    Resource(u32),

    Queue(Queue),
    HashTable(HashTable),
    Vector(Vector),
    AtomicInteger(AtomicInteger),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Closure(_) => "closure",
            Value::Resource(_) => "resource",
            Value::Queue(_) => "Queue",
            Value::HashTable(_) => "HashTable",
            Value::Vector(_) => "Vector",
            Value::AtomicInteger(_) => "AtomicInteger",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty() && s.as_ref() != "0",
            Value::Array(items) => !items.is_empty(),
            _ => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// Builds an integer-keyed array from a list of values, the shape the
    /// well-known `_THREAD` global takes for file tasks.
    pub fn array_of(values: Vec<Value>) -> Self {
        Value::Array(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (ArrayKey::Int(i as i64), v))
                .collect(),
        )
    }
}

// Equality is structural for data, identity for anything shared. Two
// handles are equal iff they point at the same internal block.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Resource(a), Value::Resource(b)) => a == b,
            (Value::Queue(a), Value::Queue(b)) => a.same_block(b),
            (Value::HashTable(a), Value::HashTable(b)) => a.same_block(b),
            (Value::Vector(a), Value::Vector(b)) => a.same_block(b),
            (Value::AtomicInteger(a), Value::AtomicInteger(b)) => a.same_block(b),
            _ => false,
        }
    }
}
