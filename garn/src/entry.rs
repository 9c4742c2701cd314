use std::sync::Arc;

use thiserror::Error;

use crate::{
    serialize::{deserialize_value, serialize_value, SerializeError},
    AtomicInteger, AtomicIntegerInner, Function, HashTable, HashTableInner, Queue, QueueInner,
    Value, Vector, VectorInner,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MarshalError {
    #[error("value of type {0} cannot cross a thread boundary")]
    Unserializable(&'static str),
    #[error("corrupt serialized payload: {0}")]
    Corrupt(String),
}

impl From<SerializeError> for MarshalError {
    fn from(err: SerializeError) -> Self {
        match err {
            SerializeError::Unserializable(kind) => MarshalError::Unserializable(kind),
            SerializeError::Corrupt(msg) => MarshalError::Corrupt(msg),
        }
    }
}

/// Errors raised by shared container operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContainerError {
    #[error("attempted to read an element from an empty container")]
    Empty,
    #[error("index {index} out of bounds (size {size})")]
    OutOfBounds { index: i64, size: usize },
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// Entry: the only representation a value takes while it sits in a
/// shared container or a task argument list.
///
/// Scalars are stored inline, strings and serialized trees as owned
/// buffers, container handles as a second `Arc` on the same internal
/// block. An `Entry` is `Send + Sync` and owns everything it holds, so
/// dropping one releases exactly its own share.
#[derive(Debug, Clone)]
pub enum Entry {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Box<str>),
    /// Serialized array tree.
    Array(Box<[u8]>),
    /// Serialized plain object.
    Object(Box<[u8]>),
    /// Owned copy of the closure's compiled metadata.
    Closure(Box<Function>),
    Queue(Arc<QueueInner>),
    HashTable(Arc<HashTableInner>),
    Vector(Arc<VectorInner>),
    AtomicInteger(Arc<AtomicIntegerInner>),
}

/// Converts a value into its thread-crossing form. Deep data is
/// serialized eagerly, so a later unmarshal cannot observe mutations
/// made after this call. Container handles gain one reference.
pub fn to_entry(value: &Value) -> Result<Entry, MarshalError> {
    match value {
        Value::Null => Ok(Entry::Null),
        Value::Bool(b) => Ok(Entry::Bool(*b)),
        Value::Int(n) => Ok(Entry::Int(*n)),
        Value::Float(f) => Ok(Entry::Float(*f)),
        Value::Str(s) => Ok(Entry::Str(Box::from(s.as_ref()))),
        Value::Array(_) => Ok(Entry::Array(serialize_value(value)?)),
        Value::Object(_) => Ok(Entry::Object(serialize_value(value)?)),
        Value::Closure(f) => Ok(Entry::Closure(Box::new(f.as_ref().clone()))),
        Value::Resource(_) => Err(MarshalError::Unserializable("resource")),
        Value::Queue(q) => Ok(Entry::Queue(q.share())),
        Value::HashTable(h) => Ok(Entry::HashTable(h.share())),
        Value::Vector(v) => Ok(Entry::Vector(v.share())),
        Value::AtomicInteger(a) => Ok(Entry::AtomicInteger(a.share())),
    }
}

/// Consumes an entry and rebuilds a value for the calling interpreter.
/// Deep data comes back as a fresh allocation; container handles keep
/// the reference the entry held, so the refcount is unchanged net.
pub fn from_entry(entry: Entry) -> Result<Value, MarshalError> {
    match entry {
        Entry::Null => Ok(Value::Null),
        Entry::Bool(b) => Ok(Value::Bool(b)),
        Entry::Int(n) => Ok(Value::Int(n)),
        Entry::Float(f) => Ok(Value::Float(f)),
        Entry::Str(s) => Ok(Value::str(&s)),
        Entry::Array(bytes) | Entry::Object(bytes) => Ok(deserialize_value(&bytes)?),
        Entry::Closure(f) => Ok(Value::Closure(std::rc::Rc::new(*f))),
        Entry::Queue(inner) => Ok(Value::Queue(Queue::from_inner(inner))),
        Entry::HashTable(inner) => Ok(Value::HashTable(HashTable::from_inner(inner))),
        Entry::Vector(inner) => Ok(Value::Vector(Vector::from_inner(inner))),
        Entry::AtomicInteger(inner) => Ok(Value::AtomicInteger(AtomicInteger::from_inner(inner))),
    }
}

/// Non-consuming read of an entry, used for peeks and snapshots where
/// the container keeps the element.
pub fn read_entry(entry: &Entry) -> Result<Value, MarshalError> {
    from_entry(entry.clone())
}
