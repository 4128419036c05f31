//! Canonical attribute sets used to key aggregation state
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Attribute key reported on the point that absorbs measurements past the cardinality limit
pub const OVERFLOW_KEY: &str = "otel.metric.overflow";

/// A homogeneous array attribute value
#[derive(Clone, Debug, serde::Serialize)]
#[serde(untagged)]
pub enum Array {
    Bool(Vec<bool>),
    I64(Vec<i64>),
    F64(Vec<f64>),
    String(Vec<String>),
}

/// A scalar or array attribute value
#[derive(Clone, Debug, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Array(Array),
}

// Floats compare by bit pattern so that equality agrees with hashing.
impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Array::Bool(a), Array::Bool(b)) => a == b,
            (Array::I64(a), Array::I64(b)) => a == b,
            (Array::F64(a), Array::F64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Array::String(a), Array::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Array {}

impl Hash for Array {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Array::Bool(v) => v.hash(state),
            Array::I64(v) => v.hash(state),
            Array::F64(v) => v.iter().for_each(|f| f.to_bits().hash(state)),
            Array::String(v) => v.hash(state),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Bool(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::F64(v) => v.to_bits().hash(state),
            Value::String(v) => v.hash(state),
            Value::Array(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
            Value::Array(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I64(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<bool>> for Value {
    fn from(v: Vec<bool>) -> Self {
        Value::Array(Array::Bool(v))
    }
}

impl From<Vec<i64>> for Value {
    fn from(v: Vec<i64>) -> Self {
        Value::Array(Array::I64(v))
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(Array::F64(v))
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(Array::String(v))
    }
}

/// A single attribute
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: String,
    pub value: Value,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An immutable, order-independent set of attributes.
///
/// Pairs are sorted by key and deduplicated (the last value given for a key
/// wins), so two sets built from the same attributes in any order compare and
/// hash equal. The hash is computed once at construction; cloning is a
/// reference count bump.
#[derive(Clone)]
pub struct AttributeSet {
    pairs: Arc<[KeyValue]>,
    hash: u64,
}

impl AttributeSet {
    /// Build a canonical set from a slice of attributes
    pub fn new(attributes: &[KeyValue]) -> Self {
        let mut sorted: Vec<KeyValue> = attributes.to_vec();
        // Stable sort keeps later duplicates after earlier ones.
        sorted.sort_by(|a, b| a.key.cmp(&b.key));

        let mut pairs: Vec<KeyValue> = Vec::with_capacity(sorted.len());
        for kv in sorted {
            match pairs.last_mut() {
                Some(last) if last.key == kv.key => *last = kv,
                _ => pairs.push(kv),
            }
        }

        let mut hasher = DefaultHasher::new();
        pairs.hash(&mut hasher);

        Self {
            pairs: pairs.into(),
            hash: hasher.finish(),
        }
    }

    /// The empty attribute set
    pub fn empty() -> Self {
        Self::new(&[])
    }

    /// The sentinel set reported for the overflow point
    pub fn overflow() -> Self {
        Self::new(&[KeyValue::new(OVERFLOW_KEY, true)])
    }

    /// Whether this is the overflow sentinel
    pub fn is_overflow(&self) -> bool {
        self.pairs.len() == 1
            && self.pairs[0].key == OVERFLOW_KEY
            && self.pairs[0].value == Value::Bool(true)
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.pairs
            .binary_search_by(|kv| kv.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.pairs[idx].value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.pairs.iter()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Default for AttributeSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.pairs == other.pairs
    }
}

impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for AttributeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.pairs.iter().map(|kv| (&kv.key, &kv.value)))
            .finish()
    }
}

impl From<&[KeyValue]> for AttributeSet {
    fn from(attributes: &[KeyValue]) -> Self {
        Self::new(attributes)
    }
}

impl FromIterator<KeyValue> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = KeyValue>>(iter: I) -> Self {
        let attributes: Vec<KeyValue> = iter.into_iter().collect();
        Self::new(&attributes)
    }
}

impl Serialize for AttributeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.pairs.len()))?;
        for kv in self.pairs.iter() {
            map.serialize_entry(&kv.key, &kv.value)?;
        }
        map.end()
    }
}
