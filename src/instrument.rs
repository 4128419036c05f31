//! Instrument identity, kinds and measurement values
use serde::Serialize;
use std::fmt::{self, Debug};

/// Whether an instrument records integers or floating point numbers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberKind {
    I64,
    F64,
}

/// A single measured or aggregated number
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NumberValue {
    I64(i64),
    F64(f64),
}

impl NumberValue {
    /// The zero of the given kind
    pub fn zero(kind: NumberKind) -> Self {
        match kind {
            NumberKind::I64 => NumberValue::I64(0),
            NumberKind::F64 => NumberValue::F64(0.0),
        }
    }

    pub fn kind(&self) -> NumberKind {
        match self {
            NumberValue::I64(_) => NumberKind::I64,
            NumberValue::F64(_) => NumberKind::F64,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            NumberValue::I64(v) => v as f64,
            NumberValue::F64(v) => v,
        }
    }

    pub fn is_negative(&self) -> bool {
        match *self {
            NumberValue::I64(v) => v < 0,
            NumberValue::F64(v) => v < 0.0,
        }
    }

    pub fn is_finite(&self) -> bool {
        match *self {
            NumberValue::I64(_) => true,
            NumberValue::F64(v) => v.is_finite(),
        }
    }

    /// Raw bit pattern, used by the atomic cells
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            NumberValue::I64(v) => v as u64,
            NumberValue::F64(v) => v.to_bits(),
        }
    }

    pub(crate) fn from_bits(kind: NumberKind, bits: u64) -> Self {
        match kind {
            NumberKind::I64 => NumberValue::I64(bits as i64),
            NumberKind::F64 => NumberValue::F64(f64::from_bits(bits)),
        }
    }

    /// Addition within one kind; integer sums wrap like the atomic counters do
    pub(crate) fn add(self, other: NumberValue) -> NumberValue {
        match (self, other) {
            (NumberValue::I64(a), NumberValue::I64(b)) => NumberValue::I64(a.wrapping_add(b)),
            (NumberValue::F64(a), b) => NumberValue::F64(a + b.as_f64()),
            (NumberValue::I64(a), NumberValue::F64(b)) => NumberValue::F64(a as f64 + b),
        }
    }

    pub(crate) fn sub(self, other: NumberValue) -> NumberValue {
        match (self, other) {
            (NumberValue::I64(a), NumberValue::I64(b)) => NumberValue::I64(a.wrapping_sub(b)),
            (NumberValue::F64(a), b) => NumberValue::F64(a - b.as_f64()),
            (NumberValue::I64(a), NumberValue::F64(b)) => NumberValue::F64(a as f64 - b),
        }
    }
}

impl fmt::Display for NumberValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NumberValue::I64(v) => write!(f, "{}", v),
            NumberValue::F64(v) => write!(f, "{}", v),
        }
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
}

/// Numeric types instruments can be created for
pub trait Number: private::Sealed + Copy + PartialOrd + Debug + Send + Sync + 'static {
    const KIND: NumberKind;

    fn into_value(self) -> NumberValue;
}

impl Number for i64 {
    const KIND: NumberKind = NumberKind::I64;

    fn into_value(self) -> NumberValue {
        NumberValue::I64(self)
    }
}

impl Number for f64 {
    const KIND: NumberKind = NumberKind::F64;

    fn into_value(self) -> NumberValue {
        NumberValue::F64(self)
    }
}

/// The declared kind of an instrument
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum InstrumentKind {
    Counter,
    UpDownCounter,
    Gauge,
    Histogram,
    ObservableCounter,
    ObservableUpDownCounter,
    ObservableGauge,
}

impl InstrumentKind {
    /// Every kind, in `index()` order
    pub const ALL: [InstrumentKind; 7] = [
        InstrumentKind::Counter,
        InstrumentKind::UpDownCounter,
        InstrumentKind::Gauge,
        InstrumentKind::Histogram,
        InstrumentKind::ObservableCounter,
        InstrumentKind::ObservableUpDownCounter,
        InstrumentKind::ObservableGauge,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            InstrumentKind::Counter => 0,
            InstrumentKind::UpDownCounter => 1,
            InstrumentKind::Gauge => 2,
            InstrumentKind::Histogram => 3,
            InstrumentKind::ObservableCounter => 4,
            InstrumentKind::ObservableUpDownCounter => 5,
            InstrumentKind::ObservableGauge => 6,
        }
    }

    /// Whether recorded values may only increase the reported total
    pub fn is_monotonic(self) -> bool {
        matches!(
            self,
            InstrumentKind::Counter | InstrumentKind::ObservableCounter | InstrumentKind::Histogram
        )
    }

    /// Whether the instrument is driven by callbacks at collection time
    pub fn is_observable(self) -> bool {
        matches!(
            self,
            InstrumentKind::ObservableCounter
                | InstrumentKind::ObservableUpDownCounter
                | InstrumentKind::ObservableGauge
        )
    }
}

/// Name and version of the library producing metrics
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct InstrumentationScope {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            schema_url: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_schema_url(mut self, schema_url: impl Into<String>) -> Self {
        self.schema_url = Some(schema_url.into());
        self
    }
}

/// Full identity of an instrument
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstrumentDescriptor {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub kind: InstrumentKind,
    pub number_kind: NumberKind,
}

impl InstrumentDescriptor {
    /// Two descriptors that collide on name within one scope
    pub(crate) fn conflicts_with(&self, other: &InstrumentDescriptor) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self != other
    }
}

/// Check an instrument name: an ASCII letter followed by up to 254
/// alphanumerics, `_`, `.`, `-` or `/`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    name.len() <= 255
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("http.server.duration"));
        assert!(is_valid_name("queue/depth_total-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("1requests"));
        assert!(!is_valid_name("bad name"));
        assert!(!is_valid_name(&"a".repeat(256)));
    }

    #[test]
    fn test_number_value_bits_roundtrip_negative_integer() {
        let value = NumberValue::I64(-42);
        assert_eq!(NumberValue::from_bits(NumberKind::I64, value.to_bits()), value);
    }

    #[test]
    fn test_kind_index_matches_all() {
        for (i, kind) in InstrumentKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }

    #[test]
    fn test_conflicting_descriptors() {
        let base = InstrumentDescriptor {
            name: "requests".to_string(),
            description: String::new(),
            unit: "1".to_string(),
            kind: InstrumentKind::Counter,
            number_kind: NumberKind::I64,
        };
        let mut other = base.clone();
        other.name = "Requests".to_string();
        other.kind = InstrumentKind::UpDownCounter;

        assert!(base.conflicts_with(&other));
        assert!(!base.conflicts_with(&base.clone()));
    }
}
