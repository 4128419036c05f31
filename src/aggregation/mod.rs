//! Aggregation state: what an instrument's accumulators compute
mod accumulator;
mod histogram;

pub(crate) use accumulator::Accumulator;
pub use histogram::{normalize_boundaries, HistogramState, DEFAULT_BOUNDARIES};

use std::sync::Arc;

use crate::instrument::{InstrumentKind, NumberValue};

/// How measurements for one instrument are combined
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    Sum { monotonic: bool },
    LastValue,
    Histogram { bounds: Arc<[f64]> },
}

impl Aggregation {
    /// The default aggregation for an instrument kind
    pub fn default_for(kind: InstrumentKind, boundaries: Option<Vec<f64>>) -> Self {
        match kind {
            InstrumentKind::Counter | InstrumentKind::ObservableCounter => {
                Aggregation::Sum { monotonic: true }
            }
            InstrumentKind::UpDownCounter | InstrumentKind::ObservableUpDownCounter => {
                Aggregation::Sum { monotonic: false }
            }
            InstrumentKind::Gauge | InstrumentKind::ObservableGauge => Aggregation::LastValue,
            InstrumentKind::Histogram => {
                let bounds = boundaries
                    .map(normalize_boundaries)
                    .unwrap_or_else(|| DEFAULT_BOUNDARIES.to_vec());
                Aggregation::Histogram {
                    bounds: bounds.into(),
                }
            }
        }
    }
}

/// An aggregated value taken out of an accumulator
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregate {
    Sum(NumberValue),
    LastValue(NumberValue),
    Histogram(HistogramState),
}

impl Aggregate {
    /// Fold a later aggregate into this one
    pub fn merge(&mut self, newer: &Aggregate) {
        match (self, newer) {
            (Aggregate::Sum(a), Aggregate::Sum(b)) => *a = a.add(*b),
            (Aggregate::LastValue(a), Aggregate::LastValue(b)) => *a = *b,
            (Aggregate::Histogram(a), Aggregate::Histogram(b)) => a.merge(b),
            (this, other) => {
                log::debug!("Ignoring merge of mismatched aggregates {:?} into {:?}", other, this);
            }
        }
    }

    pub fn number(&self) -> Option<NumberValue> {
        match self {
            Aggregate::Sum(v) | Aggregate::LastValue(v) => Some(*v),
            Aggregate::Histogram(_) => None,
        }
    }
}
