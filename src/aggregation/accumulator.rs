use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::{Aggregate, Aggregation, HistogramState};
use crate::instrument::{NumberKind, NumberValue};

enum Cell {
    Sum { bits: AtomicU64, kind: NumberKind },
    LastValue { bits: AtomicU64, kind: NumberKind },
    Histogram { state: Mutex<HistogramState>, bounds: Arc<[f64]> },
}

/// Mutable aggregation state for one (instrument, attribute set).
///
/// Merges into different accumulators never contend. Integer sums are a
/// single `fetch_add`; float sums and last values swap the bit pattern; a
/// histogram locks only its own state.
pub(crate) struct Accumulator {
    cell: Cell,
    updated: AtomicBool,
    seq: u64,
}

impl Accumulator {
    /// `seq` orders accumulators by insertion and is stable for their lifetime
    pub fn new(aggregation: &Aggregation, kind: NumberKind, seq: u64) -> Self {
        let cell = match aggregation {
            Aggregation::Sum { .. } => Cell::Sum {
                bits: AtomicU64::new(NumberValue::zero(kind).to_bits()),
                kind,
            },
            Aggregation::LastValue => Cell::LastValue {
                bits: AtomicU64::new(NumberValue::zero(kind).to_bits()),
                kind,
            },
            Aggregation::Histogram { bounds } => Cell::Histogram {
                state: Mutex::new(HistogramState::new(bounds)),
                bounds: Arc::clone(bounds),
            },
        };

        Self {
            cell,
            updated: AtomicBool::new(false),
            seq,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn merge(&self, value: NumberValue) {
        match &self.cell {
            Cell::Sum { bits, .. } => match value {
                NumberValue::I64(v) => {
                    bits.fetch_add(v as u64, Ordering::Relaxed);
                }
                NumberValue::F64(v) => {
                    let _ = bits.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                        Some((f64::from_bits(current) + v).to_bits())
                    });
                }
            },
            Cell::LastValue { bits, .. } => bits.store(value.to_bits(), Ordering::Relaxed),
            Cell::Histogram { state, bounds } => state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(value.as_f64(), bounds),
        }
        // Flag after the value lands so a concurrent snapshot never clears the
        // flag for a value it did not take.
        self.updated.store(true, Ordering::Release);
    }

    /// Take the current aggregate, or `None` if nothing was recorded since the
    /// last reset. With `reset` the interval starts over; last values are kept.
    pub fn snapshot(&self, reset: bool) -> Option<Aggregate> {
        let updated = if reset {
            self.updated.swap(false, Ordering::AcqRel)
        } else {
            self.updated.load(Ordering::Acquire)
        };
        if !updated {
            return None;
        }

        let aggregate = match &self.cell {
            Cell::Sum { bits, kind } => {
                let zero = NumberValue::zero(*kind).to_bits();
                let raw = if reset {
                    bits.swap(zero, Ordering::Relaxed)
                } else {
                    bits.load(Ordering::Relaxed)
                };
                Aggregate::Sum(NumberValue::from_bits(*kind, raw))
            }
            Cell::LastValue { bits, kind } => {
                Aggregate::LastValue(NumberValue::from_bits(*kind, bits.load(Ordering::Relaxed)))
            }
            Cell::Histogram { state, bounds } => {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if reset {
                    Aggregate::Histogram(std::mem::replace(&mut *state, HistogramState::new(bounds)))
                } else {
                    Aggregate::Histogram(state.clone())
                }
            }
        };

        Some(aggregate)
    }
}
