use chrono::{DateTime, Utc};
use log::{trace, warn};
use std::collections::HashMap;
use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{
    build_points, fold_cardinality, merge_entries, Entries, MetricStorage, ReaderContext,
    OVERFLOW_SEQ,
};
use crate::aggregation::{Accumulator, Aggregation};
use crate::attributes::AttributeSet;
use crate::collection::{CollectionHandle, HandleSet};
use crate::data::{MetricPoints, Temporality};
use crate::error::{MetricsError, Result};
use crate::instrument::{InstrumentDescriptor, NumberValue};

struct ReaderState {
    last_collect: DateTime<Utc>,
    /// Swept values this reader has not collected yet
    unconsumed: Entries,
    cumulative: Entries,
}

impl ReaderState {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            last_collect: start_time,
            unconsumed: Entries::new(),
            cumulative: Entries::new(),
        }
    }
}

/// Storage for a synchronous instrument.
///
/// Recording only takes the map's write lock to insert a new attribute set;
/// everything else is an atomic update on an existing accumulator. The
/// collection state is touched by collectors only.
pub(crate) struct SyncStorage {
    descriptor: InstrumentDescriptor,
    aggregation: Aggregation,
    cardinality_limit: usize,
    accumulators: RwLock<HashMap<AttributeSet, Arc<Accumulator>>>,
    overflow: Accumulator,
    overflowed: AtomicBool,
    start_time: DateTime<Utc>,
    readers: Mutex<HashMap<CollectionHandle, ReaderState>>,
}

impl SyncStorage {
    pub fn new(
        descriptor: InstrumentDescriptor,
        aggregation: Aggregation,
        cardinality_limit: usize,
    ) -> Self {
        let overflow = Accumulator::new(&aggregation, descriptor.number_kind, OVERFLOW_SEQ);
        Self {
            descriptor,
            aggregation,
            cardinality_limit,
            accumulators: RwLock::new(HashMap::new()),
            overflow,
            overflowed: AtomicBool::new(false),
            start_time: Utc::now(),
            readers: Mutex::new(HashMap::new()),
        }
    }

    /// Merge a measurement into the accumulator for `attributes`
    pub fn record(&self, value: NumberValue, attributes: &AttributeSet) -> Result<()> {
        let existing = {
            let map = self
                .accumulators
                .read()
                .map_err(|_| MetricsError::poisoned())?;
            map.get(attributes).cloned()
        };

        let accumulator = match existing {
            Some(accumulator) => accumulator,
            None => {
                let mut map = self
                    .accumulators
                    .write()
                    .map_err(|_| MetricsError::poisoned())?;

                if let Some(accumulator) = map.get(attributes) {
                    Arc::clone(accumulator)
                } else if map.len() >= self.cardinality_limit {
                    drop(map);
                    self.record_overflow(value);
                    return Ok(());
                } else {
                    // Accumulators are never removed, so the map size is a
                    // stable insertion sequence.
                    let accumulator = Arc::new(Accumulator::new(
                        &self.aggregation,
                        self.descriptor.number_kind,
                        map.len() as u64,
                    ));
                    map.insert(attributes.clone(), Arc::clone(&accumulator));
                    trace!(
                        "Instrument '{}' now tracks {} attribute sets",
                        self.descriptor.name,
                        map.len()
                    );
                    accumulator
                }
            }
        };

        accumulator.merge(value);
        Ok(())
    }

    fn record_overflow(&self, value: NumberValue) {
        self.overflow.merge(value);
        if !self.overflowed.swap(true, Ordering::Relaxed) {
            warn!(
                "Instrument '{}' reached its cardinality limit of {}; further attribute sets are folded into the overflow point",
                self.descriptor.name, self.cardinality_limit
            );
        }
    }

    /// Whether any measurement has been folded into the overflow accumulator
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Relaxed)
    }

    /// Number of live accumulators, counting the overflow one once used
    pub fn accumulator_count(&self) -> usize {
        let tracked = self.accumulators.read().map(|m| m.len()).unwrap_or(0);
        tracked + usize::from(self.is_overflowed())
    }

    /// Reset every accumulator and return what was recorded since the last sweep
    fn sweep(&self) -> Entries {
        let mut swept = Entries::new();

        match self.accumulators.read() {
            Ok(map) => {
                for (attributes, accumulator) in map.iter() {
                    if let Some(aggregate) = accumulator.snapshot(true) {
                        swept.insert(attributes.clone(), (accumulator.seq(), aggregate));
                    }
                }
            }
            Err(_) => warn!(
                "Accumulator map for instrument '{}' is poisoned, skipping sweep",
                self.descriptor.name
            ),
        }

        if let Some(aggregate) = self.overflow.snapshot(true) {
            swept.insert(AttributeSet::overflow(), (OVERFLOW_SEQ, aggregate));
        }

        swept
    }
}

impl MetricStorage for SyncStorage {
    fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }

    fn collect(
        &self,
        reader: &ReaderContext,
        live: &HandleSet,
        now: DateTime<Utc>,
    ) -> Option<MetricPoints> {
        let mut readers = match self.readers.lock() {
            Ok(readers) => readers,
            Err(_) => {
                warn!(
                    "Collection state for instrument '{}' is poisoned",
                    self.descriptor.name
                );
                return None;
            }
        };

        // Every live reader gets its own copy of the sweep, so one that never
        // collects holds at most one entry per attribute set.
        readers.retain(|handle, _| *handle == reader.handle || live.contains(*handle));
        for handle in live.iter().chain(iter::once(reader.handle)) {
            readers
                .entry(handle)
                .or_insert_with(|| ReaderState::new(self.start_time));
        }

        let swept = self.sweep();
        if !swept.is_empty() {
            for state in readers.values_mut() {
                merge_entries(&mut state.unconsumed, &swept);
            }
        }

        let start_time = self.start_time;
        let reader_state = readers
            .entry(reader.handle)
            .or_insert_with(|| ReaderState::new(start_time));
        let interval = std::mem::take(&mut reader_state.unconsumed);

        let (entries, start) = match reader.temporality {
            Temporality::Delta => (interval, reader_state.last_collect),
            Temporality::Cumulative => {
                merge_entries(&mut reader_state.cumulative, &interval);
                (reader_state.cumulative.clone(), start_time)
            }
        };
        reader_state.last_collect = now;
        drop(readers);

        let folded = fold_cardinality(entries, reader.cardinality_limit);
        build_points(&self.aggregation, folded, reader.temporality, start, now)
    }
}
