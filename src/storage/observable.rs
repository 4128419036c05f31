use chrono::{DateTime, Utc};
use log::{error, warn};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};

use super::{build_points, fold_cardinality, Entries, MetricStorage, ReaderContext, OVERFLOW_SEQ};
use crate::aggregation::{Aggregate, Aggregation};
use crate::attributes::{AttributeSet, KeyValue};
use crate::collection::{CollectionHandle, HandleSet};
use crate::data::{MetricPoints, Temporality};
use crate::instrument::{InstrumentDescriptor, Number, NumberKind, NumberValue};

/// Observations gathered from one callback invocation
pub(crate) struct ObservationSink {
    name: String,
    monotonic: bool,
    observations: RefCell<Vec<(AttributeSet, NumberValue)>>,
}

impl ObservationSink {
    fn new(name: &str, monotonic: bool) -> Self {
        Self {
            name: name.to_string(),
            monotonic,
            observations: RefCell::new(Vec::new()),
        }
    }

    fn push(&self, value: NumberValue, attributes: &[KeyValue]) {
        if !value.is_finite() {
            warn!("Dropping non-finite observation for instrument '{}'", self.name);
            return;
        }
        if self.monotonic && value.is_negative() {
            warn!(
                "Dropping negative observation {} for monotonic instrument '{}'",
                value, self.name
            );
            return;
        }
        self.observations
            .borrow_mut()
            .push((AttributeSet::new(attributes), value));
    }

    fn into_observations(self) -> Vec<(AttributeSet, NumberValue)> {
        self.observations.into_inner()
    }
}

/// Handed to observable instrument callbacks to report current values
pub struct Observer<'a, T> {
    sink: &'a ObservationSink,
    _number: PhantomData<T>,
}

impl<T: Number> Observer<'_, T> {
    /// Report the current value for an attribute set. For observable sums the
    /// value is the running total, not an increment.
    pub fn observe(&self, value: T, attributes: &[KeyValue]) {
        self.sink.push(value.into_value(), attributes);
    }
}

/// Type-erased callback stored by an observable instrument
pub(crate) type Callback = Box<dyn Fn(&ObservationSink) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a typed user callback
pub(crate) fn erase_callback<T, F>(callback: F) -> Callback
where
    T: Number,
    F: Fn(&Observer<'_, T>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Box::new(move |sink: &ObservationSink| {
        let observer = Observer {
            sink,
            _number: PhantomData,
        };
        callback(&observer)
    })
}

struct ObservedState {
    last_collect: DateTime<Utc>,
    last_observed: HashMap<AttributeSet, NumberValue>,
}

/// Storage for an observable instrument.
///
/// Callbacks run once per reader collection. Each reader keeps its own
/// baseline of the last observed totals so a delta reader reports increments
/// while a cumulative reader reports the observation as-is.
pub(crate) struct ObservableStorage {
    descriptor: InstrumentDescriptor,
    aggregation: Aggregation,
    cardinality_limit: usize,
    callbacks: RwLock<Vec<Callback>>,
    start_time: DateTime<Utc>,
    state: Mutex<HashMap<CollectionHandle, ObservedState>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ObservableStorage {
    pub fn new(
        descriptor: InstrumentDescriptor,
        aggregation: Aggregation,
        cardinality_limit: usize,
    ) -> Self {
        Self {
            descriptor,
            aggregation,
            cardinality_limit,
            callbacks: RwLock::new(Vec::new()),
            start_time: Utc::now(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_callback(&self, callback: Callback) {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(callback),
            Err(_) => error!(
                "Callback list for instrument '{}' is poisoned, callback not registered",
                self.descriptor.name
            ),
        }
    }

    fn is_sum(&self) -> bool {
        matches!(self.aggregation, Aggregation::Sum { .. })
    }

    /// Run every callback. A callback that fails or panics loses its
    /// observations for this cycle only; the flag is false when any did.
    fn observe(&self) -> (Vec<(AttributeSet, NumberValue)>, bool) {
        let monotonic = matches!(self.aggregation, Aggregation::Sum { monotonic: true });
        let mut observations = Vec::new();
        let mut complete = true;

        let callbacks = match self.callbacks.read() {
            Ok(callbacks) => callbacks,
            Err(_) => {
                error!("Callback list for instrument '{}' is poisoned", self.descriptor.name);
                return (observations, false);
            }
        };

        for callback in callbacks.iter() {
            let sink = ObservationSink::new(&self.descriptor.name, monotonic);
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&sink))) {
                Ok(Ok(())) => observations.extend(sink.into_observations()),
                Ok(Err(e)) => {
                    complete = false;
                    error!(
                        "Callback for instrument '{}' failed, its observations are dropped for this collection: {}",
                        self.descriptor.name, e
                    );
                }
                Err(payload) => {
                    complete = false;
                    error!(
                        "Callback for instrument '{}' panicked, its observations are dropped for this collection: {}",
                        self.descriptor.name,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        (observations, complete)
    }

    /// Deduplicate (last wins) and bound the observations, in the order
    /// attribute sets were first seen this cycle.
    fn bound(&self, observations: Vec<(AttributeSet, NumberValue)>) -> HashMap<AttributeSet, (u64, NumberValue)> {
        let mut current: HashMap<AttributeSet, (u64, NumberValue)> = HashMap::new();
        let mut overflow: Option<NumberValue> = None;

        for (attributes, value) in observations {
            if let Some((_, existing)) = current.get_mut(&attributes) {
                *existing = value;
            } else if current.len() < self.cardinality_limit {
                let seq = current.len() as u64;
                current.insert(attributes, (seq, value));
            } else {
                overflow = Some(match (overflow, self.is_sum()) {
                    (Some(total), true) => total.add(value),
                    _ => value,
                });
            }
        }

        if let Some(value) = overflow {
            warn!(
                "Observations for instrument '{}' exceeded the cardinality limit of {}",
                self.descriptor.name, self.cardinality_limit
            );
            current.insert(AttributeSet::overflow(), (OVERFLOW_SEQ, value));
        }
        current
    }
}

impl MetricStorage for ObservableStorage {
    fn descriptor(&self) -> &InstrumentDescriptor {
        &self.descriptor
    }

    fn collect(
        &self,
        reader: &ReaderContext,
        _live: &HandleSet,
        now: DateTime<Utc>,
    ) -> Option<MetricPoints> {
        let (observations, complete) = self.observe();
        let current = self.bound(observations);

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!(
                    "Collection state for instrument '{}' is poisoned",
                    self.descriptor.name
                );
                return None;
            }
        };
        let observed = state.entry(reader.handle).or_insert_with(|| ObservedState {
            last_collect: self.start_time,
            last_observed: HashMap::new(),
        });

        let delta_sum = self.is_sum() && reader.temporality == Temporality::Delta;
        let monotonic = matches!(self.aggregation, Aggregation::Sum { monotonic: true });
        let kind: NumberKind = self.descriptor.number_kind;

        let mut entries = Entries::new();
        for (attributes, (seq, value)) in current.iter() {
            let reported = if delta_sum {
                let previous = observed
                    .last_observed
                    .get(attributes)
                    .copied()
                    .unwrap_or(NumberValue::zero(kind));
                let increment = value.sub(previous);
                // A monotonic total that went backwards was reset at the source.
                if monotonic && increment.is_negative() {
                    *value
                } else {
                    increment
                }
            } else {
                *value
            };

            let aggregate = if self.is_sum() {
                Aggregate::Sum(reported)
            } else {
                Aggregate::LastValue(reported)
            };
            entries.insert(attributes.clone(), (*seq, aggregate));
        }

        let start = match reader.temporality {
            Temporality::Delta => observed.last_collect,
            Temporality::Cumulative => self.start_time,
        };
        observed.last_collect = now;
        // Sets a failed callback did not report keep their last baseline, so
        // the next successful cycle reports only what changed since.
        let baseline = current.into_iter().map(|(a, (_, v))| (a, v));
        if complete {
            observed.last_observed = baseline.collect();
        } else {
            observed.last_observed.extend(baseline);
        }
        drop(state);

        let folded = fold_cardinality(entries, reader.cardinality_limit);
        build_points(&self.aggregation, folded, reader.temporality, start, now)
    }
}
