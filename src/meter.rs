//! Meters and the instruments they create
use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::aggregation::Aggregation;
use crate::attributes::{AttributeSet, KeyValue};
use crate::collection::{HandleSet, RegisteredReader};
use crate::data::MetricData;
use crate::instrument::{
    is_valid_name, InstrumentDescriptor, InstrumentKind, InstrumentationScope, Number, NumberKind,
};
use crate::resource::Resource;
use crate::storage::{
    erase_callback, Callback, MetricStorage, ObservableStorage, Observer, SyncStorage,
    DEFAULT_CARDINALITY_LIMIT,
};

#[derive(Clone)]
enum InstrumentStorage {
    Sync(Arc<SyncStorage>),
    Observable(Arc<ObservableStorage>),
}

impl InstrumentStorage {
    fn as_storage(&self) -> &dyn MetricStorage {
        match self {
            InstrumentStorage::Sync(storage) => storage.as_ref(),
            InstrumentStorage::Observable(storage) => storage.as_ref(),
        }
    }
}

/// Everything registered under one instrumentation scope
pub(crate) struct MeterState {
    scope: InstrumentationScope,
    readers: Arc<[RegisteredReader]>,
    instruments: Mutex<Vec<InstrumentStorage>>,
}

impl MeterState {
    pub fn new(scope: InstrumentationScope, readers: Arc<[RegisteredReader]>) -> Self {
        Self {
            scope,
            readers,
            instruments: Mutex::new(Vec::new()),
        }
    }

    pub fn scope(&self) -> &InstrumentationScope {
        &self.scope
    }

    /// Storage keeps as many attribute sets as the most generous reader
    /// allows; each reader then folds its own view down to its limit.
    fn storage_limit(&self, kind: InstrumentKind) -> usize {
        self.readers
            .iter()
            .map(|reader| reader.cardinality_limit(kind))
            .max()
            .unwrap_or(DEFAULT_CARDINALITY_LIMIT)
    }

    /// Find a storage registered with the same descriptor, or add one.
    ///
    /// A name clash with a different descriptor is reported and both
    /// instruments are kept.
    fn register<F>(&self, descriptor: &InstrumentDescriptor, create: F) -> Option<InstrumentStorage>
    where
        F: FnOnce() -> InstrumentStorage,
    {
        let mut instruments = match self.instruments.lock() {
            Ok(instruments) => instruments,
            Err(_) => {
                error!(
                    "Instrument list of meter '{}' is poisoned, '{}' will not be collected",
                    self.scope.name, descriptor.name
                );
                return None;
            }
        };

        for existing in instruments.iter() {
            let registered = existing.as_storage().descriptor();
            if registered == descriptor {
                debug!("Reusing instrument '{}' in meter '{}'", descriptor.name, self.scope.name);
                return Some(existing.clone());
            }
            if registered.conflicts_with(descriptor) {
                warn!(
                    "Instrument '{}' in meter '{}' is already registered as {:?} {:?}; both will be exported",
                    descriptor.name, self.scope.name, registered.kind, registered.number_kind
                );
            }
        }

        let storage = create();
        instruments.push(storage.clone());
        Some(storage)
    }

    fn sync_storage(
        &self,
        descriptor: InstrumentDescriptor,
        boundaries: Option<Vec<f64>>,
    ) -> Option<Arc<SyncStorage>> {
        let aggregation = Aggregation::default_for(descriptor.kind, boundaries);
        let limit = self.storage_limit(descriptor.kind);
        let registered = self.register(&descriptor, || {
            InstrumentStorage::Sync(Arc::new(SyncStorage::new(
                descriptor.clone(),
                aggregation,
                limit,
            )))
        })?;
        match registered {
            InstrumentStorage::Sync(storage) => Some(storage),
            InstrumentStorage::Observable(_) => None,
        }
    }

    fn observable_storage(&self, descriptor: InstrumentDescriptor) -> Option<Arc<ObservableStorage>> {
        let aggregation = Aggregation::default_for(descriptor.kind, None);
        let limit = self.storage_limit(descriptor.kind);
        let registered = self.register(&descriptor, || {
            InstrumentStorage::Observable(Arc::new(ObservableStorage::new(
                descriptor.clone(),
                aggregation,
                limit,
            )))
        })?;
        match registered {
            InstrumentStorage::Observable(storage) => Some(storage),
            InstrumentStorage::Sync(_) => None,
        }
    }

    /// Collect every instrument of this meter for one reader, in
    /// registration order.
    pub fn collect(
        &self,
        reader: &RegisteredReader,
        live: &HandleSet,
        now: DateTime<Utc>,
        resource: &Arc<Resource>,
    ) -> Vec<MetricData> {
        // Callbacks run during collection, so they must not find the list locked.
        let instruments = match self.instruments.lock() {
            Ok(instruments) => instruments.clone(),
            Err(_) => {
                error!("Instrument list of meter '{}' is poisoned", self.scope.name);
                return Vec::new();
            }
        };

        instruments
            .iter()
            .filter_map(|instrument| {
                let storage = instrument.as_storage();
                let descriptor = storage.descriptor();
                let data = storage.collect(&reader.context(descriptor.kind), live, now)?;
                Some(MetricData {
                    resource: Arc::clone(resource),
                    scope: self.scope.clone(),
                    name: descriptor.name.clone(),
                    description: descriptor.description.clone(),
                    unit: descriptor.unit.clone(),
                    data,
                })
            })
            .collect()
    }
}

/// Creates instruments for one instrumentation scope.
///
/// A meter obtained from a provider that is already shut down hands out
/// instruments that record nothing.
#[derive(Clone)]
pub struct Meter {
    state: Option<Arc<MeterState>>,
}

impl Meter {
    pub(crate) fn new(state: Arc<MeterState>) -> Self {
        Self { state: Some(state) }
    }

    pub(crate) fn noop() -> Self {
        Self { state: None }
    }

    pub fn scope(&self) -> Option<&InstrumentationScope> {
        self.state.as_ref().map(|state| state.scope())
    }

    fn builder<I>(&self, name: impl Into<String>) -> InstrumentBuilder<'_, I> {
        InstrumentBuilder {
            meter: self,
            name: name.into(),
            description: String::new(),
            unit: String::new(),
            boundaries: None,
            callbacks: Vec::new(),
            _instrument: PhantomData,
        }
    }

    pub fn counter<T: Number>(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Counter<T>> {
        self.builder(name)
    }

    pub fn up_down_counter<T: Number>(
        &self,
        name: impl Into<String>,
    ) -> InstrumentBuilder<'_, UpDownCounter<T>> {
        self.builder(name)
    }

    pub fn gauge<T: Number>(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Gauge<T>> {
        self.builder(name)
    }

    pub fn histogram<T: Number>(&self, name: impl Into<String>) -> InstrumentBuilder<'_, Histogram<T>> {
        self.builder(name)
    }

    pub fn observable_counter<T: Number>(
        &self,
        name: impl Into<String>,
    ) -> InstrumentBuilder<'_, ObservableCounter<T>> {
        self.builder(name)
    }

    pub fn observable_up_down_counter<T: Number>(
        &self,
        name: impl Into<String>,
    ) -> InstrumentBuilder<'_, ObservableUpDownCounter<T>> {
        self.builder(name)
    }

    pub fn observable_gauge<T: Number>(
        &self,
        name: impl Into<String>,
    ) -> InstrumentBuilder<'_, ObservableGauge<T>> {
        self.builder(name)
    }

    /// The descriptor for a new instrument, or `None` when the instrument
    /// should be a no-op.
    fn descriptor<I>(
        &self,
        builder: &InstrumentBuilder<'_, I>,
        kind: InstrumentKind,
        number_kind: NumberKind,
    ) -> Option<(Arc<MeterState>, InstrumentDescriptor)> {
        let state = self.state.as_ref()?;
        if !is_valid_name(&builder.name) {
            warn!(
                "Invalid instrument name '{}' in meter '{}', measurements will be dropped",
                builder.name, state.scope.name
            );
            return None;
        }
        Some((
            Arc::clone(state),
            InstrumentDescriptor {
                name: builder.name.clone(),
                description: builder.description.clone(),
                unit: builder.unit.clone(),
                kind,
                number_kind,
            },
        ))
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter").field("scope", &self.scope()).finish()
    }
}

/// Configures an instrument before it is created
pub struct InstrumentBuilder<'a, I> {
    meter: &'a Meter,
    name: String,
    description: String,
    unit: String,
    boundaries: Option<Vec<f64>>,
    callbacks: Vec<Callback>,
    _instrument: PhantomData<I>,
}

impl<I> InstrumentBuilder<'_, I> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

impl<T: Number> InstrumentBuilder<'_, Histogram<T>> {
    /// Explicit bucket boundaries; they are sorted and deduplicated
    pub fn with_boundaries(mut self, boundaries: Vec<f64>) -> Self {
        self.boundaries = Some(boundaries);
        self
    }
}

fn record(storage: &Option<Arc<SyncStorage>>, value: impl Number, attributes: &[KeyValue]) {
    let Some(storage) = storage else { return };
    let value = value.into_value();
    let descriptor = storage.descriptor();

    if !value.is_finite() {
        warn!("Dropping non-finite measurement for instrument '{}'", descriptor.name);
        return;
    }
    if descriptor.kind.is_monotonic() && value.is_negative() {
        warn!(
            "Dropping negative measurement {} for monotonic instrument '{}'",
            value, descriptor.name
        );
        return;
    }

    if let Err(e) = storage.record(value, &AttributeSet::new(attributes)) {
        error!("Failed to record measurement for '{}': {}", descriptor.name, e);
    }
}

macro_rules! sync_instrument {
    ($(#[$doc:meta])* $name:ident, $kind:expr, $method:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name<T> {
            storage: Option<Arc<SyncStorage>>,
            _number: PhantomData<T>,
        }

        impl<T: Number> $name<T> {
            pub fn $method(&self, value: T, attributes: &[KeyValue]) {
                record(&self.storage, value, attributes);
            }
        }

        impl<T: Number> InstrumentBuilder<'_, $name<T>> {
            pub fn build(self) -> $name<T> {
                let storage = self
                    .meter
                    .descriptor(&self, $kind, T::KIND)
                    .and_then(|(state, descriptor)| state.sync_storage(descriptor, self.boundaries.clone()));
                $name {
                    storage,
                    _number: PhantomData,
                }
            }
        }
    };
}

sync_instrument!(
    /// A monotonic sum; negative increments are dropped
    Counter,
    InstrumentKind::Counter,
    add
);
sync_instrument!(
    /// A sum that may go up and down
    UpDownCounter,
    InstrumentKind::UpDownCounter,
    add
);
sync_instrument!(
    /// Reports the last recorded value
    Gauge,
    InstrumentKind::Gauge,
    record
);
sync_instrument!(
    /// A distribution of non-negative values in explicit buckets
    Histogram,
    InstrumentKind::Histogram,
    record
);

macro_rules! observable_instrument {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name<T> {
            storage: Option<Arc<ObservableStorage>>,
            _number: PhantomData<T>,
        }

        impl<T: Number> $name<T> {
            /// Register another callback, run once per reader collection
            pub fn add_callback<F>(&self, callback: F)
            where
                F: Fn(&Observer<'_, T>) -> anyhow::Result<()> + Send + Sync + 'static,
            {
                if let Some(storage) = &self.storage {
                    storage.add_callback(erase_callback(callback));
                }
            }
        }

        impl<T: Number> InstrumentBuilder<'_, $name<T>> {
            pub fn with_callback<F>(mut self, callback: F) -> Self
            where
                F: Fn(&Observer<'_, T>) -> anyhow::Result<()> + Send + Sync + 'static,
            {
                self.callbacks.push(erase_callback(callback));
                self
            }

            pub fn build(self) -> $name<T> {
                let storage = self
                    .meter
                    .descriptor(&self, $kind, T::KIND)
                    .and_then(|(state, descriptor)| state.observable_storage(descriptor));
                if let Some(storage) = &storage {
                    for callback in self.callbacks {
                        storage.add_callback(callback);
                    }
                }
                $name {
                    storage,
                    _number: PhantomData,
                }
            }
        }
    };
}

observable_instrument!(
    /// Reports a monotonic running total observed by callbacks
    ObservableCounter,
    InstrumentKind::ObservableCounter
);
observable_instrument!(
    ObservableUpDownCounter,
    InstrumentKind::ObservableUpDownCounter
);
observable_instrument!(
    /// Reports the value observed by callbacks at collection time
    ObservableGauge,
    InstrumentKind::ObservableGauge
);
