use std::fmt;
use std::sync::{Arc, Weak};

use super::CollectionHandle;
use crate::data::{MetricData, Temporality};
use crate::instrument::InstrumentKind;
use crate::provider::ProviderShared;
use crate::reader::MetricReader;
use crate::resource::Resource;
use crate::storage::ReaderContext;

/// A reader bound to its handle at provider build time.
///
/// Temporality and cardinality limits are asked of the reader once per
/// instrument kind and cached; they never change afterwards. Equality is by
/// handle, so two identically configured readers remain distinct.
pub struct RegisteredReader {
    reader: Arc<dyn MetricReader>,
    handle: CollectionHandle,
    temporality: [Temporality; 7],
    cardinality_limits: [usize; 7],
}

impl RegisteredReader {
    pub(crate) fn new(reader: Arc<dyn MetricReader>, handle: CollectionHandle) -> Self {
        let temporality = InstrumentKind::ALL.map(|kind| reader.temporality(kind));
        let cardinality_limits = InstrumentKind::ALL.map(|kind| reader.cardinality_limit(kind));
        Self {
            reader,
            handle,
            temporality,
            cardinality_limits,
        }
    }

    pub fn handle(&self) -> CollectionHandle {
        self.handle
    }

    pub fn reader(&self) -> &Arc<dyn MetricReader> {
        &self.reader
    }

    pub fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.temporality[kind.index()]
    }

    pub fn cardinality_limit(&self, kind: InstrumentKind) -> usize {
        self.cardinality_limits[kind.index()]
    }

    pub(crate) fn context(&self, kind: InstrumentKind) -> ReaderContext {
        ReaderContext {
            handle: self.handle,
            temporality: self.temporality(kind),
            cardinality_limit: self.cardinality_limit(kind),
        }
    }
}

impl PartialEq for RegisteredReader {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for RegisteredReader {}

impl fmt::Debug for RegisteredReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredReader")
            .field("handle", &self.handle)
            .field("temporality", &self.temporality)
            .field("cardinality_limits", &self.cardinality_limits)
            .finish()
    }
}

/// What a reader is given at registration to pull metrics from its provider
#[derive(Clone)]
pub struct CollectionRegistration {
    handle: CollectionHandle,
    provider: Weak<ProviderShared>,
}

impl CollectionRegistration {
    pub(crate) fn new(handle: CollectionHandle, provider: Weak<ProviderShared>) -> Self {
        Self { handle, provider }
    }

    pub fn handle(&self) -> CollectionHandle {
        self.handle
    }

    /// Collect every instrument's view for this reader. Empty once the
    /// provider is shut down or dropped, or this registration is retired.
    pub fn collect_all_metrics(&self) -> Vec<MetricData> {
        match self.provider.upgrade() {
            Some(provider) => provider.collect_all_metrics(self.handle),
            None => Vec::new(),
        }
    }

    /// The provider's resource
    pub fn resource(&self) -> Arc<Resource> {
        self.provider
            .upgrade()
            .map(|provider| provider.resource())
            .unwrap_or_else(|| Arc::new(Resource::empty()))
    }

    /// Stop taking part in collection. Interval accumulations no longer wait
    /// for this reader and later collections return nothing.
    pub fn retire(&self) {
        if let Some(provider) = self.provider.upgrade() {
            provider.retire(self.handle);
        }
    }
}

impl fmt::Debug for CollectionRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRegistration")
            .field("handle", &self.handle)
            .finish()
    }
}
