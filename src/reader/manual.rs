use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{CardinalityLimitSelector, MetricReader, ReaderPolicy, TemporalitySelector};
use crate::collection::CollectionRegistration;
use crate::data::{MetricData, Temporality};
use crate::error::{MetricsError, Result};
use crate::instrument::InstrumentKind;

/// A reader that collects only when the application asks it to.
///
/// Useful for pull-based exposition and for tests: share it with the
/// provider through an `Arc` and call [`ManualReader::collect`].
pub struct ManualReader {
    policy: ReaderPolicy,
    registration: Mutex<Option<CollectionRegistration>>,
    is_shutdown: AtomicBool,
}

impl ManualReader {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ManualReaderBuilder {
        ManualReaderBuilder::default()
    }

    /// Collect this reader's view of every instrument.
    ///
    /// Returns nothing once the reader is shut down, and an error when the
    /// reader was never registered with a provider.
    pub fn collect(&self) -> Result<Vec<MetricData>> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            debug!("Manual reader is shut down, nothing collected");
            return Ok(Vec::new());
        }

        let registration = self
            .registration
            .lock()
            .map_err(|_| MetricsError::poisoned())?
            .clone();

        match registration {
            Some(registration) => Ok(registration.collect_all_metrics()),
            None => Err(MetricsError::Collection(
                "Manual reader is not registered with a meter provider".to_string(),
            )),
        }
    }
}

impl Default for ManualReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricReader for ManualReader {
    fn register(&self, registration: CollectionRegistration) {
        match self.registration.lock() {
            Ok(mut slot) if slot.is_none() => {
                debug!("Manual reader registered as {}", registration.handle());
                *slot = Some(registration);
            }
            Ok(_) => warn!("Manual reader is already registered, ignoring {}", registration.handle()),
            Err(_) => warn!("Manual reader registration is poisoned"),
        }
    }

    fn preferred_temporality(&self) -> Option<Temporality> {
        self.policy.preferred()
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.policy.temporality(&self.supported_temporality(), kind)
    }

    fn cardinality_limit(&self, kind: InstrumentKind) -> usize {
        self.policy.cardinality_limit(kind)
    }

    async fn force_flush(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("Manual reader already shut down");
            return Ok(());
        }

        let registration = self
            .registration
            .lock()
            .map_err(|_| MetricsError::poisoned())?
            .take();
        if let Some(registration) = registration {
            registration.retire();
        }
        Ok(())
    }
}

/// Builder for [`ManualReader`]
#[derive(Default)]
pub struct ManualReaderBuilder {
    policy: ReaderPolicy,
}

impl ManualReaderBuilder {
    /// Report every instrument with this temporality
    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.policy.set_preferred(temporality);
        self
    }

    pub fn with_temporality_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(InstrumentKind) -> Temporality + Send + Sync + 'static,
    {
        self.policy
            .set_temporality_selector(Arc::new(selector) as TemporalitySelector);
        self
    }

    /// Same limit for every instrument kind
    pub fn with_cardinality_limit(self, limit: usize) -> Self {
        self.with_cardinality_selector(move |_| limit)
    }

    pub fn with_cardinality_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(InstrumentKind) -> usize + Send + Sync + 'static,
    {
        self.policy
            .set_cardinality_selector(Arc::new(selector) as CardinalityLimitSelector);
        self
    }

    pub fn build(self) -> ManualReader {
        ManualReader {
            policy: self.policy,
            registration: Mutex::new(None),
            is_shutdown: AtomicBool::new(false),
        }
    }
}
