//! Readers pull aggregated metrics from a provider on their own schedule
mod config;
mod manual;
mod periodic;

pub use self::config::{PeriodicReaderConfig, PeriodicReaderConfigBuilder};
pub use manual::{ManualReader, ManualReaderBuilder};
pub use periodic::{PeriodicReader, PeriodicReaderBuilder};

use async_trait::async_trait;
use std::sync::Arc;

use crate::collection::CollectionRegistration;
use crate::data::Temporality;
use crate::error::Result;
use crate::instrument::InstrumentKind;
use crate::storage::DEFAULT_CARDINALITY_LIMIT;

/// Picks a temporality for each instrument kind
pub type TemporalitySelector = Arc<dyn Fn(InstrumentKind) -> Temporality + Send + Sync>;

/// Picks a cardinality limit for each instrument kind
pub type CardinalityLimitSelector = Arc<dyn Fn(InstrumentKind) -> usize + Send + Sync>;

/// A consumer of metrics registered with exactly one provider.
///
/// The provider asks for temporality and cardinality limit once per
/// instrument kind at build time and caches the answers.
#[async_trait]
pub trait MetricReader: Send + Sync {
    /// Called once when the provider is built
    fn register(&self, registration: CollectionRegistration);

    fn supported_temporality(&self) -> Vec<Temporality> {
        vec![Temporality::Cumulative, Temporality::Delta]
    }

    fn preferred_temporality(&self) -> Option<Temporality> {
        None
    }

    /// The preferred temporality when it is supported, cumulative otherwise
    fn temporality(&self, _kind: InstrumentKind) -> Temporality {
        resolve_temporality(&self.supported_temporality(), self.preferred_temporality())
    }

    fn cardinality_limit(&self, _kind: InstrumentKind) -> usize {
        DEFAULT_CARDINALITY_LIMIT
    }

    /// Collect and hand everything recorded so far to the reader's consumer
    async fn force_flush(&self) -> Result<()>;

    /// Flush one last time and stop. Later calls succeed without doing work.
    async fn shutdown(&self) -> Result<()>;
}

pub(crate) fn resolve_temporality(
    supported: &[Temporality],
    preferred: Option<Temporality>,
) -> Temporality {
    match preferred {
        Some(temporality) if supported.contains(&temporality) => temporality,
        _ => Temporality::Cumulative,
    }
}

/// Delta for counters and histograms, cumulative for up-down counters,
/// which are only meaningful as running totals.
pub fn delta_preferred(kind: InstrumentKind) -> Temporality {
    match kind {
        InstrumentKind::UpDownCounter | InstrumentKind::ObservableUpDownCounter => {
            Temporality::Cumulative
        }
        _ => Temporality::Delta,
    }
}

/// The temporality and cardinality choices a reader was built with
#[derive(Clone, Default)]
pub(crate) struct ReaderPolicy {
    preferred: Option<Temporality>,
    temporality: Option<TemporalitySelector>,
    cardinality: Option<CardinalityLimitSelector>,
}

impl ReaderPolicy {
    pub fn set_preferred(&mut self, temporality: Temporality) {
        self.preferred = Some(temporality);
        self.temporality = None;
    }

    pub fn set_temporality_selector(&mut self, selector: TemporalitySelector) {
        self.temporality = Some(selector);
    }

    pub fn set_cardinality_selector(&mut self, selector: CardinalityLimitSelector) {
        self.cardinality = Some(selector);
    }

    pub fn preferred(&self) -> Option<Temporality> {
        self.preferred
    }

    pub fn temporality(&self, supported: &[Temporality], kind: InstrumentKind) -> Temporality {
        match &self.temporality {
            Some(selector) => resolve_temporality(supported, Some(selector(kind))),
            None => resolve_temporality(supported, self.preferred),
        }
    }

    pub fn cardinality_limit(&self, kind: InstrumentKind) -> usize {
        self.cardinality
            .as_ref()
            .map_or(DEFAULT_CARDINALITY_LIMIT, |selector| selector(kind))
    }
}
