//! Metrics collection and export pipeline for telemetry SDKs.
//!
//! Instruments record measurements from any thread into attribute-keyed
//! storage. Each reader registered with a [`provider::MeterProvider`] pulls
//! its own view of that storage, with its own temporality and cardinality
//! limit, and hands it to an exporter.

pub mod aggregation;
pub mod attributes;
pub mod collection;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod instrument;
pub mod meter;
pub mod provider;
pub mod reader;
pub mod resource;
pub mod retry;
pub mod storage;
pub mod util;

/// Re-export of commonly used types for convenience
pub mod prelude {
    pub use crate::attributes::{AttributeSet, KeyValue, Value};
    pub use crate::config::{ConfigBuilder, SdkConfig};
    pub use crate::data::{MetricData, MetricPoints, Temporality};
    pub use crate::error::{MetricsError, Result};
    pub use crate::export::{
        ExportError, ExporterRegistry, InMemoryExporter, LoggingExporter, MetricExporter,
        RemoteExporter, StatusCode, Transport,
    };
    pub use crate::instrument::{InstrumentKind, InstrumentationScope};
    pub use crate::meter::{
        Counter, Gauge, Histogram, Meter, ObservableCounter, ObservableGauge,
        ObservableUpDownCounter, UpDownCounter,
    };
    pub use crate::provider::{MeterProvider, MeterProviderBuilder};
    pub use crate::reader::{ManualReader, MetricReader, PeriodicReader};
    pub use crate::resource::Resource;
    pub use crate::retry::{execute_with_retry, RetryConfig};
    pub use crate::storage::Observer;
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
