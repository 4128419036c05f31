//! Exporter contract and failure classification
pub mod logging;
pub mod memory;
pub mod registry;
pub mod remote;

pub use logging::LoggingExporter;
pub use memory::InMemoryExporter;
pub use registry::{ExporterFactory, ExporterRegistry};
pub use remote::{ExporterState, RemoteExporter, RemoteExporterBuilder, Transport};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::data::MetricData;

/// Stable failure causes, mirroring the gRPC status codes collectors return
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

/// What a failure says about the exporter's next call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// This attempt failed; the next call may well succeed
    Transient,
    /// Failing because of how the collector or credentials are set up
    Permanent,
    /// Neither; fail the call without retrying
    Other,
}

impl StatusCode {
    pub fn class(self) -> FailureClass {
        match self {
            StatusCode::DeadlineExceeded
            | StatusCode::ResourceExhausted
            | StatusCode::Unavailable
            | StatusCode::Cancelled
            | StatusCode::DataLoss
            | StatusCode::OutOfRange
            | StatusCode::Aborted => FailureClass::Transient,
            StatusCode::Unimplemented
            | StatusCode::PermissionDenied
            | StatusCode::Unauthenticated => FailureClass::Permanent,
            _ => FailureClass::Other,
        }
    }

    /// Probable root cause for permanent failures
    pub fn hint(self) -> Option<&'static str> {
        match self {
            StatusCode::Unimplemented => Some(
                "the collector endpoint does not serve metrics; check that a metrics receiver is configured",
            ),
            StatusCode::PermissionDenied => Some(
                "the collector rejected the exporter's credentials for metrics; check the authorization headers",
            ),
            StatusCode::Unauthenticated => Some(
                "the collector requires authentication; check that credentials are configured",
            ),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A failed export, flush or shutdown
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct ExportError {
    pub code: StatusCode,
    pub message: String,
}

impl ExportError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returned without any network attempt once an exporter is shut down
    pub fn shutdown() -> Self {
        Self::new(StatusCode::FailedPrecondition, "exporter is shut down")
    }

    pub fn class(&self) -> FailureClass {
        self.code.class()
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Outcome of an exporter operation
pub type ExportResult = std::result::Result<(), ExportError>;

/// Delivers collected metrics to a sink
#[async_trait]
pub trait MetricExporter: Send + Sync + 'static {
    /// Deliver one batch. Failures are returned, never raised.
    async fn export(&self, batch: &[MetricData]) -> ExportResult;

    /// Complete any buffered work
    async fn force_flush(&self) -> ExportResult {
        Ok(())
    }

    /// Release resources. Repeated calls succeed without repeating work.
    async fn shutdown(&self) -> ExportResult;

    fn name(&self) -> &str;
}
