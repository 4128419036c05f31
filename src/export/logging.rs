use async_trait::async_trait;
use log::{info, log_enabled, Level};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{ExportError, ExportResult, MetricExporter, StatusCode};
use crate::data::MetricData;

/// Exporter that writes each metric as a JSON line to the log at `info`
pub struct LoggingExporter {
    name: String,
    is_shutdown: AtomicBool,
}

impl LoggingExporter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Render one metric the way it is logged
    pub fn render(metric: &MetricData) -> Result<String, ExportError> {
        serde_json::to_string(metric).map_err(|e| {
            ExportError::new(
                StatusCode::InvalidArgument,
                format!("failed to serialize metric '{}': {}", metric.name, e),
            )
        })
    }
}

impl Default for LoggingExporter {
    fn default() -> Self {
        Self::new("logging")
    }
}

#[async_trait]
impl MetricExporter for LoggingExporter {
    async fn export(&self, batch: &[MetricData]) -> ExportResult {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(ExportError::shutdown());
        }
        if !log_enabled!(Level::Info) {
            return Ok(());
        }
        for metric in batch {
            info!("[{}] {}", self.name, Self::render(metric)?);
        }
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult {
        self.is_shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
