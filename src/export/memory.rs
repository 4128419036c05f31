use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{ExportError, ExportResult, MetricExporter, StatusCode};
use crate::data::MetricData;

struct Inner {
    batches: Mutex<Vec<Vec<MetricData>>>,
    is_shutdown: AtomicBool,
}

/// Exporter that keeps every batch in memory.
///
/// Clones share the same buffer, so a caller can hand one clone to a reader
/// and inspect what was exported through another.
#[derive(Clone)]
pub struct InMemoryExporter {
    inner: Arc<Inner>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                batches: Mutex::new(Vec::new()),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Every exported batch, oldest first
    pub fn batches(&self) -> Vec<Vec<MetricData>> {
        self.inner
            .batches
            .lock()
            .map(|batches| batches.clone())
            .unwrap_or_default()
    }

    /// Every exported metric, flattened across batches
    pub fn finished_metrics(&self) -> Vec<MetricData> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn reset(&self) {
        if let Ok(mut batches) = self.inner.batches.lock() {
            batches.clear();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricExporter for InMemoryExporter {
    async fn export(&self, batch: &[MetricData]) -> ExportResult {
        if self.is_shutdown() {
            return Err(ExportError::shutdown());
        }
        self.inner
            .batches
            .lock()
            .map_err(|_| ExportError::new(StatusCode::Internal, "Lock poisoned"))?
            .push(batch.to_vec());
        Ok(())
    }

    async fn shutdown(&self) -> ExportResult {
        self.inner.is_shutdown.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_buffer() {
        let exporter = InMemoryExporter::new();
        let observer = exporter.clone();

        exporter.export(&[]).await.unwrap();
        assert_eq!(observer.batches().len(), 1);

        observer.reset();
        assert!(exporter.batches().is_empty());
    }

    #[tokio::test]
    async fn test_export_after_shutdown_fails() {
        let exporter = InMemoryExporter::new();
        exporter.shutdown().await.unwrap();
        exporter.shutdown().await.unwrap();

        assert_eq!(exporter.export(&[]).await, Err(ExportError::shutdown()));
        assert!(exporter.batches().is_empty());
    }
}
