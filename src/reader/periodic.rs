use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

use super::{
    CardinalityLimitSelector, MetricReader, PeriodicReaderConfig, ReaderPolicy,
    TemporalitySelector,
};
use crate::collection::CollectionRegistration;
use crate::data::Temporality;
use crate::error::{MetricsError, Result};
use crate::export::MetricExporter;
use crate::instrument::InstrumentKind;

enum Message {
    Flush(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
}

struct Inner {
    config: PeriodicReaderConfig,
    exporter: Arc<dyn MetricExporter>,
    policy: ReaderPolicy,
    registration: Mutex<Option<CollectionRegistration>>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    is_shutdown: AtomicBool,
}

/// A reader that collects on a fixed interval and pushes each batch to an
/// exporter from a background tokio task.
///
/// The task starts when the reader is registered with a provider, which must
/// happen inside a tokio runtime. Without a runtime the reader still exports
/// on [`MetricReader::force_flush`] and [`MetricReader::shutdown`].
pub struct PeriodicReader {
    inner: Arc<Inner>,
}

impl PeriodicReader {
    pub fn builder(exporter: Arc<dyn MetricExporter>) -> PeriodicReaderBuilder {
        PeriodicReaderBuilder {
            exporter,
            config: PeriodicReaderConfig::default(),
            policy: ReaderPolicy::default(),
        }
    }

    pub fn config(&self) -> &PeriodicReaderConfig {
        &self.inner.config
    }

    async fn send(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Message) -> Option<Result<()>> {
        let sender = self.inner.sender.lock().ok()?.clone()?;
        let (reply, response) = oneshot::channel();
        if sender.send(make(reply)).await.is_err() {
            return None;
        }
        response.await.ok()
    }
}

impl Inner {
    fn registration(&self) -> Result<Option<CollectionRegistration>> {
        Ok(self
            .registration
            .lock()
            .map_err(|_| MetricsError::poisoned())?
            .clone())
    }

    /// Collect once and hand the batch to the exporter within the timeout
    async fn collect_and_export(&self) -> Result<()> {
        let Some(registration) = self.registration()? else {
            debug!("[{}] Not registered, nothing to export", self.config.name);
            return Ok(());
        };

        let batch = registration.collect_all_metrics();
        if batch.is_empty() {
            debug!("[{}] No metrics to export", self.config.name);
            return Ok(());
        }

        debug!("[{}] Exporting {} metrics", self.config.name, batch.len());
        match time::timeout(self.config.timeout, self.exporter.export(&batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MetricsError::Export(e)),
            Err(_) => Err(MetricsError::Timeout(format!(
                "export to '{}' did not finish within {:?}",
                self.exporter.name(),
                self.config.timeout
            ))),
        }
    }

    async fn flush(&self) -> Result<()> {
        let collected = self.collect_and_export().await;
        let flushed = self.exporter.force_flush().await.map_err(MetricsError::from);
        collected.and(flushed)
    }

    /// Final export, then release the exporter and leave the provider
    async fn finish(&self) -> Result<()> {
        let collected = self.collect_and_export().await;
        if let Err(e) = &collected {
            error!("[{}] Final export failed: {}", self.config.name, e);
        }

        let stopped = match time::timeout(self.config.timeout, self.exporter.shutdown()).await {
            Ok(result) => result.map_err(MetricsError::from),
            Err(_) => Err(MetricsError::Timeout(format!(
                "exporter '{}' did not shut down within {:?}",
                self.exporter.name(),
                self.config.timeout
            ))),
        };

        if let Some(registration) = self.registration()? {
            registration.retire();
        }
        info!("[{}] Shut down", self.config.name);
        collected.and(stopped)
    }
}

/// The background loop. It holds the reader weakly, so dropping the reader
/// closes the channel and ends the task.
async fn run(inner: Weak<Inner>, interval: Duration, mut receiver: mpsc::Receiver<Message>) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.collect_and_export().await {
                    error!("[{}] Periodic export failed: {}", inner.config.name, e);
                }
            }
            message = receiver.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match message {
                    Some(Message::Flush(reply)) => {
                        let _ = reply.send(inner.flush().await);
                    }
                    Some(Message::Shutdown(reply)) => {
                        let _ = reply.send(inner.finish().await);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Periodic reader task exited");
}

#[async_trait]
impl MetricReader for PeriodicReader {
    fn register(&self, registration: CollectionRegistration) {
        match self.inner.registration.lock() {
            Ok(mut slot) if slot.is_none() => {
                debug!(
                    "[{}] Registered as {}",
                    self.inner.config.name,
                    registration.handle()
                );
                *slot = Some(registration);
            }
            Ok(_) => {
                warn!(
                    "[{}] Already registered, ignoring {}",
                    self.inner.config.name,
                    registration.handle()
                );
                return;
            }
            Err(_) => {
                error!("[{}] Registration is poisoned", self.inner.config.name);
                return;
            }
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(
                    "[{}] No tokio runtime, metrics are exported only on flush and shutdown",
                    self.inner.config.name
                );
                return;
            }
        };

        let (sender, receiver) = mpsc::channel(self.inner.config.channel_size);
        match self.inner.sender.lock() {
            Ok(mut slot) => *slot = Some(sender),
            Err(_) => {
                error!("[{}] Command channel is poisoned", self.inner.config.name);
                return;
            }
        }

        info!(
            "[{}] Exporting to '{}' every {:?}",
            self.inner.config.name,
            self.inner.exporter.name(),
            self.inner.config.interval
        );
        runtime.spawn(run(
            Arc::downgrade(&self.inner),
            self.inner.config.interval,
            receiver,
        ));
    }

    fn preferred_temporality(&self) -> Option<Temporality> {
        self.inner.policy.preferred()
    }

    fn temporality(&self, kind: InstrumentKind) -> Temporality {
        self.inner.policy.temporality(&self.supported_temporality(), kind)
    }

    fn cardinality_limit(&self, kind: InstrumentKind) -> usize {
        self.inner.policy.cardinality_limit(kind)
    }

    async fn force_flush(&self) -> Result<()> {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            return Err(MetricsError::AlreadyShutdown(self.inner.config.name.clone()));
        }
        match self.send(Message::Flush).await {
            Some(result) => result,
            None => self.inner.flush().await,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("[{}] Already shut down", self.inner.config.name);
            return Ok(());
        }

        let result = match self.send(Message::Shutdown).await {
            Some(result) => result,
            None => self.inner.finish().await,
        };
        if let Ok(mut slot) = self.inner.sender.lock() {
            slot.take();
        }
        result
    }
}

/// Builder for [`PeriodicReader`]
pub struct PeriodicReaderBuilder {
    exporter: Arc<dyn MetricExporter>,
    config: PeriodicReaderConfig,
    policy: ReaderPolicy,
}

impl PeriodicReaderBuilder {
    pub fn with_config(mut self, config: PeriodicReaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

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

    pub fn build(self) -> PeriodicReader {
        PeriodicReader {
            inner: Arc::new(Inner {
                config: self.config,
                exporter: self.exporter,
                policy: self.policy,
                registration: Mutex::new(None),
                sender: Mutex::new(None),
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::KeyValue;
    use crate::data::MetricData;
    use crate::export::{ExportError, ExportResult, InMemoryExporter, StatusCode};
    use crate::provider::MeterProvider;
    use std::sync::atomic::AtomicUsize;

    fn counter_total(metrics: &[MetricData], name: &str) -> i64 {
        metrics
            .iter()
            .filter(|metric| metric.name == name)
            .flat_map(|metric| metric.data.number_points().iter())
            .map(|point| point.value.as_f64() as i64)
            .sum()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exports_on_interval() {
        let exporter = InMemoryExporter::new();
        let reader = PeriodicReader::builder(Arc::new(exporter.clone()))
            .with_interval(Duration::from_secs(5))
            .with_temporality(Temporality::Delta)
            .build();
        let provider = MeterProvider::builder().with_reader(reader).build().unwrap();

        let counter = provider.meter("test").counter::<i64>("ticks").build();
        counter.add(3, &[KeyValue::new("k", "a")]);

        time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(exporter.batches().len(), 1);
        assert_eq!(counter_total(&exporter.finished_metrics(), "ticks"), 3);

        // Nothing new recorded: a delta reader has nothing to send
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(exporter.batches().len(), 1);

        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_and_shutdown() {
        let exporter = InMemoryExporter::new();
        let reader = PeriodicReader::builder(Arc::new(exporter.clone()))
            .with_interval(Duration::from_secs(3600))
            .build();
        let provider = MeterProvider::builder().with_reader(reader).build().unwrap();

        let counter = provider.meter("test").counter::<i64>("events").build();
        counter.add(2, &[]);
        provider.force_flush().await.unwrap();
        assert_eq!(counter_total(&exporter.finished_metrics(), "events"), 2);

        counter.add(5, &[]);
        provider.shutdown().await.unwrap();
        assert!(exporter.is_shutdown());
        // Cumulative: the final export carries the running total
        assert_eq!(exporter.batches().len(), 2);
        assert_eq!(counter_total(&exporter.batches()[1], "events"), 7);

        provider.shutdown().await.unwrap();
        assert_eq!(exporter.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_flush_after_shutdown_fails() {
        let reader = PeriodicReader::builder(Arc::new(InMemoryExporter::new())).build();
        reader.shutdown().await.unwrap();
        assert!(matches!(
            reader.force_flush().await,
            Err(MetricsError::AlreadyShutdown(_))
        ));
    }

    #[test]
    fn test_register_without_runtime_exports_on_shutdown() {
        let exporter = InMemoryExporter::new();
        let reader = PeriodicReader::builder(Arc::new(exporter.clone())).build();
        let provider = MeterProvider::builder().with_reader(reader).build().unwrap();
        provider.meter("test").counter::<i64>("offline").build().add(4, &[]);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(provider.shutdown()).unwrap();
        assert_eq!(counter_total(&exporter.finished_metrics(), "offline"), 4);
    }

    struct StalledExporter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetricExporter for StalledExporter {
        async fn export(&self, _batch: &[MetricData]) -> ExportResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_secs(3600)).await;
            Err(ExportError::new(StatusCode::Internal, "unreachable"))
        }

        async fn shutdown(&self) -> ExportResult {
            Ok(())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_export_bounded_by_reader_timeout() {
        let exporter = Arc::new(StalledExporter {
            calls: AtomicUsize::new(0),
        });
        let reader = PeriodicReader::builder(exporter.clone())
            .with_interval(Duration::from_secs(3600))
            .with_timeout(Duration::from_millis(200))
            .build();
        let provider = MeterProvider::builder().with_reader(reader).build().unwrap();
        provider.meter("test").counter::<i64>("stuck").build().add(1, &[]);

        let result = provider.force_flush().await;
        assert!(matches!(result, Err(MetricsError::Timeout(_))));
        assert_eq!(exporter.calls.load(Ordering::SeqCst), 1);
    }
}
