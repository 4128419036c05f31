use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::{ExportError, ExportResult, FailureClass, MetricExporter, StatusCode};
use crate::config::ExporterConfig;
use crate::data::MetricData;
use crate::retry::{execute_with_retry, RetryConfig};

/// Opaque wire to a collector. Encoding and framing live behind this trait.
///
/// Dropping a `send` future must release whatever it holds; the exporter
/// drops it when the call's deadline passes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, batch: &[MetricData]) -> ExportResult;

    async fn shutdown(&self) -> ExportResult {
        Ok(())
    }
}

/// Lifecycle of a [`RemoteExporter`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExporterState {
    Created = 0,
    Active = 1,
    ShuttingDown = 2,
    Shutdown = 3,
}

impl ExporterState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExporterState::Created,
            1 => ExporterState::Active,
            2 => ExporterState::ShuttingDown,
            _ => ExporterState::Shutdown,
        }
    }
}

/// Decrements the in-flight count when an export finishes, however it ends
struct InFlight<'a> {
    count: &'a AtomicUsize,
    idle: &'a Notify,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Exporter that pushes batches through a [`Transport`].
///
/// Each export carries its own deadline covering every attempt. Transient
/// failures fail that call only; permanent ones also log the probable cause.
/// Once shutdown starts, exports and flushes fail without touching the
/// transport.
pub struct RemoteExporter<T: Transport> {
    transport: T,
    name: String,
    timeout: Duration,
    retry: RetryConfig,
    state: AtomicU8,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl<T: Transport> RemoteExporter<T> {
    pub fn builder(transport: T) -> RemoteExporterBuilder<T> {
        RemoteExporterBuilder::new(transport)
    }

    pub fn state(&self) -> ExporterState {
        ExporterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn activate(&self) {
        let _ = self.state.compare_exchange(
            ExporterState::Created as u8,
            ExporterState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn accepting(&self) -> bool {
        matches!(self.state(), ExporterState::Created | ExporterState::Active)
    }

    /// Register an in-flight export, or refuse if shutdown has begun. The
    /// count goes up before the state check so shutdown always waits for
    /// exports it did not refuse.
    fn begin(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight {
            count: &self.in_flight,
            idle: &self.idle,
        };
        if !self.accepting() {
            return None;
        }
        self.activate();
        Some(guard)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn report(&self, err: &ExportError) {
        match err.class() {
            FailureClass::Transient => warn!(
                "Metrics export via '{}' failed, the exporter stays usable: {}",
                self.name, err
            ),
            FailureClass::Permanent => error!(
                "Metrics export via '{}' failed: {}. Probable cause: {}",
                self.name,
                err,
                err.code.hint().unwrap_or("collector configuration")
            ),
            FailureClass::Other => error!("Metrics export via '{}' failed: {}", self.name, err),
        }
    }
}

#[async_trait]
impl<T: Transport> MetricExporter for RemoteExporter<T> {
    async fn export(&self, batch: &[MetricData]) -> ExportResult {
        let Some(_in_flight) = self.begin() else {
            debug!("Exporter '{}' is shut down, dropping batch of {}", self.name, batch.len());
            return Err(ExportError::shutdown());
        };

        let context = format!("Export via '{}'", self.name);
        let attempts = execute_with_retry(|| self.transport.send(batch), &self.retry, &context);

        let result = match timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::new(
                StatusCode::DeadlineExceeded,
                format!("export did not complete within {:?}", self.timeout),
            )),
        };

        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn force_flush(&self) -> ExportResult {
        if !self.accepting() {
            return Err(ExportError::shutdown());
        }
        self.activate();

        timeout(self.timeout, self.wait_idle()).await.map_err(|_| {
            ExportError::new(
                StatusCode::DeadlineExceeded,
                format!("in-flight exports did not finish within {:?}", self.timeout),
            )
        })
    }

    async fn shutdown(&self) -> ExportResult {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current >= ExporterState::ShuttingDown as u8 {
                debug!("Exporter '{}' is already shut down", self.name);
                return Ok(());
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ExporterState::ShuttingDown as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }

        info!("Shutting down exporter '{}'", self.name);
        if timeout(self.timeout, self.wait_idle()).await.is_err() {
            warn!(
                "Exports via '{}' still in flight after {:?}, shutting down anyway",
                self.name, self.timeout
            );
        }

        let result = match timeout(self.timeout, self.transport.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::new(
                StatusCode::DeadlineExceeded,
                format!("transport shutdown did not complete within {:?}", self.timeout),
            )),
        };

        self.state
            .store(ExporterState::Shutdown as u8, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`RemoteExporter`]
pub struct RemoteExporterBuilder<T: Transport> {
    transport: T,
    name: String,
    timeout: Duration,
    retry: RetryConfig,
}

impl<T: Transport> RemoteExporterBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            name: "remote".to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryConfig::no_retry(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Deadline applied to each export, flush and shutdown separately
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Take the deadline and attempt count from a configured exporter
    pub fn with_config(self, config: &ExporterConfig) -> Self {
        self.with_timeout(config.timeout())
            .with_retry(config.retry_config())
    }

    pub fn build(self) -> RemoteExporter<T> {
        RemoteExporter {
            transport: self.transport,
            name: self.name,
            timeout: self.timeout,
            retry: self.retry,
            state: AtomicU8::new(ExporterState::Created as u8),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Sets a flag when the in-flight send future is dropped
    struct Released(Arc<AtomicBool>);

    impl Drop for Released {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        responses: Mutex<VecDeque<ExportResult>>,
        attempts: AtomicUsize,
        shutdowns: AtomicUsize,
        delay: Option<Duration>,
        started: Notify,
        released: Arc<AtomicBool>,
    }

    impl MockTransport {
        fn with_responses(responses: Vec<ExportResult>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Default::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, _batch: &[MetricData]) -> ExportResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            let _released = Released(Arc::clone(&self.released));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn shutdown(&self) -> ExportResult {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn unavailable() -> ExportResult {
        Err(ExportError::new(StatusCode::Unavailable, "collector unavailable"))
    }

    #[tokio::test]
    async fn test_transient_failure_does_not_poison_exporter() {
        let exporter = RemoteExporter::builder(MockTransport::with_responses(vec![unavailable()])).build();

        let first = exporter.export(&[]).await;
        assert_eq!(first.unwrap_err().code, StatusCode::Unavailable);

        assert!(exporter.export(&[]).await.is_ok());
        assert_eq!(exporter.transport().attempts(), 2);
        assert_eq!(exporter.state(), ExporterState::Active);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let transport = MockTransport::with_responses(vec![Err(ExportError::new(
            StatusCode::Unimplemented,
            "unknown service",
        ))]);
        let exporter = RemoteExporter::builder(transport)
            .with_retry(
                RetryConfig::default()
                    .with_max_attempts(5)
                    .with_initial_delay(Duration::from_millis(1)),
            )
            .build();

        let err = exporter.export(&[]).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unimplemented);
        assert_eq!(exporter.transport().attempts(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_call() {
        let exporter = RemoteExporter::builder(MockTransport::with_responses(vec![
            unavailable(),
            unavailable(),
        ]))
        .with_retry(
            RetryConfig::default()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
        .build();

        assert!(exporter.export(&[]).await.is_ok());
        assert_eq!(exporter.transport().attempts(), 3);
    }

    #[tokio::test]
    async fn test_configured_attempts_and_deadline() {
        let config = ExporterConfig {
            kind: "remote".to_string(),
            timeout_ms: 5_000,
            max_attempts: 2,
            ..Default::default()
        };
        let exporter = RemoteExporter::builder(MockTransport::with_responses(vec![
            unavailable(),
            unavailable(),
        ]))
        .with_config(&config)
        .build();

        assert_eq!(exporter.timeout, Duration::from_secs(5));
        assert_eq!(exporter.export(&[]).await.unwrap_err().code, StatusCode::Unavailable);
        assert_eq!(exporter.transport().attempts(), 2);
    }

    #[tokio::test]
    async fn test_deadline_drops_attempt_and_does_not_leak() {
        let exporter = RemoteExporter::builder(MockTransport::with_delay(Duration::from_secs(30)))
            .with_timeout(Duration::from_millis(50))
            .build();

        let err = exporter.export(&[]).await.unwrap_err();
        assert_eq!(err.code, StatusCode::DeadlineExceeded);
        assert!(exporter.transport().released.load(Ordering::SeqCst));

        // The next call gets a fresh deadline and still reaches the transport.
        let _ = exporter.export(&[]).await;
        assert_eq!(exporter.transport().attempts(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let exporter = RemoteExporter::builder(MockTransport::default()).build();

        assert!(exporter.shutdown().await.is_ok());
        assert!(exporter.shutdown().await.is_ok());

        assert_eq!(exporter.transport().shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(exporter.state(), ExporterState::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_during_in_flight_export() {
        let exporter = Arc::new(
            RemoteExporter::builder(MockTransport::with_delay(Duration::from_millis(100))).build(),
        );

        let started = exporter.transport().started.notified();
        let in_flight = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move { exporter.export(&[]).await })
        };
        started.await;

        assert!(exporter.shutdown().await.is_ok());
        assert!(in_flight.await.unwrap().is_ok());

        let err = exporter.export(&[]).await.unwrap_err();
        assert_eq!(err, ExportError::shutdown());
        assert!(exporter.force_flush().await.is_err());
        assert_eq!(exporter.transport().attempts(), 1);
    }

    #[tokio::test]
    async fn test_flush_waits_for_in_flight_exports() {
        let exporter = Arc::new(
            RemoteExporter::builder(MockTransport::with_delay(Duration::from_millis(50))).build(),
        );

        let started = exporter.transport().started.notified();
        let in_flight = {
            let exporter = Arc::clone(&exporter);
            tokio::spawn(async move { exporter.export(&[]).await })
        };
        started.await;

        assert!(exporter.force_flush().await.is_ok());
        assert!(in_flight.is_finished() || in_flight.await.is_ok());
    }
}
