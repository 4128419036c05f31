//! The meter provider owns every meter, reader and accumulator
use chrono::Utc;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::attributes::KeyValue;
use crate::collection::{
    CollectionHandle, CollectionRegistration, HandleAllocator, HandleSet, RegisteredReader,
};
use crate::config::SdkConfig;
use crate::data::MetricData;
use crate::error::{MetricsError, Result};
use crate::export::ExporterRegistry;
use crate::instrument::InstrumentationScope;
use crate::meter::{Meter, MeterState};
use crate::reader::{MetricReader, PeriodicReader, PeriodicReaderConfig};
use crate::resource::Resource;

/// State shared between a provider and the registrations of its readers
pub(crate) struct ProviderShared {
    resource: Arc<Resource>,
    readers: Arc<[RegisteredReader]>,
    live: RwLock<HandleSet>,
    meters: Mutex<Vec<Arc<MeterState>>>,
    is_shutdown: AtomicBool,
}

impl ProviderShared {
    /// One reader's view of every instrument, ordered by meter creation and
    /// then instrument creation
    pub fn collect_all_metrics(&self, handle: CollectionHandle) -> Vec<MetricData> {
        let live = match self.live.read() {
            Ok(live) => live.clone(),
            Err(_) => {
                error!("Live reader set is poisoned, nothing collected for {}", handle);
                return Vec::new();
            }
        };
        if !live.contains(handle) {
            debug!("{} is retired, nothing collected", handle);
            return Vec::new();
        }

        let Some(reader) = self.readers.iter().find(|reader| reader.handle() == handle) else {
            warn!("{} is not registered with this provider", handle);
            return Vec::new();
        };

        let meters = match self.meters.lock() {
            Ok(meters) => meters.clone(),
            Err(_) => {
                error!("Meter list is poisoned, nothing collected for {}", handle);
                return Vec::new();
            }
        };

        let now = Utc::now();
        meters
            .iter()
            .flat_map(|meter| meter.collect(reader, &live, now, &self.resource))
            .collect()
    }

    pub fn resource(&self) -> Arc<Resource> {
        Arc::clone(&self.resource)
    }

    /// Stop waiting for `handle` before dropping interval accumulations
    pub fn retire(&self, handle: CollectionHandle) {
        match self.live.write() {
            Ok(mut live) => {
                if live.remove(handle) {
                    debug!("Retired {}, {} readers remain", handle, live.len());
                }
            }
            Err(_) => error!("Live reader set is poisoned, {} not retired", handle),
        }
    }

    fn meter(&self, scope: InstrumentationScope) -> Result<Arc<MeterState>> {
        let mut meters = self.meters.lock().map_err(|_| MetricsError::poisoned())?;
        if let Some(existing) = meters.iter().find(|meter| meter.scope() == &scope) {
            return Ok(Arc::clone(existing));
        }

        debug!("Creating meter '{}'", scope.name);
        let state = Arc::new(MeterState::new(scope, Arc::clone(&self.readers)));
        meters.push(Arc::clone(&state));
        Ok(state)
    }
}

/// Entry point of the SDK: hands out meters and drives readers.
///
/// Clones share the same state. Shut the provider down to flush and release
/// its readers; dropping it stops periodic readers without a final export.
#[derive(Clone)]
pub struct MeterProvider {
    shared: Arc<ProviderShared>,
}

impl MeterProvider {
    pub fn builder() -> MeterProviderBuilder {
        MeterProviderBuilder::default()
    }

    /// A meter for the named scope; the same scope always yields the same
    /// instruments
    pub fn meter(&self, name: impl Into<String>) -> Meter {
        self.meter_with_scope(InstrumentationScope::new(name))
    }

    pub fn meter_with_scope(&self, scope: InstrumentationScope) -> Meter {
        if self.shared.is_shutdown.load(Ordering::SeqCst) {
            warn!("Meter provider is shut down, meter '{}' will record nothing", scope.name);
            return Meter::noop();
        }
        match self.shared.meter(scope) {
            Ok(state) => Meter::new(state),
            Err(e) => {
                error!("Failed to create meter: {}", e);
                Meter::noop()
            }
        }
    }

    pub fn resource(&self) -> Arc<Resource> {
        self.shared.resource()
    }

    pub fn readers(&self) -> &[RegisteredReader] {
        &self.shared.readers
    }

    /// Flush every reader. All readers are flushed even when one fails; the
    /// first failure is returned.
    pub async fn force_flush(&self) -> Result<()> {
        if self.shared.is_shutdown.load(Ordering::SeqCst) {
            return Err(MetricsError::AlreadyShutdown("meter provider".to_string()));
        }

        let mut first_error = None;
        for registered in self.shared.readers.iter() {
            if let Err(e) = registered.reader().force_flush().await {
                error!("Flushing reader {} failed: {}", registered.handle(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Shut every reader down, each flushing one last time. Calling this
    /// again returns `Ok(())` without doing anything.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shared.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("Meter provider already shut down");
            return Ok(());
        }

        info!("Shutting down meter provider with {} readers", self.shared.readers.len());
        let mut first_error = None;
        for registered in self.shared.readers.iter() {
            if let Err(e) = registered.reader().shutdown().await {
                error!("Shutting down reader {} failed: {}", registered.handle(), e);
                first_error.get_or_insert(e);
            }
            self.shared.retire(registered.handle());
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MeterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterProvider")
            .field("resource", &self.shared.resource)
            .field("readers", &self.shared.readers)
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Builder for [`MeterProvider`]
#[derive(Default)]
pub struct MeterProviderBuilder {
    resource: Option<Resource>,
    readers: Vec<Arc<dyn MetricReader>>,
}

impl MeterProviderBuilder {
    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn with_reader<R: MetricReader + 'static>(mut self, reader: R) -> Self {
        self.readers.push(Arc::new(reader));
        self
    }

    /// Register a reader the caller keeps a handle to, such as a
    /// [`crate::reader::ManualReader`] it collects from directly
    pub fn with_shared_reader(mut self, reader: Arc<dyn MetricReader>) -> Self {
        self.readers.push(reader);
        self
    }

    /// A builder with the configured resource and one periodic reader per
    /// configured reader, each exporting through the registry's exporter.
    pub fn from_config(config: &SdkConfig, registry: &ExporterRegistry) -> Result<Self> {
        config.validate()?;
        let mut resource = Resource::builder().with_attributes(
            config
                .resource_attributes
                .iter()
                .map(|(key, value)| KeyValue::new(key.clone(), value.clone())),
        );
        if let Some(name) = &config.service_name {
            resource = resource.with_service_name(name.clone());
        }

        let mut builder = Self::default().with_resource(resource.build());
        for reader_config in &config.readers {
            let exporter = registry.resolve(&reader_config.exporter)?;
            let reader = PeriodicReader::builder(exporter)
                .with_config(PeriodicReaderConfig::from(reader_config))
                .with_temporality(reader_config.temporality)
                .with_cardinality_limit(reader_config.cardinality_limit)
                .build();
            builder = builder.with_reader(reader);
        }
        Ok(builder)
    }

    /// Bind each reader to a fresh handle and register it.
    ///
    /// Registering the same reader instance twice is a configuration error.
    pub fn build(self) -> Result<MeterProvider> {
        for (i, reader) in self.readers.iter().enumerate() {
            if self.readers[..i]
                .iter()
                .any(|earlier| std::ptr::addr_eq(Arc::as_ptr(earlier), Arc::as_ptr(reader)))
            {
                return Err(MetricsError::Config(format!(
                    "Reader at position {} is already registered with this provider",
                    i
                )));
            }
        }

        let allocator = HandleAllocator::new();
        let readers: Arc<[RegisteredReader]> = self
            .readers
            .into_iter()
            .map(|reader| RegisteredReader::new(reader, allocator.allocate()))
            .collect();
        let live: HandleSet = readers.iter().map(RegisteredReader::handle).collect();

        let shared = Arc::new(ProviderShared {
            resource: Arc::new(self.resource.unwrap_or_default()),
            readers: Arc::clone(&readers),
            live: RwLock::new(live),
            meters: Mutex::new(Vec::new()),
            is_shutdown: AtomicBool::new(false),
        });

        for registered in readers.iter() {
            registered.reader().register(CollectionRegistration::new(
                registered.handle(),
                Arc::downgrade(&shared),
            ));
        }
        info!("Meter provider built with {} readers", readers.len());

        Ok(MeterProvider { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeSet;
    use crate::config::{ExporterConfig, ReaderConfig};
    use crate::data::Temporality;
    use crate::export::{InMemoryExporter, MetricExporter};
    use crate::instrument::{InstrumentKind, NumberValue};
    use crate::reader::ManualReader;
    use std::thread;

    fn attrs(value: &str) -> AttributeSet {
        AttributeSet::new(&[KeyValue::new("k", value)])
    }

    fn value(metrics: &[MetricData], name: &str, attributes: &AttributeSet) -> Option<NumberValue> {
        metrics
            .iter()
            .find(|metric| metric.name == name)
            .and_then(|metric| metric.number_point(attributes))
            .map(|point| point.value)
    }

    fn two_readers() -> (MeterProvider, Arc<ManualReader>, Arc<ManualReader>) {
        let cumulative = Arc::new(ManualReader::new());
        let delta = Arc::new(ManualReader::builder().with_temporality(Temporality::Delta).build());
        let provider = MeterProvider::builder()
            .with_shared_reader(cumulative.clone())
            .with_shared_reader(delta.clone())
            .build()
            .unwrap();
        (provider, cumulative, delta)
    }

    #[test]
    fn test_cumulative_and_delta_readers_share_one_counter() {
        let (provider, cumulative, delta) = two_readers();
        let counter = provider.meter("shop").counter::<i64>("orders").build();

        counter.add(5, &[KeyValue::new("k", "a")]);
        counter.add(3, &[KeyValue::new("k", "a")]);

        let seen = delta.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(8)));
        let seen = cumulative.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(8)));

        counter.add(2, &[KeyValue::new("k", "a")]);

        let seen = delta.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(2)));
        let seen = cumulative.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(10)));
    }

    #[test]
    fn test_readers_collect_independently() {
        let (provider, cumulative, delta) = two_readers();
        let counter = provider.meter("shop").counter::<i64>("orders").build();

        counter.add(1, &[KeyValue::new("k", "a")]);
        // The delta reader collects many times before the cumulative reader
        // looks at all.
        for _ in 0..3 {
            delta.collect().unwrap();
            counter.add(1, &[KeyValue::new("k", "a")]);
        }

        let seen = cumulative.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(4)));
        let seen = delta.collect().unwrap();
        assert_eq!(value(&seen, "orders", &attrs("a")), Some(NumberValue::I64(1)));
        assert!(delta.collect().unwrap().is_empty());
    }

    #[test]
    fn test_delta_conservation_under_concurrent_writes() {
        let (provider, cumulative, delta) = two_readers();
        let counter = provider.meter("load").counter::<i64>("hits").build();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add(1, &[KeyValue::new("k", "a")]);
                    }
                })
            })
            .collect();

        let mut delta_total = 0;
        for _ in 0..20 {
            if let Some(NumberValue::I64(v)) = value(&delta.collect().unwrap(), "hits", &attrs("a")) {
                delta_total += v;
            }
        }
        for writer in writers {
            writer.join().unwrap();
        }
        if let Some(NumberValue::I64(v)) = value(&delta.collect().unwrap(), "hits", &attrs("a")) {
            delta_total += v;
        }

        assert_eq!(delta_total, 4000);
        let seen = cumulative.collect().unwrap();
        assert_eq!(value(&seen, "hits", &attrs("a")), Some(NumberValue::I64(4000)));
    }

    #[test]
    fn test_per_reader_cardinality_limits() {
        let narrow = Arc::new(ManualReader::builder().with_cardinality_limit(2).build());
        let wide = Arc::new(ManualReader::builder().with_cardinality_limit(10).build());
        let provider = MeterProvider::builder()
            .with_shared_reader(narrow.clone())
            .with_shared_reader(wide.clone())
            .build()
            .unwrap();

        let counter = provider.meter("test").counter::<i64>("requests").build();
        for v in ["a", "b", "c", "d"] {
            counter.add(1, &[KeyValue::new("k", v)]);
        }

        let seen = narrow.collect().unwrap();
        assert_eq!(seen[0].data.len(), 3);
        assert_eq!(value(&seen, "requests", &attrs("a")), Some(NumberValue::I64(1)));
        assert_eq!(
            value(&seen, "requests", &AttributeSet::overflow()),
            Some(NumberValue::I64(2))
        );

        let seen = wide.collect().unwrap();
        assert_eq!(seen[0].data.len(), 4);
        assert_eq!(value(&seen, "requests", &AttributeSet::overflow()), None);
    }

    #[test]
    fn test_failing_callback_does_not_block_other_instruments() {
        let (provider, cumulative, _delta) = two_readers();
        let meter = provider.meter("runtime");

        meter
            .observable_gauge::<i64>("broken")
            .with_callback(|_observer| Err(anyhow::anyhow!("sensor unavailable")))
            .build();
        meter
            .observable_gauge::<i64>("panicking")
            .with_callback(|_observer| panic!("sensor driver crashed"))
            .build();
        meter
            .observable_gauge::<i64>("threads")
            .with_callback(|observer| {
                observer.observe(12, &[KeyValue::new("k", "a")]);
                Ok(())
            })
            .build();
        meter.counter::<i64>("requests").build().add(1, &[KeyValue::new("k", "a")]);

        let seen = cumulative.collect().unwrap();
        let names: Vec<&str> = seen.iter().map(|metric| metric.name.as_str()).collect();
        assert_eq!(names, vec!["threads", "requests"]);
        assert_eq!(value(&seen, "threads", &attrs("a")), Some(NumberValue::I64(12)));
    }

    #[test]
    fn test_same_scope_yields_same_meter() {
        let reader = Arc::new(ManualReader::new());
        let provider = MeterProvider::builder()
            .with_shared_reader(reader.clone())
            .build()
            .unwrap();

        provider.meter("lib").counter::<i64>("calls").build().add(1, &[]);
        provider.meter("lib").counter::<i64>("calls").build().add(1, &[]);
        provider
            .meter_with_scope(InstrumentationScope::new("lib").with_version("2.0"))
            .counter::<i64>("calls")
            .build()
            .add(1, &[]);

        let seen = reader.collect().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].data.number_points()[0].value, NumberValue::I64(2));
        assert_eq!(seen[1].scope.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_duplicate_reader_is_config_error() {
        let reader: Arc<dyn MetricReader> = Arc::new(ManualReader::new());
        let result = MeterProvider::builder()
            .with_shared_reader(Arc::clone(&reader))
            .with_shared_reader(reader)
            .build();
        assert!(matches!(result, Err(MetricsError::Config(_))));
    }

    #[test]
    fn test_handles_are_distinct() {
        let (provider, _, _) = two_readers();
        let handles: Vec<CollectionHandle> =
            provider.readers().iter().map(RegisteredReader::handle).collect();
        assert_eq!(handles.len(), 2);
        assert_ne!(handles[0], handles[1]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (provider, cumulative, delta) = two_readers();
        let counter = provider.meter("shop").counter::<i64>("orders").build();
        counter.add(1, &[]);

        provider.shutdown().await.unwrap();
        provider.shutdown().await.unwrap();
        assert!(provider.is_shutdown());

        counter.add(1, &[]);
        assert!(cumulative.collect().unwrap().is_empty());
        assert!(delta.collect().unwrap().is_empty());
        assert!(provider.meter("late").scope().is_none());
        assert!(matches!(
            provider.force_flush().await,
            Err(MetricsError::AlreadyShutdown(_))
        ));
    }

    #[test]
    fn test_registration_after_provider_dropped() {
        let reader = Arc::new(ManualReader::new());
        let provider = MeterProvider::builder()
            .with_shared_reader(reader.clone())
            .build()
            .unwrap();
        provider.meter("lib").counter::<i64>("calls").build().add(1, &[]);
        drop(provider);

        assert!(reader.collect().unwrap().is_empty());
    }

    #[test]
    fn test_resource_is_attached() {
        let reader = Arc::new(ManualReader::new());
        let provider = MeterProvider::builder()
            .with_resource(Resource::new(&[KeyValue::new("service.name", "checkout")]))
            .with_shared_reader(reader.clone())
            .build()
            .unwrap();
        provider.meter("lib").counter::<i64>("calls").build().add(1, &[]);

        let seen = reader.collect().unwrap();
        assert_eq!(seen[0].resource.service_name().as_deref(), Some("checkout"));
    }

    #[tokio::test]
    async fn test_from_config_builds_periodic_readers() {
        let config = SdkConfig::builder()
            .add_toml(
                r#"
                service_name = "configured"

                [[readers]]
                interval_ms = 3600000
                temporality = "delta"
                cardinality_limit = 7

                [readers.exporter]
                kind = "shared-memory"
                "#,
            )
            .build()
            .unwrap();

        let exporter = InMemoryExporter::new();
        let mut registry = ExporterRegistry::new();
        let shared = exporter.clone();
        registry.register("shared-memory", move |_config: &ExporterConfig| {
            Ok(Arc::new(shared.clone()) as Arc<dyn MetricExporter>)
        });

        let provider = MeterProviderBuilder::from_config(&config, &registry)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(provider.resource().service_name().as_deref(), Some("configured"));

        let reader = &provider.readers()[0];
        assert_eq!(reader.temporality(InstrumentKind::Counter), Temporality::Delta);
        assert_eq!(reader.cardinality_limit(InstrumentKind::Gauge), 7);

        provider.meter("lib").counter::<i64>("calls").build().add(3, &[]);
        provider.shutdown().await.unwrap();

        let exported = exporter.finished_metrics();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].data.number_points()[0].value, NumberValue::I64(3));
        assert!(exporter.is_shutdown());
    }

    #[test]
    fn test_from_config_unknown_exporter() {
        let config = SdkConfig {
            readers: vec![ReaderConfig {
                exporter: ExporterConfig {
                    kind: "missing".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = MeterProviderBuilder::from_config(&config, &ExporterRegistry::new());
        assert!(matches!(result, Err(MetricsError::Config(_))));
    }

    #[test]
    fn test_from_config_rejects_zero_cardinality_limit() {
        let config = SdkConfig {
            readers: vec![ReaderConfig {
                cardinality_limit: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        let result = MeterProviderBuilder::from_config(&config, &ExporterRegistry::new());
        assert!(matches!(result, Err(MetricsError::Config(_))));
    }
}
