use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{InMemoryExporter, LoggingExporter, MetricExporter};
use crate::config::ExporterConfig;
use crate::error::{MetricsError, Result};

/// Creates an exporter from its configuration section
pub type ExporterFactory =
    Box<dyn Fn(&ExporterConfig) -> Result<Arc<dyn MetricExporter>> + Send + Sync>;

/// Exporter factories by name, filled at startup and resolved before any
/// measurement is recorded.
///
/// `logging` and `memory` are always available; applications add their own
/// transports with [`ExporterRegistry::register`].
pub struct ExporterRegistry {
    factories: BTreeMap<String, ExporterFactory>,
}

impl ExporterRegistry {
    /// A registry holding only the built-in exporters
    pub fn new() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };
        registry.register("logging", |_config: &ExporterConfig| {
            Ok(Arc::new(LoggingExporter::default()) as Arc<dyn MetricExporter>)
        });
        registry.register("memory", |_config: &ExporterConfig| {
            Ok(Arc::new(InMemoryExporter::new()) as Arc<dyn MetricExporter>)
        });
        registry
    }

    /// Add or replace a factory
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ExporterConfig) -> Result<Arc<dyn MetricExporter>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering exporter factory '{}'", name);
        self.factories.insert(name, Box::new(factory));
        self
    }

    /// Build the exporter named by `config.kind`
    pub fn resolve(&self, config: &ExporterConfig) -> Result<Arc<dyn MetricExporter>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            MetricsError::Config(format!(
                "Unknown exporter '{}', registered exporters: {}",
                config.kind,
                self.names().join(", ")
            ))
        })?;
        factory(config)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl Default for ExporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> ExporterConfig {
        ExporterConfig {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_builtin_exporters_resolve() {
        let registry = ExporterRegistry::new();
        assert_eq!(registry.names(), vec!["logging", "memory"]);
        assert_eq!(registry.resolve(&config("logging")).unwrap().name(), "logging");
        assert_eq!(registry.resolve(&config("memory")).unwrap().name(), "memory");
    }

    #[test]
    fn test_unknown_exporter_is_config_error() {
        let registry = ExporterRegistry::new();
        match registry.resolve(&config("carrier-pigeon")) {
            Err(MetricsError::Config(message)) => assert!(message.contains("carrier-pigeon")),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("unknown exporter resolved"),
        }
    }

    #[test]
    fn test_custom_factory_sees_config() {
        let mut registry = ExporterRegistry::new();
        registry.register("named", |config: &ExporterConfig| {
            let name = config.endpoint.clone().unwrap_or_default();
            Ok(Arc::new(LoggingExporter::new(name)) as Arc<dyn MetricExporter>)
        });

        let exporter = registry
            .resolve(&ExporterConfig {
                kind: "named".to_string(),
                endpoint: Some("edge".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(exporter.name(), "edge");
    }
}
