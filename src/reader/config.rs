use std::time::Duration;

use crate::config::ReaderConfig;

/// Scheduling for a periodic reader
#[derive(Debug, Clone)]
pub struct PeriodicReaderConfig {
    /// Used in log lines
    pub name: String,
    /// Time between collections
    pub interval: Duration,
    /// Upper bound on one collect-and-export cycle
    pub timeout: Duration,
    /// Capacity of the flush/shutdown command channel
    pub channel_size: usize,
}

impl Default for PeriodicReaderConfig {
    fn default() -> Self {
        Self {
            name: "periodic_reader".to_string(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            channel_size: 16,
        }
    }
}

impl From<&ReaderConfig> for PeriodicReaderConfig {
    fn from(config: &ReaderConfig) -> Self {
        Self {
            name: format!("periodic_reader[{}]", config.exporter.kind),
            interval: config.interval(),
            timeout: config.timeout(),
            ..Default::default()
        }
    }
}

/// Builder for periodic reader configuration
pub struct PeriodicReaderConfigBuilder {
    config: PeriodicReaderConfig,
}

impl PeriodicReaderConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: PeriodicReaderConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn channel_size(mut self, size: usize) -> Self {
        self.config.channel_size = size.max(1);
        self
    }

    pub fn build(self) -> PeriodicReaderConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = PeriodicReaderConfigBuilder::new("fast")
            .interval(Duration::from_millis(250))
            .channel_size(0)
            .build();

        assert_eq!(config.name, "fast");
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.channel_size, 1);
    }

    #[test]
    fn test_from_reader_config() {
        let reader = ReaderConfig {
            interval_ms: 1500,
            timeout_ms: 700,
            ..Default::default()
        };
        let config = PeriodicReaderConfig::from(&reader);
        assert_eq!(config.name, "periodic_reader[logging]");
        assert_eq!(config.interval, Duration::from_millis(1500));
        assert_eq!(config.timeout, Duration::from_millis(700));
    }
}
