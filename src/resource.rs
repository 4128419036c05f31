use log::debug;
use serde::Serialize;
use uuid::Uuid;

use crate::attributes::{AttributeSet, KeyValue};

/// Attributes describing the entity producing telemetry
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Resource {
    attributes: AttributeSet,
}

impl Resource {
    /// Create a resource from explicit attributes only
    pub fn new(attributes: &[KeyValue]) -> Self {
        Self {
            attributes: AttributeSet::new(attributes),
        }
    }

    /// An empty resource
    pub fn empty() -> Self {
        Self {
            attributes: AttributeSet::empty(),
        }
    }

    pub fn builder() -> ResourceBuilder {
        ResourceBuilder::default()
    }

    pub fn attributes(&self) -> &AttributeSet {
        &self.attributes
    }

    /// The `service.name` attribute, if present
    pub fn service_name(&self) -> Option<String> {
        self.attributes.get("service.name").map(|v| v.to_string())
    }
}

impl Default for Resource {
    fn default() -> Self {
        Resource::builder().build()
    }
}

/// Builder for a resource carrying the default service and host identity
pub struct ResourceBuilder {
    service_name: String,
    attributes: Vec<KeyValue>,
}

impl Default for ResourceBuilder {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            attributes: Vec::new(),
        }
    }
}

impl ResourceBuilder {
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }

    /// Build the resource. Explicit attributes override the defaults.
    pub fn build(self) -> Resource {
        let mut attributes = vec![
            KeyValue::new("service.name", self.service_name),
            KeyValue::new("service.instance.id", Uuid::new_v4().to_string()),
        ];

        match hostname::get() {
            Ok(host) => attributes.push(KeyValue::new(
                "host.name",
                host.to_string_lossy().into_owned(),
            )),
            Err(e) => debug!("Unable to determine host name for resource: {}", e),
        }

        attributes.extend(self.attributes);
        Resource::new(&attributes)
    }
}
