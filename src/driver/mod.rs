//! Driver contract: the polymorphic boundary to a physical device.
//!
//! Concrete drivers live outside this crate and are made available through a
//! [`DriverRegistry`] keyed by their stable type id.

pub mod health;
pub mod registry;

pub use health::{BackoffPolicy, DriverHealth, DriverState};
pub use registry::DriverRegistry;

use crate::error::{ConfigurationError, DriverError};
use crate::telemetry::TelemetrySink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device driver bound to exactly one client.
///
/// # Lifecycle
/// 1. Built by a [`DriverFactory`] from its serialized config
/// 2. `start(sink)` opens communication; telemetry flows through `sink`
/// 3. `apply_decision()` is called once per optimize pass
/// 4. `stop()` on removal, rebinding or shutdown
///
/// Telemetry callbacks run on the driver's own tasks and may fire at any time.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable type id, stored next to the serialized config.
    fn type_id(&self) -> &str;

    /// Begins device communication.
    ///
    /// Must be idempotent: a second call while started returns `Ok(())`
    /// without opening a second connection.
    async fn start(&self, sink: TelemetrySink) -> Result<(), DriverError>;

    /// Sends a routing decision in `[0, 1]` to the device.
    async fn apply_decision(&self, value: f64) -> Result<(), DriverError>;

    /// Releases the device. Default is a no-op.
    async fn stop(&self) {}

    /// Storage-safe representation of this driver's configuration.
    ///
    /// [`DriverFactory::deserialize_config`] must invert it exactly.
    fn serialize_config(&self) -> Value;
}

/// Builds drivers of one device family.
pub trait DriverFactory: Send + Sync {
    fn descriptor(&self) -> DriverDescriptor;

    fn type_id(&self) -> String {
        self.descriptor().id
    }

    fn deserialize_config(&self, config: &Value) -> Result<Box<dyn Driver>, ConfigurationError>;
}

/// Metadata forwarded verbatim to UI/CLI layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub form_schema: Vec<FormField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

impl FormField {
    pub fn text(key: &str, label: &str, required: bool) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            field_type: "text".to_string(),
            required,
            help: None,
        }
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }
}
