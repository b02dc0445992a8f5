//! Driver registry - lookup table from stable type id to factory.

use super::{Driver, DriverDescriptor, DriverFactory};
use crate::client::DriverConfig;
use crate::error::ConfigurationError;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct DriverRegistry {
    factories: BTreeMap<String, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under its descriptor id, replacing any previous one.
    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) -> &mut Self {
        self.factories.insert(factory.type_id(), factory);
        self
    }

    pub fn get(&self, type_id: &str) -> Option<Arc<dyn DriverFactory>> {
        self.factories.get(type_id).cloned()
    }

    pub fn descriptors(&self) -> Vec<DriverDescriptor> {
        self.factories.values().map(|f| f.descriptor()).collect()
    }

    /// Builds a driver from a client's driver section.
    pub fn build(&self, config: &DriverConfig) -> Result<Arc<dyn Driver>, ConfigurationError> {
        let factory = self
            .get(&config.type_id)
            .ok_or_else(|| ConfigurationError::UnknownDriver(config.type_id.clone()))?;
        let driver = factory.deserialize_config(&config.config)?;
        Ok(Arc::from(driver))
    }

    /// Driver section describing an already built driver.
    pub fn describe(driver: &dyn Driver) -> DriverConfig {
        DriverConfig {
            type_id: driver.type_id().to_string(),
            config: driver.serialize_config(),
        }
    }
}
