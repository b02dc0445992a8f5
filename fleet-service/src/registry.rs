//! Registry of the drivers shipped with the service.

use crate::drivers::{SerialMeterFactory, SmartElectromationFactory};
use optimasol::config::MqttConfig;
use optimasol::driver::DriverRegistry;
use std::sync::Arc;

/// Returns a registry with every built-in driver.
pub fn default_registry(mqtt: &MqttConfig) -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry
        .register(Arc::new(SmartElectromationFactory::new(mqtt.clone())))
        .register(Arc::new(SerialMeterFactory));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimasol::client::DriverConfig;
    use serde_json::json;

    #[test]
    fn test_builtin_drivers_registered() {
        let registry = default_registry(&MqttConfig::default());
        let ids: Vec<String> = registry.descriptors().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["serial_meter", "smart_electromation_mqtt"]);
    }

    #[test]
    fn test_build_from_stored_section() {
        let registry = default_registry(&MqttConfig::default());
        let section = DriverConfig {
            type_id: "smart_electromation_mqtt".to_string(),
            config: json!({"serial_number": "PVROUTER001"}),
        };
        let driver = registry.build(&section).unwrap();
        assert_eq!(DriverRegistry::describe(driver.as_ref()), section);
    }
}
