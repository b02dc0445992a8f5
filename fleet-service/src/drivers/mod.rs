//! Built-in device drivers.

pub mod serial_meter;
pub mod smart_electromation;

pub use serial_meter::{SerialMeterDriver, SerialMeterFactory};
pub use smart_electromation::{SmartElectromationDriver, SmartElectromationFactory};
