// Error taxonomy
pub mod error;

// Service configuration (TOML)
pub mod config;

// Client configuration, validation and per-client state
pub mod client;

// Timestamp-ordered live telemetry
pub mod telemetry;

// Device driver contract, registry and start supervision
pub mod driver;

// Forecast curves, provider contract and leader resolution
pub mod forecast;

// Optimizer contract
pub mod optimizer;

// Yield factor correction
pub mod efficiency;

// Durable storage
pub mod persistence;

// Client collection
pub mod fleet;

// Multi-frequency scheduler and administrative commands
pub mod scheduler;

pub use client::{Client, ClientConfig, ClientId};
pub use config::{load_config, ServiceConfig};
pub use error::{
    ConfigurationError, DriverError, ExternalDependencyError, OrchestratorError, PersistenceError,
};
pub use fleet::Fleet;
pub use scheduler::{Dependencies, FleetHandle, FleetScheduler, SchedulerSettings, TaskKind};
