//! Error taxonomy for the orchestrator.
//!
//! Every per-client failure ends up as an [`OrchestratorError`] at the
//! scheduler's per-client boundary, where it is logged and swallowed.

use crate::client::ClientId;
use std::time::Duration;
use thiserror::Error;

/// Invalid or cyclic configuration. Raised before a value is accepted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("missing field `{0}`")]
    MissingField(String),

    #[error("weather_ref cycle: {}", format_chain(.0))]
    WeatherCycle(Vec<ClientId>),

    #[error("client {from} has weather_ref to unknown client {to}")]
    DanglingWeatherRef { from: ClientId, to: ClientId },

    #[error("unknown driver type `{0}`")]
    UnknownDriver(String),

    #[error("client {0} already exists")]
    DuplicateClient(ClientId),

    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }
}

fn format_chain(chain: &[ClientId]) -> String {
    chain
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Device communication failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    #[error("device not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("decision {0} out of range [0, 1]")]
    DecisionOutOfRange(f64),

    #[error("send failed: {0}")]
    Send(String),

    #[error("driver operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Optimizer or forecast provider failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExternalDependencyError {
    #[error("optimization failed: {0}")]
    Optimization(String),

    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(String),

    #[error("{dependency} timed out after {after:?}")]
    Timeout {
        dependency: &'static str,
        after: Duration,
    },
}

/// Durable storage failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("client {0} not found")]
    ClientNotFound(ClientId),

    #[error("persistence timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Umbrella error carried across the scheduler's per-client boundary.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    External(#[from] ExternalDependencyError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("client {0} not found")]
    UnknownClient(ClientId),

    #[error("client action panicked: {0}")]
    Panicked(String),

    #[error("scheduler is not running")]
    SchedulerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_chain() {
        let err = ConfigurationError::WeatherCycle(vec![ClientId(1), ClientId(2), ClientId(1)]);
        assert_eq!(err.to_string(), "weather_ref cycle: 1 -> 2 -> 1");
    }

    #[test]
    fn test_invalid_field_names_field() {
        let err = ConfigurationError::invalid("engine.prices.base_price", "required in BASE mode");
        assert!(err.to_string().contains("engine.prices.base_price"));
    }

    #[test]
    fn test_umbrella_conversion() {
        let err: OrchestratorError = DriverError::NotConnected.into();
        assert!(matches!(err, OrchestratorError::Driver(DriverError::NotConnected)));
    }
}
