//! Service configuration loaded from TOML, with environment overrides.

use crate::driver::BackoffPolicy;
use crate::efficiency::CorrectionPolicy;
use crate::error::ConfigurationError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Upper bounds keeping `Instant + Duration` arithmetic in range.
const MAX_TICK_SECS: u64 = 3600;
const MAX_BACKOFF_SECS: u64 = 86_400;

/// `value * unit` seconds, `None` on overflow.
fn scaled_secs(value: u64, unit: u64) -> Option<Duration> {
    value.checked_mul(unit).map(Duration::from_secs)
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub efficiency: EfficiencyConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// How often each task class runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CadenceConfig {
    /// Defaults to `optimizer.step_minutes` when unset
    #[serde(default)]
    pub optimize_minutes: Option<u64>,
    #[serde(default = "default_weather_refresh_hours")]
    pub weather_refresh_hours: u64,
    #[serde(default = "default_persistence_sync_minutes")]
    pub persistence_sync_minutes: u64,
    #[serde(default = "default_efficiency_days")]
    pub efficiency_days: u64,
    /// Scheduler tick
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
}

fn default_weather_refresh_hours() -> u64 {
    1
}

fn default_persistence_sync_minutes() -> u64 {
    2
}

fn default_efficiency_days() -> u64 {
    7
}

fn default_tick_seconds() -> u64 {
    1
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            optimize_minutes: None,
            weather_refresh_hours: default_weather_refresh_hours(),
            persistence_sync_minutes: default_persistence_sync_minutes(),
            efficiency_days: default_efficiency_days(),
            tick_seconds: default_tick_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_horizon_hours")]
    pub horizon_hours: u32,
    #[serde(default = "default_step_minutes")]
    pub step_minutes: u32,
}

fn default_horizon_hours() -> u32 {
    24
}

fn default_step_minutes() -> u32 {
    15
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            horizon_hours: default_horizon_hours(),
            step_minutes: default_step_minutes(),
        }
    }
}

/// Forecast sharing between leaders.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ForecastConfig {
    /// Leaders within this distance (km) of an earlier leader share its
    /// forecast. 0 disables grouping.
    #[serde(default)]
    pub proximity_km: f64,
}

/// Upper bounds on external calls made during a pass (seconds).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_call_timeout")]
    pub optimizer_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub forecast_secs: u64,
    #[serde(default = "default_short_timeout")]
    pub persistence_secs: u64,
    #[serde(default = "default_short_timeout")]
    pub driver_secs: u64,
}

fn default_call_timeout() -> u64 {
    30
}

fn default_short_timeout() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            optimizer_secs: default_call_timeout(),
            forecast_secs: default_call_timeout(),
            persistence_secs: default_short_timeout(),
            driver_secs: default_short_timeout(),
        }
    }
}

/// Driver start retry schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
    #[serde(default = "default_backoff_jitter")]
    pub jitter: f64,
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    1800
}

fn default_backoff_jitter() -> f64 {
    0.1
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            max_secs: default_backoff_max(),
            jitter: default_backoff_jitter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EfficiencyConfig {
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,
    #[serde(default = "default_max_ratio")]
    pub max_ratio: f64,
    #[serde(default = "default_min_yield")]
    pub min_yield: f64,
    #[serde(default = "default_max_yield")]
    pub max_yield: f64,
    /// Relative change per cycle
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    #[serde(default = "default_min_forecast_wh")]
    pub min_forecast_wh: f64,
}

fn default_min_ratio() -> f64 {
    0.5
}

fn default_max_ratio() -> f64 {
    1.5
}

fn default_min_yield() -> f64 {
    0.05
}

fn default_max_yield() -> f64 {
    1.0
}

fn default_max_step() -> f64 {
    0.10
}

fn default_min_forecast_wh() -> f64 {
    1.0
}

impl Default for EfficiencyConfig {
    fn default() -> Self {
        Self {
            min_ratio: default_min_ratio(),
            max_ratio: default_max_ratio(),
            min_yield: default_min_yield(),
            max_yield: default_max_yield(),
            max_step: default_max_step(),
            min_forecast_wh: default_min_forecast_wh(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Opened when `path` cannot be
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,
}

fn default_db_path() -> String {
    "data/optimasol.db".to_string()
}

fn default_fallback_path() -> String {
    "fallback_optimasol.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            fallback_path: default_fallback_path(),
        }
    }
}

impl ServiceConfig {
    fn optimize_minutes(&self) -> u64 {
        self.cadence
            .optimize_minutes
            .unwrap_or(u64::from(self.optimizer.step_minutes))
    }

    /// Cadences measured in units larger than a second, as
    /// `(field, value, seconds per unit)`.
    fn scaled_cadences(&self) -> [(&'static str, u64, u64); 4] {
        [
            ("cadence.optimize_minutes", self.optimize_minutes(), 60),
            ("cadence.weather_refresh_hours", self.cadence.weather_refresh_hours, 3600),
            ("cadence.persistence_sync_minutes", self.cadence.persistence_sync_minutes, 60),
            ("cadence.efficiency_days", self.cadence.efficiency_days, 86_400),
        ]
    }

    pub fn optimize_cadence(&self) -> Duration {
        scaled_secs(self.optimize_minutes(), 60).unwrap_or(Duration::MAX)
    }

    pub fn weather_cadence(&self) -> Duration {
        scaled_secs(self.cadence.weather_refresh_hours, 3600).unwrap_or(Duration::MAX)
    }

    pub fn persistence_cadence(&self) -> Duration {
        scaled_secs(self.cadence.persistence_sync_minutes, 60).unwrap_or(Duration::MAX)
    }

    pub fn efficiency_cadence(&self) -> Duration {
        scaled_secs(self.cadence.efficiency_days, 86_400).unwrap_or(Duration::MAX)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.cadence.tick_seconds)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff.base_secs),
            max: Duration::from_secs(self.backoff.max_secs),
            jitter: self.backoff.jitter,
        }
    }

    pub fn correction_policy(&self) -> CorrectionPolicy {
        CorrectionPolicy {
            min_ratio: self.efficiency.min_ratio,
            max_ratio: self.efficiency.max_ratio,
            min_yield: self.efficiency.min_yield,
            max_yield: self.efficiency.max_yield,
            max_step: self.efficiency.max_step,
            min_forecast: self.efficiency.min_forecast_wh,
        }
    }

    /// Overrides from `OPTIMASOL_*` environment variables. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OPTIMASOL_DB_PATH") {
            if !v.is_empty() {
                self.database.path = v;
            }
        }
        if let Ok(v) = std::env::var("OPTIMASOL_MQTT_HOST") {
            if !v.is_empty() {
                self.mqtt.host = v;
            }
        }
        if let Ok(v) = std::env::var("OPTIMASOL_MQTT_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.mqtt.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (field, value, unit) in self.scaled_cadences() {
            match scaled_secs(value, unit) {
                None => return Err(ConfigurationError::invalid(field, "is out of range")),
                Some(cadence) if cadence.is_zero() => {
                    return Err(ConfigurationError::invalid(field, "must be greater than zero"));
                }
                Some(_) => {}
            }
        }
        if !(1..=MAX_TICK_SECS).contains(&self.cadence.tick_seconds) {
            return Err(ConfigurationError::invalid(
                "cadence.tick_seconds",
                format!("must be within 1..={}", MAX_TICK_SECS),
            ));
        }

        if self.optimizer.horizon_hours == 0 {
            return Err(ConfigurationError::invalid(
                "optimizer.horizon_hours",
                "must be greater than zero",
            ));
        }

        let e = &self.efficiency;
        if !(e.min_ratio > 0.0 && e.min_ratio <= e.max_ratio) {
            return Err(ConfigurationError::invalid(
                "efficiency.min_ratio",
                "must be positive and not above max_ratio",
            ));
        }
        if !(e.min_yield > 0.0 && e.min_yield <= e.max_yield && e.max_yield <= 1.0) {
            return Err(ConfigurationError::invalid(
                "efficiency.min_yield",
                "yield range must satisfy 0 < min_yield <= max_yield <= 1",
            ));
        }
        if !(e.max_step > 0.0 && e.max_step <= 1.0) {
            return Err(ConfigurationError::invalid(
                "efficiency.max_step",
                "must be within (0, 1]",
            ));
        }
        let radius = self.forecast.proximity_km;
        if !(radius.is_finite() && radius >= 0.0) {
            return Err(ConfigurationError::invalid(
                "forecast.proximity_km",
                "must be a non-negative distance",
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigurationError::invalid("backoff.jitter", "must be within [0, 1]"));
        }
        if self.backoff.base_secs == 0 || self.backoff.base_secs > self.backoff.max_secs {
            return Err(ConfigurationError::invalid(
                "backoff.base_secs",
                "must be positive and not above max_secs",
            ));
        }
        if self.backoff.max_secs > MAX_BACKOFF_SECS {
            return Err(ConfigurationError::invalid(
                "backoff.max_secs",
                format!("must be at most {}", MAX_BACKOFF_SECS),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file. A missing file yields defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ServiceConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ServiceConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.optimize_cadence(), Duration::from_secs(15 * 60));
        assert_eq!(config.weather_cadence(), Duration::from_secs(3600));
        assert_eq!(config.persistence_cadence(), Duration::from_secs(120));
        assert_eq!(config.efficiency_cadence(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.tick(), Duration::from_secs(1));
        assert_eq!(config.mqtt.host, "localhost");
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [cadence]
            optimize_minutes = 5
            weather_refresh_hours = 2

            [optimizer]
            horizon_hours = 48

            [efficiency]
            max_step = 0.05

            [mqtt]
            host = "broker.local"
            username = "router"

            [database]
            path = "/var/lib/optimasol/main.db"
        "#;

        let config: ServiceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.optimize_cadence(), Duration::from_secs(300));
        assert_eq!(config.weather_cadence(), Duration::from_secs(7200));
        assert_eq!(config.cadence.persistence_sync_minutes, 2);
        assert_eq!(config.optimizer.horizon_hours, 48);
        assert_eq!(config.optimizer.step_minutes, 15);
        assert_eq!(config.correction_policy().max_step, 0.05);
        assert_eq!(config.mqtt.username.as_deref(), Some("router"));
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.database.fallback_path, "fallback_optimasol.db");
    }

    #[test]
    fn test_optimize_cadence_follows_step() {
        let config: ServiceConfig = toml::from_str("[optimizer]\nstep_minutes = 10\n").unwrap();
        assert_eq!(config.optimize_cadence(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServiceConfig::default();
        config.cadence.persistence_sync_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.efficiency.min_ratio = 2.0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.efficiency.max_yield = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_proximity_grouping_off_by_default() {
        let config = ServiceConfig::default();
        assert_eq!(config.forecast.proximity_km, 0.0);

        let config: ServiceConfig = toml::from_str("[forecast]\nproximity_km = 15.0\n").unwrap();
        assert_eq!(config.forecast.proximity_km, 15.0);
        assert!(config.validate().is_ok());

        let mut config = ServiceConfig::default();
        config.forecast.proximity_km = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_cadences_rejected_without_overflow() {
        let mut config = ServiceConfig::default();
        config.cadence.efficiency_days = u64::MAX / 1000;
        assert_eq!(config.efficiency_cadence(), Duration::MAX);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cadence.efficiency_days"));

        let mut config = ServiceConfig::default();
        config.cadence.optimize_minutes = Some(u64::MAX);
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.cadence.tick_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.backoff.max_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimasol.toml");
        std::fs::write(&path, "[cadence]\nefficiency_days = 1\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.efficiency_cadence(), Duration::from_secs(86_400));

        std::fs::write(&path, "[cadence\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
