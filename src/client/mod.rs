//! Client State: one managed PV-routing installation.
//!
//! A [`Client`] owns its driver, its effective configuration and its live
//! state. Every piece of mutable state is guarded per client, so driver
//! callbacks and scheduler passes on different clients never contend.

mod config;
pub mod validation;

pub use config::{
    ClientConfig, Constraints, DayCode, DriverConfig, EngineConfig, Features, Installation,
    OptimizationMode, Panel, PlanningEntry, Position, PriceMode, PriceModel, TimeSlot,
    WaterHeater, WeatherConfig, DEFAULT_BACKGROUND_NOISE, DEFAULT_GRADATION, DEFAULT_MIN_TEMP,
};

use crate::driver::{Driver, DriverHealth};
use crate::efficiency::EfficiencyWindow;
use crate::error::ConfigurationError;
use crate::forecast::ForecastState;
use crate::telemetry::{TelemetrySink, TelemetryStore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Opaque client identity, the primary key in persistence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ClientId {
    fn from(id: i64) -> Self {
        ClientId(id)
    }
}

pub struct Client {
    id: ClientId,
    config: RwLock<Arc<ClientConfig>>,
    driver: RwLock<Arc<dyn Driver>>,
    telemetry: Arc<TelemetryStore>,
    forecast: Mutex<ForecastState>,
    efficiency: Mutex<EfficiencyWindow>,
    health: Mutex<DriverHealth>,
    /// Config changed in memory but not yet written to storage.
    config_dirty: AtomicBool,
}

impl Client {
    /// Binds a validated config to its driver.
    ///
    /// The stored driver section is rewritten from the driver itself so it
    /// always matches what `serialize_config` produces.
    pub fn new(
        id: ClientId,
        mut config: ClientConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<Self, ConfigurationError> {
        config.validate_for(id)?;
        config.driver = crate::driver::DriverRegistry::describe(driver.as_ref());
        Ok(Self {
            id,
            config: RwLock::new(Arc::new(config)),
            driver: RwLock::new(driver),
            telemetry: Arc::new(TelemetryStore::new()),
            forecast: Mutex::new(ForecastState::default()),
            efficiency: Mutex::new(EfficiencyWindow::default()),
            health: Mutex::new(DriverHealth::default()),
            config_dirty: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Currently effective configuration. Readers keep their snapshot even if
    /// a replacement lands concurrently.
    pub fn config(&self) -> Arc<ClientConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the whole configuration atomically. The driver section is
    /// kept as bound; changing it goes through [`Client::rebind`].
    pub fn replace_config(&self, mut config: ClientConfig) -> Result<(), ConfigurationError> {
        config.validate_for(self.id)?;
        let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.driver = current.driver.clone();
        *current = Arc::new(config);
        Ok(())
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a new driver and config. The caller must have stopped the
    /// previous driver; sinks handed to it are detached.
    pub fn rebind(
        &self,
        mut config: ClientConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<Arc<dyn Driver>, ConfigurationError> {
        config.validate_for(self.id)?;
        config.driver = crate::driver::DriverRegistry::describe(driver.as_ref());

        self.telemetry.bump_generation();
        let previous = {
            let mut slot = self.driver.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, driver)
        };
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        *self.health() = DriverHealth::default();
        Ok(previous)
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    /// Ingestion handle for the currently bound driver.
    pub fn sink(&self) -> TelemetrySink {
        TelemetrySink::new(self.id, Arc::clone(&self.telemetry))
    }

    pub fn forecast(&self) -> MutexGuard<'_, ForecastState> {
        self.forecast.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn efficiency(&self) -> MutexGuard<'_, EfficiencyWindow> {
        self.efficiency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn health(&self) -> MutexGuard<'_, DriverHealth> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_config_dirty(&self) {
        self.config_dirty.store(true, Ordering::SeqCst);
    }

    /// Clears and returns the pending-write flag.
    pub fn take_config_dirty(&self) -> bool {
        self.config_dirty.swap(false, Ordering::SeqCst)
    }

    /// Ready to optimize: a temperature reading and a forecast curve exist.
    pub fn is_ready(&self) -> bool {
        self.telemetry
            .get(crate::telemetry::Metric::Temperature)
            .is_some()
            && self.forecast().curve.is_some()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("driver", &self.driver().type_id())
            .finish()
    }
}
