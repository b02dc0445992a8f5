//! Live telemetry cells and the ingestion path used by driver callbacks.
//!
//! Each client owns one [`TelemetryStore`]: a single lock around all of that
//! client's cells, so a `(value, timestamp)` pair is always written and read
//! together and unrelated clients never contend.

use crate::client::ClientId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// Device-reported measurement kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Temperature,
    Production,
    Power,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Temperature, Metric::Production, Metric::Power];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Production => "production",
            Metric::Power => "power",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(Metric::Temperature),
            "production" => Ok(Metric::Production),
            "power" => Ok(Metric::Power),
            other => Err(format!("unknown metric '{}'", other)),
        }
    }
}

/// A value tagged with the wall-clock time it was measured or decided.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Point-in-time copy of a client's telemetry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveTelemetry {
    pub temperature: Option<Reading>,
    pub production: Option<Reading>,
    pub power: Option<Reading>,
    /// Last decision sent to the device
    pub decision: Option<Reading>,
    /// Forecast point nearest to the last optimize/refresh
    pub forecast: Option<Reading>,
}

impl LiveTelemetry {
    pub fn get(&self, metric: Metric) -> Option<Reading> {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Production => self.production,
            Metric::Power => self.power,
        }
    }

    fn slot_mut(&mut self, metric: Metric) -> &mut Option<Reading> {
        match metric {
            Metric::Temperature => &mut self.temperature,
            Metric::Production => &mut self.production,
            Metric::Power => &mut self.power,
        }
    }
}

/// Last-writer-wins by carried timestamp. Equal timestamps overwrite.
fn apply_ordered(slot: &mut Option<Reading>, reading: Reading) -> bool {
    match slot {
        Some(current) if reading.timestamp < current.timestamp => false,
        _ => {
            *slot = Some(reading);
            true
        }
    }
}

struct Cells {
    live: LiveTelemetry,
    /// Bumped when the client's driver is rebound; sinks from older bindings are ignored.
    generation: u64,
}

/// Per-client telemetry guarded by one lock.
pub struct TelemetryStore {
    cells: RwLock<Cells>,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(Cells {
                live: LiveTelemetry::default(),
                generation: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> LiveTelemetry {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .clone()
    }

    pub fn get(&self, metric: Metric) -> Option<Reading> {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .get(metric)
    }

    /// Records a device reading. Returns false if a newer value is already stored.
    pub fn record(&self, metric: Metric, reading: Reading) -> bool {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        apply_ordered(cells.live.slot_mut(metric), reading)
    }

    pub fn record_decision(&self, reading: Reading) -> bool {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        apply_ordered(&mut cells.live.decision, reading)
    }

    /// The forecast point follows the curve, so it is replaced unconditionally.
    pub fn set_forecast(&self, reading: Option<Reading>) {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.live.forecast = reading;
    }

    fn record_from(&self, generation: u64, metric: Metric, reading: Reading) -> Ingest {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        if cells.generation != generation {
            return Ingest::Detached;
        }
        if apply_ordered(cells.live.slot_mut(metric), reading) {
            Ingest::Stored
        } else {
            Ingest::Stale
        }
    }

    /// Detaches every sink handed out so far.
    pub(crate) fn bump_generation(&self) {
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.generation += 1;
    }

    fn generation(&self) -> u64 {
        self.cells
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }
}

/// Outcome of a callback write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ingest {
    Stored,
    /// Older than the stored value
    Stale,
    /// Rejected before storage (non-finite value)
    Invalid,
    /// The sink belongs to a driver that has since been unbound
    Detached,
}

/// Handle given to a driver on `start`; the only way a driver writes telemetry.
///
/// Cheap to clone and safe to call from any task or thread.
#[derive(Clone)]
pub struct TelemetrySink {
    client_id: ClientId,
    store: Arc<TelemetryStore>,
    generation: u64,
}

impl TelemetrySink {
    pub fn new(client_id: ClientId, store: Arc<TelemetryStore>) -> Self {
        let generation = store.generation();
        Self {
            client_id,
            store,
            generation,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn on_temperature(&self, value: f64, timestamp: DateTime<Utc>) -> Ingest {
        self.on_reading(Metric::Temperature, value, timestamp)
    }

    pub fn on_production(&self, value: f64, timestamp: DateTime<Utc>) -> Ingest {
        self.on_reading(Metric::Production, value, timestamp)
    }

    pub fn on_power(&self, value: f64, timestamp: DateTime<Utc>) -> Ingest {
        self.on_reading(Metric::Power, value, timestamp)
    }

    pub fn on_reading(&self, metric: Metric, value: f64, timestamp: DateTime<Utc>) -> Ingest {
        if !value.is_finite() {
            tracing::warn!(
                client_id = %self.client_id,
                metric = %metric,
                value,
                "Dropping non-finite telemetry value"
            );
            return Ingest::Invalid;
        }

        let outcome = self
            .store
            .record_from(self.generation, metric, Reading::new(value, timestamp));
        match outcome {
            Ingest::Stale => tracing::debug!(
                client_id = %self.client_id,
                metric = %metric,
                timestamp = %timestamp,
                "Ignoring out-of-order telemetry"
            ),
            Ingest::Detached => tracing::debug!(
                client_id = %self.client_id,
                metric = %metric,
                "Ignoring telemetry from unbound driver"
            ),
            _ => {}
        }
        outcome
    }
}

impl fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("client_id", &self.client_id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::thread;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_older_reading_never_overwrites() {
        let store = Arc::new(TelemetryStore::new());
        let sink = TelemetrySink::new(ClientId(5), store.clone());

        assert_eq!(sink.on_temperature(55.0, at(12)), Ingest::Stored);
        assert_eq!(sink.on_temperature(48.0, at(10)), Ingest::Stale);

        let temp = store.get(Metric::Temperature).unwrap();
        assert_eq!(temp.value, 55.0);
        assert_eq!(temp.timestamp, at(12));
    }

    #[test]
    fn test_equal_timestamp_overwrites() {
        let store = Arc::new(TelemetryStore::new());
        let sink = TelemetrySink::new(ClientId(1), store.clone());

        sink.on_production(100.0, at(3));
        assert_eq!(sink.on_production(120.0, at(3)), Ingest::Stored);
        assert_eq!(store.get(Metric::Production).unwrap().value, 120.0);
    }

    #[test]
    fn test_metrics_are_independent() {
        let store = Arc::new(TelemetryStore::new());
        let sink = TelemetrySink::new(ClientId(1), store.clone());

        sink.on_temperature(50.0, at(20));
        assert_eq!(sink.on_power(800.0, at(5)), Ingest::Stored);

        let snap = store.snapshot();
        assert_eq!(snap.temperature.unwrap().value, 50.0);
        assert_eq!(snap.power.unwrap().value, 800.0);
        assert!(snap.production.is_none());
    }

    #[test]
    fn test_non_finite_rejected() {
        let store = Arc::new(TelemetryStore::new());
        let sink = TelemetrySink::new(ClientId(1), store.clone());

        assert_eq!(sink.on_temperature(f64::NAN, at(1)), Ingest::Invalid);
        assert!(store.get(Metric::Temperature).is_none());
    }

    #[test]
    fn test_detached_sink_is_ignored() {
        let store = Arc::new(TelemetryStore::new());
        let old = TelemetrySink::new(ClientId(1), store.clone());
        store.bump_generation();
        let new = TelemetrySink::new(ClientId(1), store.clone());

        assert_eq!(old.on_temperature(40.0, at(100)), Ingest::Detached);
        assert_eq!(new.on_temperature(41.0, at(1)), Ingest::Stored);
        assert_eq!(store.get(Metric::Temperature).unwrap().value, 41.0);
    }

    #[test]
    fn test_concurrent_writers_keep_newest_pair() {
        let store = Arc::new(TelemetryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|w| {
                let sink = TelemetrySink::new(ClientId(1), store.clone());
                thread::spawn(move || {
                    for i in 0..200 {
                        let ts = (i * 8 + w) as i64;
                        // value encodes its own timestamp so pairs can be checked
                        sink.on_temperature(ts as f64, at(ts));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let temp = store.get(Metric::Temperature).unwrap();
        assert_eq!(temp.timestamp, at(199 * 8 + 7));
        assert_eq!(temp.value, (199 * 8 + 7) as f64);
    }

    #[test]
    fn test_metric_parse() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
        assert!("voltage".parse::<Metric>().is_err());
    }
}
