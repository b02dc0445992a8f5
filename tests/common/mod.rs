// Shared fixtures for the scheduler integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use optimasol::client::{Installation, Position};
use optimasol::driver::{BackoffPolicy, Driver, DriverDescriptor, DriverFactory, DriverRegistry};
use optimasol::forecast::{ForecastCurve, ForecastPoint, ForecastProvider, ForecastWindow};
use optimasol::optimizer::{OptimizationRequest, Optimizer};
use optimasol::persistence::MemoryPersistence;
use optimasol::telemetry::TelemetrySink;
use optimasol::{
    ClientId, ConfigurationError, Dependencies, DriverError, ExternalDependencyError, Fleet,
    FleetScheduler, SchedulerSettings,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub fn origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 21, 8, 0, 0).unwrap()
}

pub fn client_json(label: &str) -> Value {
    json!({
        "engine": {
            "water_heater": {"volume": 200.0, "power": 3000.0, "insulation_coeff": 0.3, "temp_cold_water": 12.0},
            "prices": {"mode": "BASE", "base_price": 0.2},
            "constraints": {"min_temp": 45.0}
        },
        "weather": {
            "position": {"latitude": 45.76, "longitude": 4.84},
            "installation": {"global_yield": 0.8, "panels": [{"azimuth": 180.0, "tilt": 35.0, "surface": 1.7}]}
        },
        "driver": {"type": "recorder", "config": {"label": label}}
    })
}

pub fn follower_json(label: &str, leader: i64) -> Value {
    let mut value = client_json(label);
    value["weather"] = json!({ "weather_ref": leader });
    value
}

#[derive(Default)]
pub struct Recorder {
    pub fail_starts: AtomicU32,
    pub starts: AtomicU32,
    pub decisions: Mutex<Vec<f64>>,
}

impl Recorder {
    pub fn decision_count(&self) -> usize {
        self.decisions.lock().unwrap().len()
    }
}

pub type Recorders = Arc<Mutex<HashMap<String, Arc<Recorder>>>>;

pub fn recorder(recorders: &Recorders, label: &str) -> Arc<Recorder> {
    Arc::clone(recorders.lock().unwrap().entry(label.to_string()).or_default())
}

struct RecorderDriver {
    label: String,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl Driver for RecorderDriver {
    fn type_id(&self) -> &str {
        "recorder"
    }

    async fn start(&self, sink: TelemetrySink) -> Result<(), DriverError> {
        self.recorder.starts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.recorder.fail_starts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.recorder.fail_starts.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Connection("no route to device".to_string()));
        }
        sink.on_temperature(48.0, Utc::now());
        Ok(())
    }

    async fn apply_decision(&self, value: f64) -> Result<(), DriverError> {
        self.recorder.decisions.lock().unwrap().push(value);
        Ok(())
    }

    fn serialize_config(&self) -> Value {
        json!({ "label": self.label })
    }
}

pub struct RecorderFactory {
    pub recorders: Recorders,
}

impl DriverFactory for RecorderFactory {
    fn descriptor(&self) -> DriverDescriptor {
        DriverDescriptor {
            id: "recorder".to_string(),
            name: "Recorder".to_string(),
            description: String::new(),
            form_schema: vec![],
        }
    }

    fn deserialize_config(&self, config: &Value) -> Result<Box<dyn Driver>, ConfigurationError> {
        let label = config["label"]
            .as_str()
            .ok_or_else(|| ConfigurationError::missing("driver.config.label"))?;
        Ok(Box::new(RecorderDriver {
            label: label.to_string(),
            recorder: recorder(&self.recorders, label),
        }))
    }
}

pub struct FixedOptimizer(pub f64);

#[async_trait]
impl Optimizer for FixedOptimizer {
    async fn decide(&self, _: &OptimizationRequest) -> Result<f64, ExternalDependencyError> {
        Ok(self.0)
    }
}

/// Flat 800 W curve; counts calls.
#[derive(Default)]
pub struct CountingForecast {
    pub fetches: AtomicUsize,
}

#[async_trait]
impl ForecastProvider for CountingForecast {
    async fn fetch(
        &self,
        _: &Position,
        _: &Installation,
        window: ForecastWindow,
    ) -> Result<ForecastCurve, ExternalDependencyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ForecastCurve::new(
            (0..48)
                .map(|i| ForecastPoint {
                    timestamp: window.start + ChronoDuration::minutes(30 * i),
                    production: 800.0,
                })
                .collect(),
        ))
    }
}

pub struct Setup {
    pub scheduler: FleetScheduler,
    pub store: MemoryPersistence,
    pub recorders: Recorders,
    pub forecast: Arc<CountingForecast>,
    pub start: Instant,
}

impl Setup {
    pub fn recorder(&self, label: &str) -> Arc<Recorder> {
        recorder(&self.recorders, label)
    }

    pub async fn advance(&mut self, secs: u64) {
        self.scheduler
            .run_due(self.start + Duration::from_secs(secs))
            .await;
    }
}

/// Five-minute optimize and sync, hourly weather, no jitter.
pub fn settings() -> SchedulerSettings {
    SchedulerSettings {
        optimize: Duration::from_secs(5 * 60),
        weather_refresh: Duration::from_secs(60 * 60),
        persistence_sync: Duration::from_secs(5 * 60),
        efficiency: Duration::from_secs(7 * 24 * 60 * 60),
        backoff: BackoffPolicy {
            base: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
            jitter: 0.0,
        },
        ..SchedulerSettings::default()
    }
}

pub async fn setup(clients: Vec<(i64, Value)>) -> Setup {
    let store = MemoryPersistence::new();
    for (id, config) in clients {
        store.seed(ClientId(id), config).await;
    }

    let recorders: Recorders = Arc::default();
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(RecorderFactory {
        recorders: Arc::clone(&recorders),
    }));
    let registry = Arc::new(registry);
    let (fleet, _) = Fleet::load(&store, &registry).await.unwrap();

    let forecast = Arc::new(CountingForecast::default());
    let deps = Dependencies {
        persistence: Arc::new(store.clone()),
        optimizer: Arc::new(FixedOptimizer(0.25)),
        forecast: forecast.clone(),
        registry,
    };

    let start = Instant::now();
    let mut scheduler = FleetScheduler::new(fleet, deps, settings());
    scheduler.set_clock_origin(start, origin());
    Setup {
        scheduler,
        store,
        recorders,
        forecast,
        start,
    }
}
