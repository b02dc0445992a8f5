//! Fleet Scheduler: one cooperative loop ticking every task class at its
//! own cadence.
//!
//! Each tick:
//! 1. Pending administrative commands are applied
//! 2. Drivers that are pending or due for a retry are started
//! 3. Due task classes run in [`TaskKind::ORDER`], each over a snapshot of
//!    client ids, with every per-client action isolated
//!
//! A task's `last_run` is set to the tick instant when its pass completes,
//! whatever happened to individual clients. Missed periods are not replayed.

mod admin;
mod tasks;

pub use admin::{ClientStatus, FleetCommand, FleetHandle};

use crate::client::ClientId;
use crate::config::ServiceConfig;
use crate::driver::{BackoffPolicy, DriverRegistry};
use crate::efficiency::CorrectionPolicy;
use crate::error::OrchestratorError;
use crate::fleet::Fleet;
use crate::forecast::ForecastProvider;
use crate::optimizer::Optimizer;
use crate::persistence::Persistence;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 64;

/// Task classes. Declaration order is the per-tick execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    WeatherRefresh,
    Optimize,
    EfficiencyCorrection,
    PersistenceSync,
}

impl TaskKind {
    pub const ORDER: [TaskKind; 4] = [
        TaskKind::WeatherRefresh,
        TaskKind::Optimize,
        TaskKind::EfficiencyCorrection,
        TaskKind::PersistenceSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::WeatherRefresh => "weather_refresh",
            TaskKind::Optimize => "optimize",
            TaskKind::EfficiencyCorrection => "efficiency_correction",
            TaskKind::PersistenceSync => "persistence_sync",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task class: cadence plus bookkeeping.
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    pub kind: TaskKind,
    pub cadence: Duration,
    /// `None` until the first pass; the first tick always runs it.
    pub last_run: Option<Instant>,
    pub runs: u64,
    /// Per-client failures in the most recent pass
    pub last_failures: usize,
}

impl ScheduledTask {
    pub fn new(kind: TaskKind, cadence: Duration) -> Self {
        Self {
            kind,
            cadence,
            last_run: None,
            runs: 0,
            last_failures: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.cadence,
        }
    }
}

/// Cadences, timeouts and numeric policies used by the scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub optimize: Duration,
    pub weather_refresh: Duration,
    pub persistence_sync: Duration,
    pub efficiency: Duration,
    pub optimizer_timeout: Duration,
    pub forecast_timeout: Duration,
    pub persistence_timeout: Duration,
    pub driver_timeout: Duration,
    pub horizon_hours: u32,
    pub step_minutes: u32,
    /// Radius for sharing forecasts between leaders; 0 disables it
    pub proximity_km: f64,
    pub backoff: BackoffPolicy,
    pub correction: CorrectionPolicy,
}

impl SchedulerSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            tick: config.tick(),
            optimize: config.optimize_cadence(),
            weather_refresh: config.weather_cadence(),
            persistence_sync: config.persistence_cadence(),
            efficiency: config.efficiency_cadence(),
            optimizer_timeout: Duration::from_secs(config.timeouts.optimizer_secs),
            forecast_timeout: Duration::from_secs(config.timeouts.forecast_secs),
            persistence_timeout: Duration::from_secs(config.timeouts.persistence_secs),
            driver_timeout: Duration::from_secs(config.timeouts.driver_secs),
            horizon_hours: config.optimizer.horizon_hours,
            step_minutes: config.optimizer.step_minutes,
            proximity_km: config.forecast.proximity_km,
            backoff: config.backoff_policy(),
            correction: config.correction_policy(),
        }
    }

    pub fn cadence(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::WeatherRefresh => self.weather_refresh,
            TaskKind::Optimize => self.optimize,
            TaskKind::EfficiencyCorrection => self.efficiency,
            TaskKind::PersistenceSync => self.persistence_sync,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

/// External collaborators the scheduler calls into.
#[derive(Clone)]
pub struct Dependencies {
    pub persistence: Arc<dyn Persistence>,
    pub optimizer: Arc<dyn Optimizer>,
    pub forecast: Arc<dyn ForecastProvider>,
    pub registry: Arc<DriverRegistry>,
}

pub struct FleetScheduler {
    fleet: Arc<Fleet>,
    deps: Dependencies,
    settings: SchedulerSettings,
    tasks: Vec<ScheduledTask>,
    commands: mpsc::Receiver<FleetCommand>,
    command_tx: mpsc::Sender<FleetCommand>,
    /// Pinned mapping from the tick clock onto wall time; `None` reads the
    /// system clock on every pass.
    origin: Option<(Instant, DateTime<Utc>)>,
}

impl FleetScheduler {
    pub fn new(fleet: Fleet, deps: Dependencies, settings: SchedulerSettings) -> Self {
        let tasks = TaskKind::ORDER
            .iter()
            .map(|kind| ScheduledTask::new(*kind, settings.cadence(*kind)))
            .collect();
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        Self {
            fleet: Arc::new(fleet),
            deps,
            settings,
            tasks,
            commands,
            command_tx,
            origin: None,
        }
    }

    /// Pins the wall-clock time that corresponds to `instant`, so that wall
    /// time follows the tick instants passed to [`run_due`](Self::run_due).
    pub fn set_clock_origin(&mut self, instant: Instant, wall: DateTime<Utc>) {
        self.origin = Some((instant, wall));
    }

    pub fn handle(&self) -> FleetHandle {
        FleetHandle::new(self.command_tx.clone())
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn task(&self, kind: TaskKind) -> Option<&ScheduledTask> {
        self.tasks.iter().find(|t| t.kind == kind)
    }

    fn wall_at(&self, now: Instant) -> DateTime<Utc> {
        let Some((instant, wall)) = self.origin else {
            return Utc::now();
        };
        let elapsed = chrono::Duration::from_std(now.saturating_duration_since(instant))
            .unwrap_or_else(|_| chrono::Duration::zero());
        wall + elapsed
    }

    /// Runs one tick at `now` and returns the task classes that ran.
    pub async fn run_due(&mut self, now: Instant) -> Vec<TaskKind> {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command).await;
        }

        self.supervise_drivers(now).await;

        let due: Vec<TaskKind> = self
            .tasks
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| t.kind)
            .collect();

        for kind in &due {
            let started = Instant::now();
            let wall = self.wall_at(now);
            let report = self.run_pass(*kind, now, wall).await;

            if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == *kind) {
                task.last_run = Some(now);
                task.runs += 1;
                task.last_failures = report.failed;
            }

            info!(
                task = %kind,
                clients = report.clients,
                failed = report.failed,
                skipped = report.skipped,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Pass complete"
            );
        }
        due
    }

    async fn run_pass(&self, kind: TaskKind, now: Instant, wall: DateTime<Utc>) -> PassReport {
        match kind {
            TaskKind::WeatherRefresh => self.weather_pass(wall).await,
            TaskKind::Optimize => self.optimize_pass(now, wall).await,
            TaskKind::EfficiencyCorrection => self.efficiency_pass().await,
            TaskKind::PersistenceSync => self.sync_pass().await,
        }
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped), then
    /// stops every driver. Shutdown is only observed between ticks.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            clients = self.fleet.len(),
            tick_ms = self.settings.tick.as_millis() as u64,
            "Starting fleet scheduler"
        );

        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.run_due(Instant::now()).await;
                }
            }
        }

        info!("Shutdown requested, stopping drivers");
        self.stop_all_drivers().await;
    }

    pub async fn stop_all_drivers(&self) {
        for id in self.fleet.ids() {
            if let Some(client) = self.fleet.get(id) {
                self.stop_driver(id, client.driver()).await;
            }
        }
    }

    async fn stop_driver(&self, id: ClientId, driver: Arc<dyn crate::driver::Driver>) {
        if tokio::time::timeout(self.settings.driver_timeout, driver.stop())
            .await
            .is_err()
        {
            warn!(client_id = %id, "Driver stop timed out");
        } else {
            debug!(client_id = %id, "Driver stopped");
        }
    }
}

/// Outcome counts of one pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PassReport {
    pub clients: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: Option<Outcome>) {
        self.clients += 1;
        match outcome {
            Some(Outcome::Done) => {}
            Some(Outcome::Skipped) => self.skipped += 1,
            None => self.failed += 1,
        }
    }
}

/// Per-client result of an action that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Done,
    Skipped,
}

/// Runs one per-client action. Errors and panics are logged with the client
/// id and turned into `None`; they never escape the pass.
pub(crate) async fn isolate<T, F>(client_id: ClientId, task: &str, action: F) -> Option<T>
where
    F: Future<Output = Result<T, OrchestratorError>>,
{
    match AssertUnwindSafe(action).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(client_id = %client_id, task = %task, error = %e, "Client action failed");
            None
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let e = OrchestratorError::Panicked(message);
            error!(client_id = %client_id, task = %task, error = %e, "Client action panicked");
            None
        }
    }
}
