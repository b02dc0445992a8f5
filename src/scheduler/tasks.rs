//! Per-pass and per-client actions.

use super::{isolate, FleetScheduler, Outcome, PassReport};
use crate::client::{Client, ClientId};
use crate::efficiency::{compute_correction, Correction};
use crate::error::{DriverError, ExternalDependencyError, OrchestratorError, PersistenceError};
use crate::forecast::{group_nearby, plan_forecasts, ForecastCurve, ForecastWindow};
use crate::optimizer::OptimizationRequest;
use crate::telemetry::{Metric, Reading};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Consecutive failed decisions after which a started driver is restarted.
const MAX_DECISION_STREAK: u32 = 3;

async fn persist<F>(after: Duration, call: F) -> Result<(), PersistenceError>
where
    F: std::future::Future<Output = Result<(), PersistenceError>>,
{
    timeout(after, call)
        .await
        .map_err(|_| PersistenceError::Timeout(after))?
}

impl FleetScheduler {
    /// Starts drivers that are pending or whose backoff has elapsed.
    pub(super) async fn supervise_drivers(&self, now: Instant) {
        for id in self.fleet.ids() {
            let Some(client) = self.fleet.get(id) else {
                continue;
            };
            if !client.health().start_due(now) {
                continue;
            }

            let driver = client.driver();
            let attempt = AssertUnwindSafe(driver.start(client.sink())).catch_unwind();
            let result = match timeout(self.settings.driver_timeout, attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(DriverError::Connection(
                    "driver panicked during start".to_string(),
                )),
                Err(_) => Err(DriverError::Timeout(self.settings.driver_timeout)),
            };

            let mut health = client.health();
            match result {
                Ok(()) => {
                    health.record_started();
                    info!(client_id = %id, driver = %driver.type_id(), "Driver started");
                }
                Err(e) => {
                    let delay = health.record_start_failure(
                        &e.to_string(),
                        now,
                        &self.settings.backoff,
                    );
                    warn!(
                        client_id = %id,
                        driver = %driver.type_id(),
                        attempt = health.consecutive_failures,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Driver start failed, client degraded"
                    );
                }
            }
        }
    }

    /// Weather Refresh: one provider call per leader, curve shared with followers.
    pub(super) async fn weather_pass(&self, wall: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        let plan = group_nearby(
            plan_forecasts(&self.fleet.weather_refs()),
            &self.fleet.positions(),
            self.settings.proximity_km,
        );

        for (id, e) in &plan.unresolved {
            if let Some(client) = self.fleet.get(*id) {
                client.forecast().mark_stale(&e.to_string());
            }
            warn!(client_id = %id, error = %e, "Forecast source unresolved");
            report.clients += 1;
            report.failed += 1;
        }

        for (leader, followers) in &plan.leaders {
            let outcome = isolate(*leader, "weather_refresh", async {
                self.refresh_leader(*leader, followers, wall).await
            })
            .await;
            report.record(outcome);
        }

        for id in self.fleet.ids() {
            if let Some(client) = self.fleet.get(id) {
                let point = client.forecast().current_point(wall);
                client
                    .telemetry()
                    .set_forecast(point.map(|p| Reading::new(p.production, p.timestamp)));
            }
        }
        report
    }

    async fn refresh_leader(
        &self,
        leader: ClientId,
        followers: &[ClientId],
        wall: DateTime<Utc>,
    ) -> Result<Outcome, OrchestratorError> {
        let client = self
            .fleet
            .get(leader)
            .ok_or(OrchestratorError::UnknownClient(leader))?;
        let config = client.config();
        let (Some(position), Some(installation)) = (
            config.weather.position.as_ref(),
            config.weather.installation.as_ref(),
        ) else {
            return Ok(Outcome::Skipped);
        };

        let window = ForecastWindow::starting_at(wall, self.settings.horizon_hours);
        let after = self.settings.forecast_timeout;
        let fetched = match timeout(after, self.deps.forecast.fetch(position, installation, window))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ExternalDependencyError::Timeout {
                dependency: "forecast provider",
                after,
            }),
        };

        let members = std::iter::once(leader).chain(followers.iter().copied());
        match fetched {
            Ok(curve) => {
                let curve: Arc<ForecastCurve> = Arc::new(curve);
                for id in members {
                    if let Some(member) = self.fleet.get(id) {
                        member.forecast().install(Arc::clone(&curve), leader, wall);
                    }
                }
                debug!(
                    client_id = %leader,
                    followers = followers.len(),
                    points = curve.len(),
                    "Forecast refreshed"
                );
                Ok(Outcome::Done)
            }
            Err(e) => {
                let reason = e.to_string();
                for id in members {
                    if let Some(member) = self.fleet.get(id) {
                        member.forecast().mark_stale(&reason);
                    }
                }
                Err(e.into())
            }
        }
    }

    pub(super) async fn optimize_pass(&self, now: Instant, wall: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();
        for id in self.fleet.ids() {
            let Some(client) = self.fleet.get(id) else {
                continue;
            };
            let outcome = isolate(id, "optimize", self.optimize_client(&client, now, wall)).await;
            report.record(outcome);
        }
        report
    }

    async fn optimize_client(
        &self,
        client: &Client,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<Outcome, OrchestratorError> {
        let id = client.id();
        if !client.health().state.eq(&crate::driver::DriverState::Started) {
            debug!(client_id = %id, "Driver not started, skipping optimization");
            return Ok(Outcome::Skipped);
        }
        if !client.is_ready() {
            debug!(client_id = %id, "Client not ready, skipping optimization");
            return Ok(Outcome::Skipped);
        }

        let Some(curve) = client.forecast().curve.clone() else {
            return Ok(Outcome::Skipped);
        };
        let point = curve.nearest(wall);
        client
            .telemetry()
            .set_forecast(point.map(|p| Reading::new(p.production, p.timestamp)));

        let config = client.config();
        let telemetry = client.telemetry().snapshot();
        if config.weather.auto_correction {
            if let (Some(measured), Some(point)) = (telemetry.production, point) {
                client.efficiency().sample(measured, point.production);
            }
        }

        let request = OptimizationRequest {
            client_id: id,
            config,
            telemetry,
            forecast: curve,
            now: wall,
            horizon_hours: self.settings.horizon_hours,
            step_minutes: self.settings.step_minutes,
        };

        let after = self.settings.optimizer_timeout;
        let decision = timeout(after, self.deps.optimizer.decide(&request))
            .await
            .map_err(|_| ExternalDependencyError::Timeout {
                dependency: "optimizer",
                after,
            })??;
        if !(0.0..=1.0).contains(&decision) {
            return Err(ExternalDependencyError::Optimization(format!(
                "decision {} outside [0, 1]",
                decision
            ))
            .into());
        }

        let driver = client.driver();
        let after = self.settings.driver_timeout;
        let applied = match timeout(after, driver.apply_decision(decision)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(after)),
        };
        if let Err(e) = applied {
            let streak = client.health().record_decision_failure(&e.to_string());
            if matches!(e, DriverError::NotConnected) || streak >= MAX_DECISION_STREAK {
                self.stop_driver(id, Arc::clone(&driver)).await;
                let mut health = client.health();
                let delay =
                    health.record_connection_lost(&e.to_string(), now, &self.settings.backoff);
                warn!(
                    client_id = %id,
                    driver = %driver.type_id(),
                    failed_decisions = streak,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "Driver lost, client degraded"
                );
            }
            return Err(e.into());
        }
        client.health().record_decision_applied();

        client
            .telemetry()
            .record_decision(Reading::new(decision, wall));
        debug!(client_id = %id, decision, "Decision applied");
        Ok(Outcome::Done)
    }

    pub(super) async fn efficiency_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        for id in self.fleet.ids() {
            let Some(client) = self.fleet.get(id) else {
                continue;
            };
            let outcome = isolate(id, "efficiency_correction", self.correct_client(&client)).await;
            report.record(outcome);
        }
        report
    }

    async fn correct_client(&self, client: &Client) -> Result<Outcome, OrchestratorError> {
        let id = client.id();
        let config = client.config();
        let current = match (&config.weather.installation, config.weather.auto_correction) {
            (Some(installation), true) => installation.global_yield,
            _ => return Ok(Outcome::Skipped),
        };

        let window = client.efficiency().clone();
        let correction = compute_correction(current, &window, &self.settings.correction);
        let (previous, updated) = match correction {
            Correction::Skipped(reason) => {
                client.efficiency().reset();
                debug!(client_id = %id, reason = ?reason, "Efficiency correction skipped");
                return Ok(Outcome::Skipped);
            }
            Correction::Applied {
                raw_ratio,
                ratio,
                previous,
                updated,
            } => {
                info!(
                    client_id = %id,
                    samples = window.samples,
                    raw_ratio,
                    ratio,
                    previous,
                    updated,
                    "Global yield corrected"
                );
                (previous, updated)
            }
        };

        let mut next = (*config).clone();
        if let Some(installation) = next.weather.installation.as_mut() {
            installation.global_yield = updated;
        }
        // On rejection the samples stay for the next cycle.
        client.replace_config(next)?;
        client.efficiency().reset();
        if config.weather.is_leader() {
            self.rescale_forecasts(id, updated / previous);
        }

        let stored = client.config();
        let result = persist(
            self.settings.persistence_timeout,
            self.deps.persistence.update_client_config(id, &stored),
        )
        .await;
        if let Err(e) = result {
            client.mark_config_dirty();
            return Err(e.into());
        }
        Ok(Outcome::Done)
    }

    /// Applies a yield change to the curve `leader` fetched, for the leader
    /// and every follower sharing it. The next refresh replaces it.
    fn rescale_forecasts(&self, leader: ClientId, factor: f64) {
        let current = match self.fleet.get(leader) {
            Some(client) => {
                let forecast = client.forecast();
                match (&forecast.curve, forecast.source) {
                    (Some(curve), Some(source)) if source == leader => Arc::clone(curve),
                    _ => return,
                }
            }
            None => return,
        };
        let scaled = Arc::new(current.scaled(factor));

        for id in self.fleet.ids() {
            let Some(member) = self.fleet.get(id) else {
                continue;
            };
            let mut forecast = member.forecast();
            if forecast
                .curve
                .as_ref()
                .map_or(false, |curve| Arc::ptr_eq(curve, &current))
            {
                forecast.curve = Some(Arc::clone(&scaled));
            }
        }
        debug!(client_id = %leader, factor, "Forecast rescaled to corrected yield");
    }

    pub(super) async fn sync_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        for id in self.fleet.ids() {
            let Some(client) = self.fleet.get(id) else {
                continue;
            };
            let outcome = isolate(id, "persistence_sync", self.sync_client(&client)).await;
            report.record(outcome);
        }
        report
    }

    /// Re-sends the latest snapshot; upserts are keyed by timestamp.
    async fn sync_client(&self, client: &Client) -> Result<Outcome, OrchestratorError> {
        let id = client.id();
        let after = self.settings.persistence_timeout;
        let store = &self.deps.persistence;
        let snapshot = client.telemetry().snapshot();

        for metric in Metric::ALL {
            if let Some(reading) = snapshot.get(metric) {
                persist(
                    after,
                    store.upsert_telemetry(id, metric, reading.value, reading.timestamp),
                )
                .await?;
            }
        }
        if let Some(decision) = snapshot.decision {
            persist(
                after,
                store.upsert_decision(id, decision.value, decision.timestamp),
            )
            .await?;
        }
        if let Some(forecast) = snapshot.forecast {
            persist(
                after,
                store.upsert_forecast(id, forecast.value, forecast.timestamp),
            )
            .await?;
        }

        if client.take_config_dirty() {
            let config = client.config();
            if let Err(e) = persist(after, store.update_client_config(id, &config)).await {
                client.mark_config_dirty();
                return Err(e.into());
            }
        }
        Ok(Outcome::Done)
    }
}
