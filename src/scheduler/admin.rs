//! Administrative commands applied by the scheduler between passes.

use super::FleetScheduler;
use crate::client::{Client, ClientConfig, ClientId};
use crate::driver::{DriverRegistry, DriverState};
use crate::error::{ConfigurationError, OrchestratorError, PersistenceError};
use crate::forecast;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::info;

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

pub enum FleetCommand {
    Create {
        config: Value,
        reply: Reply<ClientId>,
    },
    Remove {
        id: ClientId,
        reply: Reply<()>,
    },
    Reconfigure {
        id: ClientId,
        config: Value,
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<Vec<ClientStatus>>,
    },
}

/// Health of one client as reported to operators.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientStatus {
    pub id: ClientId,
    pub driver_type: String,
    pub driver_state: DriverState,
    pub consecutive_failures: u32,
    pub next_retry_in_secs: Option<u64>,
    pub decision_failures: u64,
    pub last_error: Option<String>,
    pub has_forecast: bool,
    pub forecast_stale: bool,
    pub ready: bool,
}

/// Cloneable entry point for the administrative layer.
#[derive(Clone)]
pub struct FleetHandle {
    tx: mpsc::Sender<FleetCommand>,
}

impl FleetHandle {
    pub(super) fn new(tx: mpsc::Sender<FleetCommand>) -> Self {
        Self { tx }
    }

    /// Validates, stores and binds a new client. Returns the allocated id.
    pub async fn create(&self, config: Value) -> Result<ClientId, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Create { config, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::SchedulerStopped)?
    }

    pub async fn remove(&self, id: ClientId) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Remove { id, reply }).await?;
        rx.await.map_err(|_| OrchestratorError::SchedulerStopped)?
    }

    /// Replaces a client's whole configuration. A changed driver section
    /// stops the old driver and binds a new one.
    pub async fn reconfigure(&self, id: ClientId, config: Value) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Reconfigure { id, config, reply })
            .await?;
        rx.await.map_err(|_| OrchestratorError::SchedulerStopped)?
    }

    pub async fn status(&self) -> Result<Vec<ClientStatus>, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.send(FleetCommand::Status { reply }).await?;
        rx.await.map_err(|_| OrchestratorError::SchedulerStopped)
    }

    async fn send(&self, command: FleetCommand) -> Result<(), OrchestratorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| OrchestratorError::SchedulerStopped)
    }
}

impl FleetScheduler {
    pub(super) async fn handle_command(&self, command: FleetCommand) {
        // A dropped receiver only means the caller stopped waiting.
        match command {
            FleetCommand::Create { config, reply } => {
                let _ = reply.send(self.create_client(config).await);
            }
            FleetCommand::Remove { id, reply } => {
                let _ = reply.send(self.remove_client(id).await);
            }
            FleetCommand::Reconfigure { id, config, reply } => {
                let _ = reply.send(self.reconfigure_client(id, config).await);
            }
            FleetCommand::Status { reply } => {
                let _ = reply.send(self.status(Instant::now()));
            }
        }
    }

    async fn create_client(&self, config: Value) -> Result<ClientId, OrchestratorError> {
        let mut config = ClientConfig::from_value(config)?;
        let driver = self.deps.registry.build(&config.driver)?;
        config.driver = DriverRegistry::describe(driver.as_ref());

        let after = self.settings.persistence_timeout;
        let store = &self.deps.persistence;
        let id = timeout(after, store.insert_client(&config))
            .await
            .map_err(|_| PersistenceError::Timeout(after))??;

        let bound = Client::new(id, config, driver).and_then(|client| {
            if let Some(target) = client.config().weather.weather_ref {
                if !self.fleet.contains(target) {
                    return Err(ConfigurationError::DanglingWeatherRef { from: id, to: target });
                }
                self.fleet.resolve_leader(target)?;
            }
            Ok(client)
        });
        let client = match bound.and_then(|client| {
            let client = Arc::new(client);
            self.fleet.insert(Arc::clone(&client)).map(|()| client)
        }) {
            Ok(client) => client,
            Err(e) => {
                let _ = timeout(after, store.delete_client(id)).await;
                return Err(e.into());
            }
        };

        info!(
            client_id = %id,
            driver = %client.driver().type_id(),
            "Client created"
        );
        Ok(id)
    }

    async fn remove_client(&self, id: ClientId) -> Result<(), OrchestratorError> {
        if !self.fleet.contains(id) {
            return Err(OrchestratorError::UnknownClient(id));
        }
        let after = self.settings.persistence_timeout;
        timeout(after, self.deps.persistence.delete_client(id))
            .await
            .map_err(|_| PersistenceError::Timeout(after))??;

        if let Some(client) = self.fleet.remove(id) {
            self.stop_driver(id, client.driver()).await;
            client.health().state = DriverState::Stopped;
        }
        info!(client_id = %id, "Client removed");
        Ok(())
    }

    async fn reconfigure_client(&self, id: ClientId, config: Value) -> Result<(), OrchestratorError> {
        let client = self
            .fleet
            .get(id)
            .ok_or(OrchestratorError::UnknownClient(id))?;
        let mut candidate = ClientConfig::from_value(config)?;
        candidate.validate_for(id)?;

        let mut refs = self.fleet.weather_refs();
        refs.insert(id, candidate.weather.weather_ref);
        forecast::resolve_leader(id, refs.len(), |c| refs.get(&c).copied())?;

        let driver = self.deps.registry.build(&candidate.driver)?;
        candidate.driver = DriverRegistry::describe(driver.as_ref());
        let rebinding = candidate.driver != client.config().driver;

        let after = self.settings.persistence_timeout;
        timeout(
            after,
            self.deps.persistence.update_client_config(id, &candidate),
        )
        .await
        .map_err(|_| PersistenceError::Timeout(after))??;

        if rebinding {
            self.stop_driver(id, client.driver()).await;
            client.rebind(candidate, driver)?;
            info!(
                client_id = %id,
                driver = %client.driver().type_id(),
                "Client reconfigured, driver rebound"
            );
        } else {
            client.replace_config(candidate)?;
            info!(client_id = %id, "Client reconfigured");
        }
        Ok(())
    }

    pub(super) fn status(&self, now: Instant) -> Vec<ClientStatus> {
        self.fleet
            .ids()
            .into_iter()
            .filter_map(|id| self.fleet.get(id))
            .map(|client| {
                let health = client.health().clone();
                let (has_forecast, forecast_stale) = {
                    let forecast = client.forecast();
                    (forecast.curve.is_some(), forecast.stale)
                };
                ClientStatus {
                    id: client.id(),
                    driver_type: client.driver().type_id().to_string(),
                    driver_state: health.state,
                    consecutive_failures: health.consecutive_failures,
                    next_retry_in_secs: health
                        .next_retry
                        .map(|at| at.saturating_duration_since(now).as_secs()),
                    decision_failures: health.decision_failures,
                    last_error: health.last_error,
                    has_forecast,
                    forecast_stale,
                    ready: client.is_ready(),
                }
            })
            .collect()
    }
}
