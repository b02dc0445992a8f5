//! Fleet: every managed client, keyed by id.

use crate::client::{Client, ClientConfig, ClientId, Position};
use crate::driver::DriverRegistry;
use crate::error::{ConfigurationError, PersistenceError};
use crate::forecast;
use crate::persistence::Persistence;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Clients that could not be loaded, with the reason.
pub type Rejected = Vec<(ClientId, ConfigurationError)>;

/// Concurrent client table. Sharded, so lookups never serialize the fleet.
#[derive(Default)]
pub struct Fleet {
    clients: DashMap<ClientId, Arc<Client>>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every stored client. Rows with an invalid config or an unknown
    /// driver are skipped and reported; only a storage failure is an error.
    pub async fn load(
        persistence: &dyn Persistence,
        registry: &DriverRegistry,
    ) -> Result<(Self, Rejected), PersistenceError> {
        let stored = persistence.load_all_clients().await?;
        let fleet = Self::new();
        let mut rejected = Vec::new();

        for row in stored {
            let built = ClientConfig::from_value(row.config)
                .and_then(|config| build_client(row.id, config, registry));
            match built.and_then(|client| fleet.insert(Arc::new(client))) {
                Ok(()) => {}
                Err(e) => {
                    warn!(client_id = %row.id, error = %e, "Skipping client with invalid configuration");
                    rejected.push((row.id, e));
                }
            }
        }

        info!(
            clients = fleet.len(),
            rejected = rejected.len(),
            "Fleet loaded"
        );
        Ok((fleet, rejected))
    }

    /// Adds a client; an id can only be bound once.
    pub fn insert(&self, client: Arc<Client>) -> Result<(), ConfigurationError> {
        match self.clients.entry(client.id()) {
            Entry::Occupied(_) => Err(ConfigurationError::DuplicateClient(client.id())),
            Entry::Vacant(slot) => {
                slot.insert(client);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.remove(&id).map(|(_, client)| client)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Sorted snapshot of client ids.
    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.clients.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// `weather_ref` of every client, for leader resolution.
    pub fn weather_refs(&self) -> BTreeMap<ClientId, Option<ClientId>> {
        self.clients
            .iter()
            .map(|entry| (*entry.key(), entry.value().config().weather.weather_ref))
            .collect()
    }

    /// Position of every client that has one.
    pub fn positions(&self) -> BTreeMap<ClientId, Position> {
        self.clients
            .iter()
            .filter_map(|entry| {
                let position = entry.value().config().weather.position.clone()?;
                Some((*entry.key(), position))
            })
            .collect()
    }

    pub fn resolve_leader(&self, id: ClientId) -> Result<ClientId, ConfigurationError> {
        forecast::resolve_leader(id, self.len(), |candidate| {
            self.get(candidate)
                .map(|client| client.config().weather.weather_ref)
        })
    }
}

/// Builds a client and its driver from a validated config.
pub fn build_client(
    id: ClientId,
    config: ClientConfig,
    registry: &DriverRegistry,
) -> Result<Client, ConfigurationError> {
    let driver = registry.build(&config.driver)?;
    Client::new(id, config, driver)
}
