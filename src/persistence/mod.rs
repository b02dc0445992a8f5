//! Persistence Bridge: durable storage contract.
//!
//! Stores never own live clients, only serialized snapshots. Every upsert is
//! keyed by `(client, series, timestamp)` so re-sending the same snapshot is
//! harmless.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;

use crate::client::{ClientConfig, ClientId};
use crate::error::PersistenceError;
use crate::telemetry::{Metric, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

/// A client row as stored: id plus the raw configuration document.
///
/// The document is validated when the fleet is built, not here, so one bad
/// row never prevents the others from loading. Rows that are not JSON at all
/// are logged and skipped by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredClient {
    pub id: ClientId,
    pub config: Value,
}

/// Time series kept per client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Series {
    Telemetry(Metric),
    Decision,
    Forecast,
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Series::Telemetry(metric) => write!(f, "{}", metric),
            Series::Decision => f.write_str("decision"),
            Series::Forecast => f.write_str("forecast"),
        }
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load_all_clients(&self) -> Result<Vec<StoredClient>, PersistenceError>;

    async fn upsert_telemetry(
        &self,
        client_id: ClientId,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn upsert_decision(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn upsert_forecast(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    async fn update_client_config(
        &self,
        client_id: ClientId,
        config: &ClientConfig,
    ) -> Result<(), PersistenceError>;

    /// Stores a new client and returns its allocated id.
    async fn insert_client(&self, config: &ClientConfig) -> Result<ClientId, PersistenceError>;

    /// Removes a client and all of its series.
    async fn delete_client(&self, client_id: ClientId) -> Result<(), PersistenceError>;

    /// Most recent points of one series, newest first.
    async fn history(
        &self,
        client_id: ClientId,
        series: Series,
        limit: usize,
    ) -> Result<Vec<Reading>, PersistenceError>;
}
