//! In-memory persistence for tests and dry runs.

use super::{Persistence, Series, StoredClient};
use crate::client::{ClientConfig, ClientId};
use crate::error::PersistenceError;
use crate::telemetry::{Metric, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of upsert calls received, including repeats of the same key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub telemetry: usize,
    pub decisions: usize,
    pub forecasts: usize,
    pub configs: usize,
}

#[derive(Debug, Default)]
struct Data {
    clients: BTreeMap<ClientId, Value>,
    series: HashMap<(ClientId, Series), BTreeMap<DateTime<Utc>, f64>>,
    counts: UpsertCounts,
    next_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    data: Arc<RwLock<Data>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a client document under a fixed id, bypassing validation.
    pub async fn seed(&self, id: ClientId, config: Value) {
        let mut data = self.data.write().await;
        data.next_id = data.next_id.max(id.0);
        data.clients.insert(id, config);
    }

    /// While set, every operation fails with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn counts(&self) -> UpsertCounts {
        self.data.read().await.counts
    }

    pub async fn stored_config(&self, id: ClientId) -> Option<Value> {
        self.data.read().await.clients.get(&id).cloned()
    }

    fn check(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    async fn upsert(
        &self,
        client_id: ClientId,
        series: Series,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.check()?;
        let mut data = self.data.write().await;
        match series {
            Series::Telemetry(_) => data.counts.telemetry += 1,
            Series::Decision => data.counts.decisions += 1,
            Series::Forecast => data.counts.forecasts += 1,
        }
        data.series
            .entry((client_id, series))
            .or_default()
            .insert(timestamp, value);
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load_all_clients(&self) -> Result<Vec<StoredClient>, PersistenceError> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .clients
            .iter()
            .map(|(id, config)| StoredClient {
                id: *id,
                config: config.clone(),
            })
            .collect())
    }

    async fn upsert_telemetry(
        &self,
        client_id: ClientId,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.upsert(client_id, Series::Telemetry(metric), value, timestamp)
            .await
    }

    async fn upsert_decision(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.upsert(client_id, Series::Decision, value, timestamp).await
    }

    async fn upsert_forecast(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.upsert(client_id, Series::Forecast, value, timestamp).await
    }

    async fn update_client_config(
        &self,
        client_id: ClientId,
        config: &ClientConfig,
    ) -> Result<(), PersistenceError> {
        self.check()?;
        let value = serde_json::to_value(config)?;
        let mut data = self.data.write().await;
        match data.clients.get_mut(&client_id) {
            Some(slot) => *slot = value,
            None => return Err(PersistenceError::ClientNotFound(client_id)),
        }
        data.counts.configs += 1;
        Ok(())
    }

    async fn insert_client(&self, config: &ClientConfig) -> Result<ClientId, PersistenceError> {
        self.check()?;
        let value = serde_json::to_value(config)?;
        let mut data = self.data.write().await;
        data.next_id += 1;
        let id = ClientId(data.next_id);
        data.clients.insert(id, value);
        Ok(id)
    }

    async fn delete_client(&self, client_id: ClientId) -> Result<(), PersistenceError> {
        self.check()?;
        let mut data = self.data.write().await;
        if data.clients.remove(&client_id).is_none() {
            return Err(PersistenceError::ClientNotFound(client_id));
        }
        data.series.retain(|(id, _), _| *id != client_id);
        Ok(())
    }

    async fn history(
        &self,
        client_id: ClientId,
        series: Series,
        limit: usize,
    ) -> Result<Vec<Reading>, PersistenceError> {
        self.check()?;
        let data = self.data.read().await;
        Ok(data
            .series
            .get(&(client_id, series))
            .map(|points| {
                points
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|(ts, value)| Reading::new(*value, *ts))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_counts_every_call_but_keys_by_timestamp() {
        let store = MemoryPersistence::new();
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.upsert_decision(ClientId(1), 0.2, ts).await.unwrap();
        store.upsert_decision(ClientId(1), 0.4, ts).await.unwrap();

        assert_eq!(store.counts().await.decisions, 2);
        let history = store.history(ClientId(1), Series::Decision, 10).await.unwrap();
        assert_eq!(history, vec![Reading::new(0.4, ts)]);
    }

    #[tokio::test]
    async fn test_failing_store() {
        let store = MemoryPersistence::new();
        store.set_failing(true);
        assert!(matches!(
            store.load_all_clients().await,
            Err(PersistenceError::Backend(_))
        ));
        store.set_failing(false);
        assert!(store.load_all_clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_seeded_ids_not_reused() {
        let store = MemoryPersistence::new();
        store.seed(ClientId(5), serde_json::json!({})).await;
        let config =
            ClientConfig::from_value(crate::client::tests::leader_json()).unwrap();
        let id = store.insert_client(&config).await.unwrap();
        assert_eq!(id, ClientId(6));
    }
}
