//! SQLite-backed persistence.
//!
//! # Schema
//! ```sql
//! CREATE TABLE clients (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     driver_type TEXT NOT NULL,
//!     config TEXT NOT NULL,           -- JSON document
//!     created_at TEXT NOT NULL,       -- RFC 3339
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE telemetry (client_id, metric, timestamp, value, PRIMARY KEY (client_id, metric, timestamp));
//! CREATE TABLE decisions (client_id, timestamp, value, PRIMARY KEY (client_id, timestamp));
//! CREATE TABLE forecasts (client_id, timestamp, value, PRIMARY KEY (client_id, timestamp));
//! ```
//! Timestamps in series tables are epoch milliseconds.
//!
//! rusqlite is blocking; every call runs on the blocking pool.

use super::{Persistence, Series, StoredClient};
use crate::client::{ClientConfig, ClientId};
use crate::error::PersistenceError;
use crate::telemetry::{Metric, Reading};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS clients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        driver_type TEXT NOT NULL,
        config TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS telemetry (
        client_id INTEGER NOT NULL,
        metric TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (client_id, metric, timestamp)
    );
    CREATE TABLE IF NOT EXISTS decisions (
        client_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (client_id, timestamp)
    );
    CREATE TABLE IF NOT EXISTS forecasts (
        client_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        value REAL NOT NULL,
        PRIMARY KEY (client_id, timestamp)
    );
"#;

#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    /// Creates or opens a database file, creating parent directories as needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&guard)
        })
        .await
        .map_err(|e| PersistenceError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn upsert_point(
    conn: &Connection,
    table: &'static str,
    client_id: ClientId,
    value: f64,
    timestamp: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    let sql = format!(
        "INSERT INTO {} (client_id, timestamp, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(client_id, timestamp) DO UPDATE SET value = excluded.value",
        table
    );
    conn.execute(&sql, params![client_id.0, timestamp.timestamp_millis(), value])?;
    Ok(())
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn load_all_clients(&self) -> Result<Vec<StoredClient>, PersistenceError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, config FROM clients ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut clients = Vec::new();
            for row in rows {
                let (id, raw) = row?;
                match serde_json::from_str(&raw) {
                    Ok(config) => clients.push(StoredClient {
                        id: ClientId(id),
                        config,
                    }),
                    Err(e) => {
                        warn!(client_id = id, error = %e, "Skipping client with unreadable config")
                    }
                }
            }
            Ok(clients)
        })
        .await
    }

    async fn upsert_telemetry(
        &self,
        client_id: ClientId,
        metric: Metric,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO telemetry (client_id, metric, timestamp, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id, metric, timestamp) DO UPDATE SET value = excluded.value",
                params![client_id.0, metric.as_str(), timestamp.timestamp_millis(), value],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_decision(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.with_conn(move |conn| upsert_point(conn, "decisions", client_id, value, timestamp))
            .await
    }

    async fn upsert_forecast(
        &self,
        client_id: ClientId,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        self.with_conn(move |conn| upsert_point(conn, "forecasts", client_id, value, timestamp))
            .await
    }

    async fn update_client_config(
        &self,
        client_id: ClientId,
        config: &ClientConfig,
    ) -> Result<(), PersistenceError> {
        let raw = serde_json::to_string(config)?;
        let driver_type = config.driver.type_id.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE clients SET driver_type = ?1, config = ?2, updated_at = ?3 WHERE id = ?4",
                params![driver_type, raw, Utc::now().to_rfc3339(), client_id.0],
            )?;
            if updated == 0 {
                return Err(PersistenceError::ClientNotFound(client_id));
            }
            Ok(())
        })
        .await
    }

    async fn insert_client(&self, config: &ClientConfig) -> Result<ClientId, PersistenceError> {
        let raw = serde_json::to_string(config)?;
        let driver_type = config.driver.type_id.clone();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO clients (driver_type, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![driver_type, raw, now],
            )?;
            Ok(ClientId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn delete_client(&self, client_id: ClientId) -> Result<(), PersistenceError> {
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM clients WHERE id = ?1",
                    params![client_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(PersistenceError::ClientNotFound(client_id));
            }
            for table in ["telemetry", "decisions", "forecasts"] {
                conn.execute(
                    &format!("DELETE FROM {} WHERE client_id = ?1", table),
                    params![client_id.0],
                )?;
            }
            conn.execute("DELETE FROM clients WHERE id = ?1", params![client_id.0])?;
            Ok(())
        })
        .await
    }

    async fn history(
        &self,
        client_id: ClientId,
        series: Series,
        limit: usize,
    ) -> Result<Vec<Reading>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Reading> {
                Ok(Reading::new(row.get(1)?, from_millis(row.get(0)?)))
            };
            let readings = match series {
                Series::Telemetry(metric) => {
                    let mut stmt = conn.prepare(
                        "SELECT timestamp, value FROM telemetry
                         WHERE client_id = ?1 AND metric = ?2
                         ORDER BY timestamp DESC LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![client_id.0, metric.as_str(), limit], map_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                Series::Decision | Series::Forecast => {
                    let table = if series == Series::Decision {
                        "decisions"
                    } else {
                        "forecasts"
                    };
                    let mut stmt = conn.prepare(&format!(
                        "SELECT timestamp, value FROM {}
                         WHERE client_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
                        table
                    ))?;
                    let rows = stmt.query_map(params![client_id.0, limit], map_row)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(readings)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::leader_json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn config() -> ClientConfig {
        ClientConfig::from_value(leader_json()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = SqlitePersistence::in_memory().unwrap();
        let a = store.insert_client(&config()).await.unwrap();
        let b = store.insert_client(&config()).await.unwrap();
        assert!(b > a);

        let clients = store.load_all_clients().await.unwrap();
        assert_eq!(clients.len(), 2);
        assert_eq!(clients[0].id, a);
        assert_eq!(
            ClientConfig::from_value(clients[0].config.clone()).unwrap(),
            config()
        );
    }

    #[tokio::test]
    async fn test_corrupt_row_does_not_hide_others() {
        let store = SqlitePersistence::in_memory().unwrap();
        let a = store.insert_client(&config()).await.unwrap();
        let b = store.insert_client(&config()).await.unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE clients SET config = '{truncated' WHERE id = ?1", params![b.0])
            .unwrap();

        let clients = store.load_all_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, a);
    }

    #[tokio::test]
    async fn test_upserts_idempotent_by_timestamp() {
        let store = SqlitePersistence::in_memory().unwrap();
        let id = store.insert_client(&config()).await.unwrap();

        for _ in 0..3 {
            store.upsert_decision(id, 0.5, at(0)).await.unwrap();
        }
        store.upsert_decision(id, 0.7, at(0)).await.unwrap();
        store.upsert_decision(id, 1.0, at(60)).await.unwrap();

        let history = store.history(id, Series::Decision, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], Reading::new(1.0, at(60)));
        assert_eq!(history[1], Reading::new(0.7, at(0)));
    }

    #[tokio::test]
    async fn test_telemetry_series_are_separate() {
        let store = SqlitePersistence::in_memory().unwrap();
        let id = store.insert_client(&config()).await.unwrap();

        store
            .upsert_telemetry(id, Metric::Temperature, 52.0, at(0))
            .await
            .unwrap();
        store
            .upsert_telemetry(id, Metric::Production, 900.0, at(0))
            .await
            .unwrap();
        store.upsert_forecast(id, 1100.0, at(0)).await.unwrap();

        let temps = store
            .history(id, Series::Telemetry(Metric::Temperature), 5)
            .await
            .unwrap();
        assert_eq!(temps, vec![Reading::new(52.0, at(0))]);
        let forecasts = store.history(id, Series::Forecast, 5).await.unwrap();
        assert_eq!(forecasts, vec![Reading::new(1100.0, at(0))]);
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_client() {
        let store = SqlitePersistence::in_memory().unwrap();
        assert!(matches!(
            store.update_client_config(ClientId(42), &config()).await,
            Err(PersistenceError::ClientNotFound(ClientId(42)))
        ));
        assert!(matches!(
            store.delete_client(ClientId(42)).await,
            Err(PersistenceError::ClientNotFound(ClientId(42)))
        ));
    }

    #[tokio::test]
    async fn test_update_config_persists() {
        let store = SqlitePersistence::in_memory().unwrap();
        let id = store.insert_client(&config()).await.unwrap();

        let mut updated = config();
        if let Some(installation) = updated.weather.installation.as_mut() {
            installation.global_yield = 0.8;
        }
        store.update_client_config(id, &updated).await.unwrap();

        let clients = store.load_all_clients().await.unwrap();
        assert_eq!(clients[0].config["weather"]["installation"]["global_yield"], 0.8);

        store.delete_client(id).await.unwrap();
        assert!(store.load_all_clients().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("optimasol.db");
        {
            let store = SqlitePersistence::open(&path).unwrap();
            store.insert_client(&config()).await.unwrap();
        }
        let store = SqlitePersistence::open(&path).unwrap();
        assert_eq!(store.load_all_clients().await.unwrap().len(), 1);
    }
}
