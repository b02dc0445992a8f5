//! Line-oriented meter on a character device or FIFO.
//!
//! Each line holds `KEY=value` pairs separated by spaces, commas or
//! semicolons: `TEMP=51.2 PROD=1420 POUT=900 TS=1718960400`. `TS` (epoch
//! seconds) is optional; without it the reading is stamped on receipt.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use optimasol::driver::{Driver, DriverDescriptor, DriverFactory, FormField};
use optimasol::telemetry::{Metric, TelemetrySink};
use optimasol::{ConfigurationError, DriverError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const TYPE_ID: &str = "serial_meter";

const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialMeterConfig {
    pub device: PathBuf,
    /// Receives the last decision as a percentage line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_file: Option<PathBuf>,
}

pub struct SerialMeterDriver {
    config: SerialMeterConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialMeterDriver {
    pub fn new(config: SerialMeterConfig) -> Self {
        Self {
            config,
            reader: Mutex::new(None),
        }
    }

    fn is_running(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }
}

#[async_trait]
impl Driver for SerialMeterDriver {
    fn type_id(&self) -> &str {
        TYPE_ID
    }

    async fn start(&self, sink: TelemetrySink) -> Result<(), DriverError> {
        if self.is_running() {
            return Ok(());
        }
        let file = tokio::fs::File::open(&self.config.device)
            .await
            .map_err(|e| {
                DriverError::Connection(format!("{}: {}", self.config.device.display(), e))
            })?;

        let device = self.config.device.display().to_string();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = parse_line(&line);
                        let at = line.timestamp.unwrap_or_else(Utc::now);
                        for (metric, value) in line.readings {
                            sink.on_reading(metric, value, at);
                        }
                    }
                    // EOF: the writer went away or nothing new yet
                    Ok(None) => tokio::time::sleep(IDLE_POLL).await,
                    Err(e) => {
                        warn!(device = %device, error = %e, "Meter read failed");
                        break;
                    }
                }
            }
        });

        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn apply_decision(&self, value: f64) -> Result<(), DriverError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(DriverError::DecisionOutOfRange(value));
        }
        if !self.is_running() {
            return Err(DriverError::NotConnected);
        }
        let Some(path) = &self.config.decision_file else {
            debug!(device = %self.config.device.display(), decision = value, "No decision output configured");
            return Ok(());
        };
        let line = format!("{:.0}\n", value * 100.0);
        tokio::fs::write(path, line)
            .await
            .map_err(|e| DriverError::Send(format!("{}: {}", path.display(), e)))
    }

    async fn stop(&self) {
        let task = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    fn serialize_config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct MeterLine {
    pub readings: Vec<(Metric, f64)>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Parses one meter line. Unknown keys and unparsable values are skipped.
pub fn parse_line(raw: &str) -> MeterLine {
    let mut line = MeterLine::default();
    for token in raw.split(|c: char| c.is_whitespace() || c == ',' || c == ';') {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let metric = match key.trim().to_ascii_uppercase().as_str() {
            "TEMP" => Metric::Temperature,
            "PROD" => Metric::Production,
            "POUT" => Metric::Power,
            "TS" => {
                line.timestamp = value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                continue;
            }
            _ => continue,
        };
        if let Ok(value) = value.trim().parse::<f64>() {
            line.readings.push((metric, value));
        }
    }
    line
}

#[derive(Default)]
pub struct SerialMeterFactory;

impl DriverFactory for SerialMeterFactory {
    fn descriptor(&self) -> DriverDescriptor {
        DriverDescriptor {
            id: TYPE_ID.to_string(),
            name: "Serial meter".to_string(),
            description: "Reads KEY=value lines from a serial device or FIFO.".to_string(),
            form_schema: vec![
                FormField::text("device", "Device path", true).with_help("e.g. /dev/ttyUSB0"),
                FormField::text("decision_file", "Decision output file", false),
            ],
        }
    }

    fn deserialize_config(&self, config: &Value) -> Result<Box<dyn Driver>, ConfigurationError> {
        let parsed: SerialMeterConfig = serde_json::from_value(config.clone())
            .map_err(|e| ConfigurationError::invalid("driver.config", e.to_string()))?;
        if parsed.device.as_os_str().is_empty() {
            return Err(ConfigurationError::invalid(
                "driver.config.device",
                "must not be empty",
            ));
        }
        Ok(Box::new(SerialMeterDriver::new(parsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optimasol::telemetry::TelemetryStore;
    use optimasol::ClientId;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_parse_line() {
        let line = parse_line("TEMP=51.2 PROD=1420;POUT=900,TS=1718960400");
        assert_eq!(
            line.readings,
            vec![
                (Metric::Temperature, 51.2),
                (Metric::Production, 1420.0),
                (Metric::Power, 900.0)
            ]
        );
        assert_eq!(line.timestamp.unwrap().timestamp(), 1_718_960_400);
    }

    #[test]
    fn test_parse_line_skips_noise() {
        let line = parse_line("hello temp=40 PROD=abc VOLT=230");
        assert_eq!(line.readings, vec![(Metric::Temperature, 40.0)]);
        assert!(line.timestamp.is_none());
    }

    #[tokio::test]
    async fn test_reads_device_into_sink() {
        let mut device = NamedTempFile::new().unwrap();
        writeln!(device, "TEMP=48.5 PROD=300 TS=1718960400").unwrap();
        device.flush().unwrap();

        let store = Arc::new(TelemetryStore::new());
        let driver = SerialMeterDriver::new(SerialMeterConfig {
            device: device.path().to_path_buf(),
            decision_file: None,
        });
        driver
            .start(TelemetrySink::new(ClientId(1), Arc::clone(&store)))
            .await
            .unwrap();

        let mut temperature = None;
        for _ in 0..50 {
            temperature = store.get(Metric::Temperature);
            if temperature.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let temperature = temperature.unwrap();
        assert_eq!(temperature.value, 48.5);
        assert_eq!(temperature.timestamp.timestamp(), 1_718_960_400);
        driver.stop().await;
    }

    #[tokio::test]
    async fn test_missing_device_fails_start() {
        let driver = SerialMeterDriver::new(SerialMeterConfig {
            device: PathBuf::from("/nonexistent/ttyUSB9"),
            decision_file: None,
        });
        let store = Arc::new(TelemetryStore::new());
        let result = driver.start(TelemetrySink::new(ClientId(1), store)).await;
        assert!(matches!(result, Err(DriverError::Connection(_))));
        assert_eq!(driver.apply_decision(0.5).await, Err(DriverError::NotConnected));
    }

    #[tokio::test]
    async fn test_decision_written_as_percentage() {
        let device = NamedTempFile::new().unwrap();
        let dir = tempdir().unwrap();
        let output = dir.path().join("decision");
        let driver = SerialMeterDriver::new(SerialMeterConfig {
            device: device.path().to_path_buf(),
            decision_file: Some(output.clone()),
        });
        let store = Arc::new(TelemetryStore::new());
        driver
            .start(TelemetrySink::new(ClientId(1), store))
            .await
            .unwrap();

        driver.apply_decision(0.42).await.unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "42\n");
        assert_eq!(
            driver.apply_decision(-0.1).await,
            Err(DriverError::DecisionOutOfRange(-0.1))
        );
        driver.stop().await;
    }

    #[test]
    fn test_factory_round_trip() {
        let config = json!({"device": "/dev/ttyUSB0", "decision_file": "/run/optimasol/d1"});
        let built = SerialMeterFactory.deserialize_config(&config).unwrap();
        assert_eq!(built.serialize_config(), config);

        let config = json!({"device": "/dev/ttyUSB0"});
        let built = SerialMeterFactory.deserialize_config(&config).unwrap();
        assert_eq!(built.serialize_config(), config);
    }
}
