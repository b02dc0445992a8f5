//! Smart Electromation PV router, driven over a local MQTT broker.
//!
//! Topics are rooted at the router's serial number:
//! - `<serial>/DATA`: JSON telemetry (`TEMP1`, `PROD`, `POUT`)
//! - `<serial>/SETMODE`: output modes, first digit for output 2 (always auto)
//! - `<serial>/DIMMER1`: dimmer percentage while in gradation mode

use async_trait::async_trait;
use chrono::Utc;
use optimasol::config::MqttConfig;
use optimasol::driver::{Driver, DriverDescriptor, DriverFactory, FormField};
use optimasol::telemetry::{Metric, TelemetrySink};
use optimasol::{ConfigurationError, DriverError};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const TYPE_ID: &str = "smart_electromation_mqtt";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on each step of the hand-back on stop
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const MODE_OFF: &str = "10";
const MODE_FORCED: &str = "12";
const MODE_DIMMER: &str = "14";
const MODE_AUTO: &str = "11";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartElectromationConfig {
    pub serial_number: String,
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

pub struct SmartElectromationDriver {
    config: SmartElectromationConfig,
    broker: MqttConfig,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    connect_timeout: Duration,
}

impl SmartElectromationDriver {
    pub fn new(config: SmartElectromationConfig, broker: MqttConfig) -> Self {
        Self {
            config,
            broker,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// How long `start` waits for the broker's CONNACK.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.config.serial_number, leaf)
    }

    fn client(&self) -> Option<AsyncClient> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.client.clone())
    }

    async fn publish(
        &self,
        client: &AsyncClient,
        leaf: &str,
        payload: String,
    ) -> Result<(), DriverError> {
        client
            .publish(self.topic(leaf), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| DriverError::Send(e.to_string()))
    }
}

#[async_trait]
impl Driver for SmartElectromationDriver {
    fn type_id(&self) -> &str {
        TYPE_ID
    }

    /// Connects to the broker and returns once it has acknowledged the session.
    async fn start(&self, sink: TelemetrySink) -> Result<(), DriverError> {
        if self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            format!("optimasol-{}", self.config.serial_number),
            self.broker.host.clone(),
            self.broker.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&self.broker.username, &self.broker.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let data_topic = self.topic("DATA");
        let connected = Arc::clone(&self.connected);
        let subscriber = client.clone();
        let serial = self.config.serial_number.clone();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();

        let task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // Subscriptions do not survive a reconnect
                        connected.store(true, Ordering::SeqCst);
                        if let Err(e) = subscriber.try_subscribe(data_topic.as_str(), QoS::AtLeastOnce)
                        {
                            warn!(serial = %serial, error = %e, "MQTT subscribe failed");
                        }
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Ok(()));
                        }
                        info!(serial = %serial, "Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == data_topic => {
                        match parse_data(&publish.payload) {
                            Ok(readings) => {
                                let now = Utc::now();
                                for (metric, value) in readings {
                                    sink.on_reading(metric, value, now);
                                }
                            }
                            Err(e) => {
                                debug!(serial = %serial, error = %e, "Ignoring malformed router payload")
                            }
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!(serial = %serial, "MQTT disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // The first connection is reported to `start`, not retried here
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(Err(e.to_string()));
                            break;
                        }
                        if connected.swap(false, Ordering::SeqCst) {
                            warn!(serial = %serial, error = %e, "MQTT connection lost");
                        }
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        let failure = match timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e),
            Ok(Err(_)) => Some("MQTT event loop exited".to_string()),
            Err(_) => Some(format!("no CONNACK within {:?}", self.connect_timeout)),
        };
        if let Some(reason) = failure {
            task.abort();
            self.connected.store(false, Ordering::SeqCst);
            return Err(DriverError::Connection(reason));
        }

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() {
            task.abort();
            return Ok(());
        }
        *session = Some(Session { client, task });
        Ok(())
    }

    async fn apply_decision(&self, value: f64) -> Result<(), DriverError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(DriverError::DecisionOutOfRange(value));
        }
        let client = match self.client() {
            Some(client) if self.connected.load(Ordering::SeqCst) => client,
            _ => return Err(DriverError::NotConnected),
        };

        if value == 0.0 {
            self.publish(&client, "SETMODE", MODE_OFF.to_string()).await
        } else if value == 1.0 {
            self.publish(&client, "SETMODE", MODE_FORCED.to_string()).await
        } else {
            self.publish(&client, "SETMODE", MODE_DIMMER.to_string())
                .await?;
            self.publish(&client, "DIMMER1", format_percent(value)).await
        }
    }

    /// Hands the router back to its own automatic mode, then disconnects.
    async fn stop(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut session) = session else {
            return;
        };
        let serial = &self.config.serial_number;

        if self.connected.swap(false, Ordering::SeqCst) {
            let topic = self.topic("SETMODE");
            let handback = session.client.publish(topic, QoS::AtLeastOnce, false, MODE_AUTO);
            match timeout(STOP_TIMEOUT, handback).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(serial = %serial, error = %e, "Auto mode hand-back failed"),
                Err(_) => warn!(serial = %serial, "Auto mode hand-back timed out"),
            }
            match timeout(STOP_TIMEOUT, session.client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(serial = %serial, error = %e, "MQTT disconnect failed"),
                Err(_) => warn!(serial = %serial, "MQTT disconnect timed out"),
            }
            // The event loop exits once the disconnect is on the wire
            if timeout(STOP_TIMEOUT, &mut session.task).await.is_err() {
                warn!(serial = %serial, "MQTT event loop did not drain, aborting");
            }
        }
        session.task.abort();
    }

    fn serialize_config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or(Value::Null)
    }
}

/// Extracts telemetry from a `<serial>/DATA` payload. Values may be numbers
/// or numeric strings; missing keys are skipped.
pub fn parse_data(payload: &[u8]) -> Result<Vec<(Metric, f64)>, serde_json::Error> {
    let data: Value = serde_json::from_slice(payload)?;
    let keys = [
        ("TEMP1", Metric::Temperature),
        ("PROD", Metric::Production),
        ("POUT", Metric::Power),
    ];
    Ok(keys
        .iter()
        .filter_map(|(key, metric)| {
            let value = match data.get(*key)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }?;
            Some((*metric, value))
        })
        .collect())
}

fn format_percent(value: f64) -> String {
    let percent = (value * 100.0 * 10.0).round() / 10.0;
    format!("{}", percent)
}

pub struct SmartElectromationFactory {
    broker: MqttConfig,
}

impl SmartElectromationFactory {
    pub fn new(broker: MqttConfig) -> Self {
        Self { broker }
    }
}

impl DriverFactory for SmartElectromationFactory {
    fn descriptor(&self) -> DriverDescriptor {
        DriverDescriptor {
            id: TYPE_ID.to_string(),
            name: "Smart Electromation (PV Router)".to_string(),
            description: "Drives Smart Electromation V1/V2 routers over local MQTT.".to_string(),
            form_schema: vec![FormField::text("serial_number", "Serial number", true)
                .with_help("Printed on the device label and on its /Status web page.")],
        }
    }

    fn deserialize_config(&self, config: &Value) -> Result<Box<dyn Driver>, ConfigurationError> {
        let parsed: SmartElectromationConfig = serde_json::from_value(config.clone())
            .map_err(|e| ConfigurationError::invalid("driver.config", e.to_string()))?;
        if parsed.serial_number.trim().is_empty() {
            return Err(ConfigurationError::invalid(
                "driver.config.serial_number",
                "must not be empty",
            ));
        }
        Ok(Box::new(SmartElectromationDriver::new(
            parsed,
            self.broker.clone(),
        )))
    }
}
