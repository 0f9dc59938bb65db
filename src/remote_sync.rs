use crate::error::RemoteError;
use crate::relay_bank::{RelayBank, RelayTransition, RELAY_COUNT};
use crate::sensor_reader::Measurement;
use async_trait::async_trait;
use embedded_hal::digital::OutputPin;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub const LIVE_PATH: &str = "/sensor_data";
pub const MAIN_POWER_PATH: &str = "/control/main_power";

/// Control path of a relay, numbered from 1 on the wire
pub fn relay_path(index: usize) -> String {
    format!("/control/relay{}", index + 1)
}

/// History record key, whole seconds since boot
pub fn history_path(uptime_ms: u64) -> String {
    format!("/history/{}", uptime_ms / 1000)
}

/// Value found at a path, tagged with the type the store declared for it
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteValue {
    Bool(bool),
    Null,
    Other(&'static str),
}

impl RemoteValue {
    pub fn data_type(&self) -> &'static str {
        match self {
            RemoteValue::Bool(_) => "boolean",
            RemoteValue::Null => "null",
            RemoteValue::Other(kind) => kind,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RemoteValue::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&Value> for RemoteValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(b) => RemoteValue::Bool(*b),
            Value::Null => RemoteValue::Null,
            Value::Number(_) => RemoteValue::Other("number"),
            Value::String(_) => RemoteValue::Other("string"),
            Value::Array(_) => RemoteValue::Other("array"),
            Value::Object(_) => RemoteValue::Other("json"),
        }
    }
}

/// Hierarchical document store holding live telemetry and relay commands
#[async_trait]
pub trait RemoteStore: Send {
    /// Whether the store is currently usable without re-initialization
    fn is_ready(&self) -> bool;
    /// (Re)initializes the connection to the store
    async fn begin(&mut self) -> Result<(), RemoteError>;
    async fn set_document(&mut self, path: &str, document: &Value) -> Result<(), RemoteError>;
    async fn get_bool(&mut self, path: &str) -> Result<RemoteValue, RemoteError>;
    async fn set_bool(&mut self, path: &str, value: bool) -> Result<(), RemoteError>;
}

/// Telemetry document written to the live path and copied into history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    /// Session energy in kWh
    #[serde(rename = "energy")]
    pub energy_kwh: f64,
    pub frequency: f32,
    pub power_factor: f32,
    /// Milliseconds since boot
    pub timestamp: u64,
}

impl SyncSnapshot {
    pub fn new(measurement: &Measurement, energy_kwh: f64, timestamp: u64) -> Self {
        Self {
            voltage: measurement.voltage,
            current: measurement.current,
            power: measurement.power,
            energy_kwh,
            frequency: measurement.frequency,
            power_factor: measurement.power_factor,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushOutcome {
    pub history_stored: bool,
}

/// What a pull applied to the relays
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    pub transitions: Vec<RelayTransition>,
    pub main_power: Option<bool>,
    pub read_failures: usize,
    pub write_failures: usize,
}

impl PullReport {
    pub fn failures(&self) -> usize {
        self.read_failures + self.write_failures
    }
}

/// Mirrors telemetry to the remote store and relay commands from it
pub struct RemoteSync<S> {
    store: S,
    last_main_power: Option<bool>,
    /// Main power echoes that did not reach the store yet, per relay
    echo_pending: [Option<bool>; RELAY_COUNT],
}

impl<S: RemoteStore> RemoteSync<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            last_main_power: None,
            echo_pending: [None; RELAY_COUNT],
        }
    }

    pub fn is_ready(&self) -> bool {
        self.store.is_ready()
    }

    pub async fn begin(&mut self) -> Result<(), RemoteError> {
        self.store.begin().await
    }

    /// Writes the live document, then a history copy. Only the live write decides success.
    pub async fn push(&mut self, snapshot: &SyncSnapshot) -> Result<PushOutcome, RemoteError> {
        let document = serde_json::to_value(snapshot).map_err(|e| RemoteError::WriteFailed {
            path: LIVE_PATH.to_string(),
            reason: e.to_string(),
        })?;

        self.store.set_document(LIVE_PATH, &document).await?;
        info!("Live data uploaded");

        let path = history_path(snapshot.timestamp);
        let history_stored = match self.store.set_document(&path, &document).await {
            Ok(()) => {
                debug!(%path, "Historical data stored");
                true
            }
            Err(e) => {
                warn!(%path, reason = e.reason(), "Failed to store history");
                false
            }
        };

        Ok(PushOutcome { history_stored })
    }

    /// Reads the four relay commands, then main power, and applies whatever changed.
    ///
    /// A relay whose main power echo is still pending keeps the aggregate state
    /// and is not read back until the echo is written.
    pub async fn pull<P: OutputPin>(&mut self, relays: &mut RelayBank<P>) -> PullReport {
        let mut report = PullReport::default();

        for index in 0..RELAY_COUNT {
            let path = relay_path(index);
            if let Some(on) = self.echo_pending[index] {
                if let Err(e) = self.store.set_bool(&path, on).await {
                    report.write_failures += 1;
                    warn!(%path, reason = e.reason(), "Main power echo still pending");
                    continue;
                }
                self.echo_pending[index] = None;
            }

            match self.store.get_bool(&path).await {
                Ok(RemoteValue::Bool(on)) => match relays.set(index, on) {
                    Ok(Some(transition)) => report.transitions.push(transition),
                    Ok(None) => {}
                    Err(e) => error!("Relay {} not switched: {}", index + 1, e),
                },
                Ok(other) => {
                    debug!(%path, data_type = other.data_type(), "Ignoring non-boolean control value")
                }
                Err(e) => {
                    report.read_failures += 1;
                    warn!(%path, reason = e.reason(), "Control read failed");
                }
            }
        }

        match self.store.get_bool(MAIN_POWER_PATH).await {
            Ok(RemoteValue::Bool(on)) if self.last_main_power != Some(on) => {
                self.apply_main_power(on, relays, &mut report).await;
            }
            Ok(_) => {}
            Err(e) => {
                report.read_failures += 1;
                warn!(path = MAIN_POWER_PATH, reason = e.reason(), "Control read failed");
            }
        }

        report
    }

    async fn apply_main_power<P: OutputPin>(
        &mut self,
        on: bool,
        relays: &mut RelayBank<P>,
        report: &mut PullReport,
    ) {
        self.last_main_power = Some(on);
        report.main_power = Some(on);

        match relays.set_all(on) {
            Ok(transitions) => report.transitions.extend(transitions),
            Err(e) => error!("Main power not applied to every relay: {}", e),
        }

        // Keep the individual paths consistent with the aggregate
        for index in 0..RELAY_COUNT {
            let path = relay_path(index);
            match self.store.set_bool(&path, on).await {
                Ok(()) => self.echo_pending[index] = None,
                Err(e) => {
                    self.echo_pending[index] = Some(on);
                    report.write_failures += 1;
                    warn!(%path, reason = e.reason(), "Failed to echo main power");
                }
            }
        }

        info!(state = if on { "ON" } else { "OFF" }, "Main power changed");
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
