//! Smart Energy Meter Library
//!
//! Polls a PZEM-004T power meter, integrates session energy, mirrors telemetry
//! to a Firebase realtime database and drives four relays from its control paths.
//! Everything runs from one cooperative control loop.

pub mod config;
pub mod control_loop;
pub mod energy_accumulator;
pub mod error;
pub mod firebase;
pub mod network_link;
pub mod operator;
pub mod pzem_client;
pub mod relay_bank;
pub mod remote_sync;
pub mod sensor_reader;

// Re-export commonly used types for easier access
pub use config::{Config, LinkCredentials, LoopConfig};
pub use control_loop::{ControlLoop, CycleOutcome, CycleReport};
pub use energy_accumulator::EnergyAccumulator;
pub use firebase::FirebaseClient;
pub use network_link::{HostLink, NetworkLink};
pub use pzem_client::PzemClient;
pub use relay_bank::{LatchedPin, RelayBank};
pub use remote_sync::{RemoteStore, RemoteSync, SyncSnapshot};
pub use sensor_reader::{Measurement, PowerMeter, SensorReader};
