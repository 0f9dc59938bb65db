use crate::sensor_reader::PowerMeter;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::sleep;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

// Input register map of the PZEM-004T v3.0
// 32-bit quantities are transferred low word first
const REG_VOLTAGE: u16 = 0x0000; // 0.1 V
const REG_CURRENT: u16 = 0x0001; // 1 mA, 2 registers
const REG_POWER: u16 = 0x0003; // 0.1 W, 2 registers
const REG_ENERGY: u16 = 0x0005; // 1 Wh, 2 registers
const REG_FREQUENCY: u16 = 0x0007; // 0.1 Hz
const REG_POWER_FACTOR: u16 = 0x0008; // 0.01

/// PZEM-004T v3 power meter reached through a Modbus TCP to RTU gateway.
///
/// Every attribute is a separate register read. A failed read yields NaN and
/// drops the connection so the next read reconnects.
pub struct PzemClient {
    /// Gateway as `host:port`, resolved on every connect
    target_address: String,
    slave: Slave,
    connection: Option<client::Context>,
}

impl PzemClient {
    pub fn new(target_address: impl Into<String>, slave_address: u8) -> Self {
        Self {
            target_address: target_address.into(),
            slave: Slave(slave_address),
            connection: None,
        }
    }

    /// Connects to the gateway with a short bounded backoff
    async fn connect_with_retry(&mut self) -> Option<client::Context> {
        const MAX_RETRIES: u32 = 3;

        for attempt in 1..=MAX_RETRIES {
            debug!(
                address = %self.target_address,
                attempt,
                "Connecting to PZEM gateway"
            );

            let resolved = match lookup_host(self.target_address.as_str()).await {
                Ok(mut addrs) => addrs.next().ok_or_else(|| "no address found".to_string()),
                Err(e) => Err(e.to_string()),
            };
            let connected = match resolved {
                Ok(socket_addr) => tcp::connect_slave(socket_addr, self.slave)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("cannot resolve {}: {}", self.target_address, e)),
            };

            match connected {
                Ok(connection) => {
                    info!(address = %self.target_address, "Connected to PZEM gateway");
                    return Some(connection);
                }
                Err(e) => {
                    warn!(attempt, "PZEM gateway connection attempt failed: {}", e);
                    if attempt < MAX_RETRIES {
                        sleep(Duration::from_millis(100 << (attempt - 1))).await;
                    }
                }
            }
        }

        None
    }

    async fn read_registers(&mut self, register: u16, count: u16) -> Result<Vec<u16>, String> {
        if self.connection.is_none() {
            self.connection = self.connect_with_retry().await;
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| "No connection available".to_string())?;

        // tokio-modbus returns Result<Result<Vec<u16>, ExceptionCode>, Error>
        match connection.read_input_registers(register, count).await {
            Ok(Ok(words)) if words.len() >= count as usize => Ok(words),
            Ok(Ok(words)) => Err(format!(
                "Short response for register {register:#06x}: {} of {count} words",
                words.len()
            )),
            Ok(Err(exception)) => Err(format!("Modbus exception: {:?}", exception)),
            Err(transport) => {
                self.connection = None;
                Err(format!("Modbus transport error: {:?}", transport))
            }
        }
    }

    /// Reads a 16-bit register and applies the resolution, NaN on failure
    async fn read_u16_scaled(&mut self, register: u16, resolution: f32) -> f32 {
        match self.read_registers(register, 1).await {
            Ok(words) => f32::from(words[0]) * resolution,
            Err(e) => {
                warn!("PZEM read of register {register:#06x} failed: {e}");
                f32::NAN
            }
        }
    }

    /// Reads a 32-bit register pair and applies the resolution, NaN on failure
    async fn read_u32_scaled(&mut self, register: u16, resolution: f32) -> f32 {
        match self.read_registers(register, 2).await {
            Ok(words) => merge_u16_u32(words[0], words[1]) as f32 * resolution,
            Err(e) => {
                warn!("PZEM read of register {register:#06x} failed: {e}");
                f32::NAN
            }
        }
    }
}

#[async_trait]
impl PowerMeter for PzemClient {
    async fn voltage(&mut self) -> f32 {
        self.read_u16_scaled(REG_VOLTAGE, 0.1).await
    }

    async fn current(&mut self) -> f32 {
        self.read_u32_scaled(REG_CURRENT, 0.001).await
    }

    async fn power(&mut self) -> f32 {
        self.read_u32_scaled(REG_POWER, 0.1).await
    }

    async fn energy(&mut self) -> f32 {
        // Register counts Wh, the meter contract reports kWh
        self.read_u32_scaled(REG_ENERGY, 0.001).await
    }

    async fn frequency(&mut self) -> f32 {
        self.read_u16_scaled(REG_FREQUENCY, 0.1).await
    }

    async fn power_factor(&mut self) -> f32 {
        self.read_u16_scaled(REG_POWER_FACTOR, 0.01).await
    }
}

/// Joins a low/high register pair into one 32-bit value
fn merge_u16_u32(low: u16, high: u16) -> u32 {
    (low as u32) | ((high as u32) << 16)
}
