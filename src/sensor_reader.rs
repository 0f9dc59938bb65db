use crate::error::SensorError;
use async_trait::async_trait;
use tracing::{info, warn};

/// Register-level contract of the power meter.
/// Each call is one read and returns NaN when the meter did not answer.
#[async_trait]
pub trait PowerMeter: Send {
    async fn voltage(&mut self) -> f32;
    async fn current(&mut self) -> f32;
    async fn power(&mut self) -> f32;
    /// Lifetime energy counter of the meter itself, in kWh
    async fn energy(&mut self) -> f32;
    async fn frequency(&mut self) -> f32;
    async fn power_factor(&mut self) -> f32;
}

/// Instantaneous electrical readings, only ever constructed from a complete valid poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub meter_energy_kwh: f32,
    pub frequency: f32,
    pub power_factor: f32,
}

pub struct SensorReader<M> {
    meter: M,
}

impl<M: PowerMeter> SensorReader<M> {
    pub fn new(meter: M) -> Self {
        Self { meter }
    }

    /// Polls all six attributes in order. The first NaN aborts the poll.
    pub async fn read(&mut self) -> Result<Measurement, SensorError> {
        let voltage = valid("voltage", self.meter.voltage().await)?;
        let current = valid("current", self.meter.current().await)?;
        let power = valid("power", self.meter.power().await)?;
        let meter_energy_kwh = valid("energy", self.meter.energy().await)?;
        let frequency = valid("frequency", self.meter.frequency().await)?;
        let power_factor = valid("power_factor", self.meter.power_factor().await)?;

        Ok(Measurement {
            voltage,
            current,
            power,
            meter_energy_kwh,
            frequency,
            power_factor,
        })
    }

    /// Startup check that the meter answers at all. Returns false when
    /// neither voltage nor current could be read.
    pub async fn probe(&mut self) -> bool {
        let voltage = self.meter.voltage().await;
        let current = self.meter.current().await;
        info!(voltage, current, "Raw PZEM readings");

        if voltage.is_nan() && current.is_nan() {
            warn!("PZEM-004T v3 not responding");
            warn!("Check that the meter power LED is on and it is connected to AC mains");
            warn!("Check the RS485/TTL wiring and the gateway serial settings (9600 8N1)");
            false
        } else {
            info!("PZEM-004T v3 responding correctly");
            true
        }
    }

    pub fn meter_mut(&mut self) -> &mut M {
        &mut self.meter
    }
}

fn valid(attribute: &'static str, value: f32) -> Result<f32, SensorError> {
    if value.is_nan() {
        Err(SensorError::InvalidReading { attribute })
    } else {
        Ok(value)
    }
}
