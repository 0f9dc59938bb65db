const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Integrates active power over loop time into a session energy counter.
///
/// Accumulates in watt-hours and only ever grows between resets.
#[derive(Debug, Clone, Default)]
pub struct EnergyAccumulator {
    session_energy_wh: f64,
    last_measurement_ms: Option<u64>,
    reset_requested: bool,
}

impl EnergyAccumulator {
    /// Creates an accumulator at zero energy with no time baseline
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `power * elapsed_hours` for positive power and moves the time baseline to `now_ms`.
    /// The first call only sets the baseline.
    pub fn integrate(&mut self, power_w: f32, now_ms: u64) {
        let elapsed_hours = match self.last_measurement_ms {
            Some(last) => now_ms.saturating_sub(last) as f64 / MILLIS_PER_HOUR,
            None => 0.0,
        };
        self.last_measurement_ms = Some(now_ms);

        if power_w > 0.0 {
            self.session_energy_wh += f64::from(power_w) * elapsed_hours;
        }
    }

    /// Zeroes the session energy. The time baseline is kept.
    pub fn reset(&mut self) {
        self.session_energy_wh = 0.0;
    }

    /// Schedules a reset for the next integration step
    pub fn request_reset(&mut self) {
        self.reset_requested = true;
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// Applies a scheduled reset, if any. Returns whether one was applied.
    pub fn apply_pending_reset(&mut self) -> bool {
        if !self.reset_requested {
            return false;
        }
        self.reset();
        self.reset_requested = false;
        true
    }

    pub fn session_energy_wh(&self) -> f64 {
        self.session_energy_wh
    }

    pub fn session_energy_kwh(&self) -> f64 {
        self.session_energy_wh / 1000.0
    }

    pub fn last_measurement_ms(&self) -> Option<u64> {
        self.last_measurement_ms
    }
}
