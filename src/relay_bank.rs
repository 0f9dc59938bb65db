use crate::error::RelayError;
use core::convert::Infallible;
use embedded_hal::digital::{ErrorType, OutputPin, PinState};
use tracing::info;

pub const RELAY_COUNT: usize = 4;

/// A relay output that changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTransition {
    pub index: usize,
    pub from: bool,
    pub to: bool,
}

struct Relay<P> {
    pin: P,
    is_on: bool,
}

/// Four active-low relay outputs together with their last commanded state.
///
/// A relay is energized by driving its pin LOW.
pub struct RelayBank<P> {
    relays: [Relay<P>; RELAY_COUNT],
}

impl<P: OutputPin> RelayBank<P> {
    /// Takes ownership of the pins and drives every relay off
    pub fn new(pins: [P; RELAY_COUNT]) -> Result<Self, RelayError> {
        let mut bank = Self {
            relays: pins.map(|pin| Relay { pin, is_on: false }),
        };
        for index in 0..RELAY_COUNT {
            bank.drive(index, false)?;
        }
        Ok(bank)
    }

    /// Switches one relay. No pin write happens when the state is unchanged.
    pub fn set(&mut self, index: usize, on: bool) -> Result<Option<RelayTransition>, RelayError> {
        let relay = self
            .relays
            .get(index)
            .ok_or(RelayError::IndexOutOfRange(index))?;
        if relay.is_on == on {
            return Ok(None);
        }

        let transition = RelayTransition {
            index,
            from: relay.is_on,
            to: on,
        };
        self.drive(index, on)?;
        info!(
            relay = index + 1,
            from = on_off(transition.from),
            to = on_off(transition.to),
            "Relay changed"
        );
        Ok(Some(transition))
    }

    /// Main power override, fans out to every relay
    pub fn set_all(&mut self, on: bool) -> Result<Vec<RelayTransition>, RelayError> {
        let mut transitions = Vec::new();
        for index in 0..RELAY_COUNT {
            if let Some(transition) = self.set(index, on)? {
                transitions.push(transition);
            }
        }
        Ok(transitions)
    }

    pub fn is_on(&self, index: usize) -> Option<bool> {
        self.relays.get(index).map(|relay| relay.is_on)
    }

    pub fn states(&self) -> [bool; RELAY_COUNT] {
        core::array::from_fn(|index| self.relays[index].is_on)
    }

    pub fn pin(&self, index: usize) -> Option<&P> {
        self.relays.get(index).map(|relay| &relay.pin)
    }

    fn drive(&mut self, index: usize, on: bool) -> Result<(), RelayError> {
        let relay = &mut self.relays[index];
        // Active low
        let level = if on { PinState::Low } else { PinState::High };
        relay
            .pin
            .set_state(level)
            .map_err(|e| RelayError::Pin {
                index,
                reason: format!("{:?}", e),
            })?;
        relay.is_on = on;
        Ok(())
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Output pin that only remembers its level.
///
/// Stands in for a board GPIO on hosts without one and counts every write.
#[derive(Debug, Clone, Default)]
pub struct LatchedPin {
    gpio: u8,
    high: bool,
    writes: usize,
}

impl LatchedPin {
    pub fn new(gpio: u8) -> Self {
        Self {
            gpio,
            high: false,
            writes: 0,
        }
    }

    pub fn gpio(&self) -> u8 {
        self.gpio
    }

    pub fn is_high(&self) -> bool {
        self.high
    }

    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl ErrorType for LatchedPin {
    type Error = Infallible;
}

impl OutputPin for LatchedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        self.writes += 1;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        self.writes += 1;
        Ok(())
    }
}
