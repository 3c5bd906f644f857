//! Data models for printer state, toolhead tracking and telemetry
//!
//! This module provides:
//! - The printer connection/job state machine states
//! - Optimistic toolhead tracking (last issued X, Y, Z, E and feed rate)
//! - Cached temperature and endstop telemetry

pub mod toolhead;

pub use toolhead::ToolheadState;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Printer state
///
/// Mutated only by the job controller, either on caller commands or on
/// faults reported by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrinterState {
    /// No port is open
    #[default]
    Closed,
    /// Connect thread is opening the port and locking the baud rate
    Connecting,
    /// Port open and idle
    Connected,
    /// Streaming a program
    Printing,
    /// Program loaded, transmission suspended and head parked
    Paused,
    /// Device fault or serial failure
    Error,
}

impl PrinterState {
    /// Whether a serial port is open in this state
    pub fn has_port(&self) -> bool {
        matches!(
            self,
            PrinterState::Connected | PrinterState::Printing | PrinterState::Paused
        )
    }

    /// Whether a print job is loaded
    pub fn is_job_active(&self) -> bool {
        matches!(self, PrinterState::Printing | PrinterState::Paused)
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Printing => write!(f, "Printing"),
            Self::Paused => write!(f, "Paused"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// A measured/target temperature pair in degrees Celsius
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Measured temperature
    pub measured: f64,
    /// Target temperature, when the device reported one
    pub target: Option<f64>,
}

impl TemperatureReading {
    /// Create a reading
    pub fn new(measured: f64, target: Option<f64>) -> Self {
        Self { measured, target }
    }
}

/// Cached temperature telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperatures {
    /// Hotend readings indexed by extruder
    pub hotends: Vec<Option<TemperatureReading>>,
    /// Heated bed reading
    pub bed: Option<TemperatureReading>,
}

impl Temperatures {
    /// Reading of hotend `index`, if one has been reported
    pub fn hotend(&self, index: usize) -> Option<TemperatureReading> {
        self.hotends.get(index).copied().flatten()
    }

    /// Store a hotend reading, growing the table as needed
    pub fn set_hotend(&mut self, index: usize, reading: TemperatureReading) {
        if self.hotends.len() <= index {
            self.hotends.resize(index + 1, None);
        }
        self.hotends[index] = Some(reading);
    }
}

/// Machine axis with endstops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// X axis
    X,
    /// Y axis
    Y,
    /// Z axis
    Z,
}

impl Axis {
    /// Parse a lowercase or uppercase axis letter
    pub fn from_letter(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'x' => Some(Axis::X),
            'y' => Some(Axis::Y),
            'z' => Some(Axis::Z),
            _ => None,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// End of travel an endstop guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndstopSide {
    /// `<axis>_min`
    Min,
    /// `<axis>_max`
    Max,
}

/// Identifies a single limit switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endstop {
    /// Axis the switch belongs to
    pub axis: Axis,
    /// Which end of the axis
    pub side: EndstopSide,
}

impl Endstop {
    /// Create an endstop key
    pub fn new(axis: Axis, side: EndstopSide) -> Self {
        Self { axis, side }
    }
}

impl fmt::Display for Endstop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            EndstopSide::Min => write!(f, "{}_min", self.axis),
            EndstopSide::Max => write!(f, "{}_max", self.axis),
        }
    }
}

/// Cached endstop telemetry
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndstopStates {
    states: Vec<(Endstop, bool)>,
}

impl EndstopStates {
    /// Last reported state of `endstop`
    pub fn get(&self, endstop: Endstop) -> Option<bool> {
        self.states
            .iter()
            .find(|(e, _)| *e == endstop)
            .map(|(_, triggered)| *triggered)
    }

    /// Record a report; returns `true` when the state actually changed
    ///
    /// A first report of an untriggered switch is not a transition.
    pub fn update(&mut self, endstop: Endstop, triggered: bool) -> bool {
        match self.states.iter_mut().find(|(e, _)| *e == endstop) {
            Some((_, state)) => {
                let changed = *state != triggered;
                *state = triggered;
                changed
            }
            None => {
                self.states.push((endstop, triggered));
                triggered
            }
        }
    }

    /// Whether any switch has been seen triggered
    pub fn any_triggered(&self) -> bool {
        self.states.iter().any(|(_, t)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(PrinterState::Printing.has_port());
        assert!(PrinterState::Paused.is_job_active());
        assert!(!PrinterState::Connected.is_job_active());
        assert!(!PrinterState::Error.has_port());
        assert_eq!(PrinterState::default(), PrinterState::Closed);
    }

    #[test]
    fn test_temperatures_grow() {
        let mut temps = Temperatures::default();
        temps.set_hotend(1, TemperatureReading::new(210.0, Some(215.0)));
        assert_eq!(temps.hotends.len(), 2);
        assert!(temps.hotend(0).is_none());
        assert_eq!(temps.hotend(1).map(|r| r.measured), Some(210.0));
    }

    #[test]
    fn test_endstop_transitions() {
        let mut states = EndstopStates::default();
        let x_min = Endstop::new(Axis::X, EndstopSide::Min);

        assert!(!states.update(x_min, false));
        assert!(states.update(x_min, true));
        assert!(!states.update(x_min, true));
        assert!(states.update(x_min, false));
        assert_eq!(states.get(x_min), Some(false));
        assert_eq!(x_min.to_string(), "x_min");
    }
}
