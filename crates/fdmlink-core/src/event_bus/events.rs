//! Event type definitions for the printer event bus.
//!
//! Every notification the host raises for external collaborators (UI,
//! cloud bridges, plugins) is one of these variants. Events are cloneable
//! and serializable so they can be logged or forwarded verbatim.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::data::{Endstop, PrinterState, Temperatures};
use crate::firmware_version::FirmwareVersion;

/// Root event enum for everything a printer publishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrinterEvent {
    /// Printer state machine moved
    StateChanged {
        /// Previous state.
        from: PrinterState,
        /// New state.
        to: PrinterState,
    },
    /// Playback position advanced
    ProgressChanged(ProgressInfo),
    /// Temperature telemetry updated
    TemperatureChanged(Temperatures),
    /// An endstop switched between triggered and released
    EndstopChanged {
        /// The switch.
        endstop: Endstop,
        /// Whether it is now triggered.
        triggered: bool,
    },
    /// Fatal device or serial fault, carrying the raw message
    Fault {
        /// Device or I/O message.
        message: String,
    },
    /// The connect thread gave up
    ConnectionFailed {
        /// Port that was tried.
        port: String,
        /// Failure description.
        reason: String,
    },
    /// The device identified its firmware
    FirmwareDetected(FirmwareVersion),
    /// Cached firmware version was dropped (after a flash)
    FirmwareInvalidated,
    /// Firmware flashing progress in percent
    FirmwareUpdateProgress(f64),
    /// Firmware update thread finished; `code` is 0 on success
    FirmwareUpdateFinished {
        /// Outcome code (0 success, 1-5 failure kinds).
        code: u8,
        /// Human readable outcome.
        description: String,
    },
}

impl PrinterEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            PrinterEvent::StateChanged { .. } | PrinterEvent::ConnectionFailed { .. } => {
                EventCategory::State
            }
            PrinterEvent::ProgressChanged(_) => EventCategory::Progress,
            PrinterEvent::TemperatureChanged(_) | PrinterEvent::EndstopChanged { .. } => {
                EventCategory::Telemetry
            }
            PrinterEvent::Fault { .. } => EventCategory::Fault,
            PrinterEvent::FirmwareDetected(_)
            | PrinterEvent::FirmwareInvalidated
            | PrinterEvent::FirmwareUpdateProgress(_)
            | PrinterEvent::FirmwareUpdateFinished { .. } => EventCategory::Firmware,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            PrinterEvent::StateChanged { from, to } => format!("State {} -> {}", from, to),
            PrinterEvent::ProgressChanged(p) => {
                format!("Progress {}/{} ({:.1}%)", p.transmitted, p.total, p.percent())
            }
            PrinterEvent::TemperatureChanged(t) => {
                format!("Temperatures: {} hotends, bed {:?}", t.hotends.len(), t.bed)
            }
            PrinterEvent::EndstopChanged { endstop, triggered } => {
                format!("Endstop {} {}", endstop, if *triggered { "triggered" } else { "open" })
            }
            PrinterEvent::Fault { message } => format!("Fault: {}", message),
            PrinterEvent::ConnectionFailed { port, reason } => {
                format!("Connection to {} failed: {}", port, reason)
            }
            PrinterEvent::FirmwareDetected(v) => format!("Firmware {}", v),
            PrinterEvent::FirmwareInvalidated => "Firmware version invalidated".to_string(),
            PrinterEvent::FirmwareUpdateProgress(p) => format!("Firmware update {:.0}%", p),
            PrinterEvent::FirmwareUpdateFinished { code, description } => {
                format!("Firmware update finished ({}): {}", code, description)
            }
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// State machine and connection events.
    State,
    /// Print progress events.
    Progress,
    /// Temperature and endstop telemetry.
    Telemetry,
    /// Faults.
    Fault,
    /// Firmware identification and updates.
    Firmware,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::State => write!(f, "State"),
            EventCategory::Progress => write!(f, "Progress"),
            EventCategory::Telemetry => write!(f, "Telemetry"),
            EventCategory::Fault => write!(f, "Fault"),
            EventCategory::Firmware => write!(f, "Firmware"),
        }
    }
}

/// Print progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Lines transmitted so far (including the reset sentinel)
    pub transmitted: usize,
    /// Total program lines
    pub total: usize,
    /// Estimated remaining print time, when an estimate was supplied
    pub remaining: Option<Duration>,
}

impl ProgressInfo {
    /// Progress as a fraction in `0.0..=1.0`
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.transmitted as f64 / self.total as f64).min(1.0)
    }

    /// Progress in percent
    pub fn percent(&self) -> f64 {
        self.fraction() * 100.0
    }
}
