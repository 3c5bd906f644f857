//! # fdmlink Core
//!
//! Core types shared by the fdmlink crates: the error taxonomy, the printer
//! data model, firmware identification and the printer event bus.

pub mod data;
pub mod error;
pub mod event_bus;
pub mod firmware_version;

pub use data::{
    Axis, Endstop, EndstopSide, EndstopStates, PrinterState, TemperatureReading, Temperatures,
    ToolheadState,
};

pub use error::{ConnectionError, Error, FirmwareError, PrinterError, ProtocolError, Result};

pub use event_bus::{EventBus, EventCategory, EventFilter, PrinterEvent, ProgressInfo};

pub use firmware_version::{needs_update, FirmwareVersion, MachineFamily};
