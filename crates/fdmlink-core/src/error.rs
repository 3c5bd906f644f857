//! Error handling for fdmlink
//!
//! Provides error types for every layer of the printer host:
//! - Connection errors (port open, baud negotiation, serial I/O)
//! - Protocol errors (framing, window bookkeeping, malformed responses)
//! - Printer errors (job state machine, device-reported faults)
//! - Firmware errors (version lookup, image loading, in-system programming)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to the serial link: opening the port,
/// locking a baud rate and reading/writing bytes.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// None of the candidate baud rates produced readable output
    #[error("No working baud rate on {port} (tried {tried:?})")]
    BaudNegotiationFailed {
        /// The port that was probed.
        port: String,
        /// Every baud rate that was attempted, in order.
        tried: Vec<u32>,
    },

    /// A connection attempt or an open connection already exists
    #[error("Already connected or connecting")]
    AlreadyConnected,

    /// The port is not open
    #[error("Not connected")]
    NotConnected,

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// The port is owned by a firmware update
    #[error("Port is busy with a firmware update")]
    FirmwareUpdateInProgress,

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },

    /// Invalid connection parameters
    #[error("Invalid connection parameters: {reason}")]
    InvalidParameters {
        /// The reason the parameters are invalid.
        reason: String,
    },
}

/// Protocol error type
///
/// Errors raised while framing lines or keeping the flow-control window.
/// Device-requested resends are recovered locally and never reach here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A single framed line can never fit into the device receive buffer
    #[error("Line {sequence} is {length} bytes framed, window capacity is {capacity}")]
    LineTooLong {
        /// Sequence number the line would have been sent with.
        sequence: u64,
        /// Length of the framed line in bytes.
        length: usize,
        /// Configured window capacity in bytes.
        capacity: usize,
    },

    /// An unnumbered command can never fit into the device receive buffer
    #[error("Command '{command}' is {length} bytes, window capacity is {capacity}")]
    CommandTooLong {
        /// The command text.
        command: String,
        /// Length on the wire in bytes.
        length: usize,
        /// Configured window capacity in bytes.
        capacity: usize,
    },

    /// Device asked to resend a line that was never part of the program
    #[error("Resend requested for line {requested}, program has {total} lines")]
    ResendOutOfRange {
        /// Requested sequence number.
        requested: u64,
        /// Number of lines in the loaded program.
        total: usize,
    },

    /// A device response could not be interpreted
    #[error("Malformed response: {line}")]
    MalformedResponse {
        /// The raw response text.
        line: String,
    },
}

/// Printer error type
///
/// Represents errors of the print-job state machine and faults reported
/// by the device itself.
#[derive(Error, Debug, Clone)]
pub enum PrinterError {
    /// Printer is not connected
    #[error("Printer not connected")]
    NotConnected,

    /// A job is already running or the printer is otherwise busy
    #[error("Printer is busy ({state})")]
    Busy {
        /// The state that prevented the request.
        state: String,
    },

    /// Invalid state transition
    #[error("Invalid state transition from {current} to {requested}")]
    InvalidStateTransition {
        /// The current state name.
        current: String,
        /// The requested state name.
        requested: String,
    },

    /// The program handed to `start_print` had no lines
    #[error("Program is empty")]
    EmptyProgram,

    /// Device reported a fatal thermal or shutdown condition
    #[error("Printer fault: {message}")]
    DeviceFault {
        /// Raw device message.
        message: String,
    },

    /// Extruder index outside of the configured extruder count
    #[error("Extruder {index} does not exist (printer has {count})")]
    InvalidExtruder {
        /// Requested index.
        index: usize,
        /// Number of extruders configured.
        count: usize,
    },
}

/// Firmware error type
///
/// Represents errors specific to firmware identification and updates.
#[derive(Error, Debug, Clone)]
pub enum FirmwareError {
    /// Version string could not be parsed
    #[error("Invalid firmware version: {version}")]
    InvalidVersion {
        /// The offending version text.
        version: String,
    },

    /// No release endpoint is known for the machine family
    #[error("No release channel for machine family {family}")]
    UnknownFamily {
        /// The machine family tag.
        family: String,
    },

    /// Release metadata could not be fetched or understood
    #[error("Release lookup failed: {reason}")]
    ReleaseLookup {
        /// The reason the lookup failed.
        reason: String,
    },

    /// Firmware image is missing, empty or corrupt
    #[error("Firmware image error: {reason}")]
    InvalidImage {
        /// The reason the image was rejected.
        reason: String,
    },

    /// Image was built for another machine family
    #[error("Image is for {image}, printer is {device}")]
    FamilyMismatch {
        /// Family declared by the image.
        image: String,
        /// Family of the connected device.
        device: String,
    },

    /// A firmware update is already running
    #[error("Firmware update already in progress")]
    UpdateInProgress,
}

/// Main error type for fdmlink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Printer error
    #[error(transparent)]
    Printer(#[from] PrinterError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if this is a protocol error
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Check if this is a printer error
    pub fn is_printer_error(&self) -> bool {
        matches!(self, Error::Printer(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::LineTooLong {
            sequence: 7,
            length: 140,
            capacity: 127,
        };
        assert_eq!(
            err.to_string(),
            "Line 7 is 140 bytes framed, window capacity is 127"
        );

        let err = PrinterError::Busy {
            state: "Printing".to_string(),
        };
        assert_eq!(err.to_string(), "Printer is busy (Printing)");
    }

    #[test]
    fn test_error_classification() {
        let err: Error = ConnectionError::NotConnected.into();
        assert!(err.is_connection_error());
        assert!(!err.is_printer_error());

        let err: Error = PrinterError::EmptyProgram.into();
        assert!(err.is_printer_error());

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io.into();
        assert!(err.is_connection_error());
    }
}
