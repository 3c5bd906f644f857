//! Serial link abstraction
//!
//! The connection manager never talks to the `serialport` crate directly;
//! it goes through the [`SerialPort`] and [`PortFactory`] traits so the
//! whole host can be driven by the in-memory [`mock`] device.

pub mod mock;
pub mod sender;
pub mod serial;

use fdmlink_core::ConnectionError;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Baud rates probed after the configured one, in order
pub const DEFAULT_BAUD_ROTATION: [u32; 7] = [115200, 250000, 230400, 57600, 38400, 19200, 9600];

/// Byte stream to and from the printer
///
/// A port is split into a reader half (owned by the listen thread) and a
/// writer half (owned by the sender) with [`try_clone`](SerialPort::try_clone);
/// both halves share one OS handle.
pub trait SerialPort: Send {
    /// Read available bytes, blocking up to the configured timeout
    ///
    /// A timeout surfaces as `io::ErrorKind::TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush buffered output to the device
    fn flush(&mut self) -> io::Result<()>;

    /// Port name (e.g. `/dev/ttyACM0`, `COM3`)
    fn name(&self) -> String;

    /// Change the read timeout
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Change the baud rate of an open port
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    /// Current baud rate
    fn baud_rate(&self) -> io::Result<u32>;

    /// Open a second handle onto the same port
    fn try_clone(&self) -> io::Result<Box<dyn SerialPort>>;
}

/// Opens serial ports by name
pub trait PortFactory: Send + Sync {
    /// Open `port` at `baud_rate` with the given read timeout
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialPort>, ConnectionError>;
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Serial port name
    pub port: String,
    /// Preferred baud rate, tried first
    pub baud_rate: u32,
    /// Fallback baud rates, tried in order after `baud_rate`
    pub baud_rotation: Vec<u32>,
    /// Listener read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Wait after opening the port for the board to finish rebooting
    pub boot_delay_ms: u64,
    /// Accept a baud rate only after the device answers readable `M105`s
    pub verify_baud: bool,
    /// How long to wait for answers while verifying a baud rate
    pub probe_timeout_ms: u64,
    /// Number of readable answers needed to accept a baud rate
    pub required_responses: u32,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 250000,
            baud_rotation: DEFAULT_BAUD_ROTATION.to_vec(),
            read_timeout_ms: 2000,
            boot_delay_ms: 2000,
            verify_baud: true,
            probe_timeout_ms: 3000,
            required_responses: 3,
        }
    }
}

impl ConnectionParams {
    /// Parameters for `port` with every other field at its default
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Baud rates to try, configured rate first, without duplicates
    pub fn baud_candidates(&self) -> Vec<u32> {
        let mut candidates = vec![self.baud_rate];
        for &baud in &self.baud_rotation {
            if !candidates.contains(&baud) {
                candidates.push(baud);
            }
        }
        candidates
    }

    /// Listener read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Post-open settle delay
    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }

    /// Baud verification window
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Check the parameters for obvious mistakes
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let invalid = |reason: &str| ConnectionError::InvalidParameters {
            reason: reason.to_string(),
        };
        if self.port.trim().is_empty() {
            return Err(invalid("port name is empty"));
        }
        if self.baud_rate == 0 || self.baud_rotation.contains(&0) {
            return Err(invalid("baud rate must be positive"));
        }
        if self.read_timeout_ms == 0 {
            return Err(invalid("read timeout must be positive"));
        }
        if self.verify_baud && self.required_responses == 0 {
            return Err(invalid("baud verification needs at least one response"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_candidates_configured_first() {
        let params = ConnectionParams {
            baud_rate: 57600,
            ..ConnectionParams::for_port("/dev/ttyACM0")
        };
        assert_eq!(
            params.baud_candidates(),
            vec![57600, 115200, 250000, 230400, 38400, 19200, 9600]
        );
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionParams::default().validate().is_err());
        assert!(ConnectionParams::for_port("COM3").validate().is_ok());

        let params = ConnectionParams {
            read_timeout_ms: 0,
            ..ConnectionParams::for_port("COM3")
        };
        assert!(matches!(
            params.validate(),
            Err(ConnectionError::InvalidParameters { .. })
        ));
    }
}
