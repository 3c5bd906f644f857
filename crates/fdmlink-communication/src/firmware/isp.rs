//! In-system programmer seam
//!
//! The bootloader protocol itself lives outside this crate; the host only
//! needs connect, program and leave-bootloader over the printer's serial
//! line. [`MockIspProgrammer`] scripts those calls for tests.

use super::image::FirmwareImage;
use super::FirmwareUpdateOutcome;
use crate::communication::mock::MockDevice;
use crate::communication::SerialPort;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Programmer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IspError {
    /// Serial I/O failed
    #[error("ISP I/O error: {0}")]
    Io(String),

    /// The bootloader did not answer
    #[error("Programmer not connected")]
    NotConnected,

    /// The bootloader answered something unexpected
    #[error("ISP protocol error: {0}")]
    Protocol(String),

    /// Read-back did not match what was written
    #[error("Verification failed at address {address:#06x}")]
    VerifyFailed {
        /// First mismatching address.
        address: u32,
    },
}

impl IspError {
    /// Outcome code reported for this failure
    pub fn outcome(&self) -> FirmwareUpdateOutcome {
        match self {
            IspError::Io(_) => FirmwareUpdateOutcome::IoError,
            IspError::NotConnected => FirmwareUpdateOutcome::CommunicationError,
            _ => FirmwareUpdateOutcome::UnknownError,
        }
    }
}

impl From<io::Error> for IspError {
    fn from(e: io::Error) -> Self {
        IspError::Io(e.to_string())
    }
}

/// Bootloader programmer on the printer's serial line
pub trait IspProgrammer: Send {
    /// Open `port` and handshake with the bootloader
    fn connect(&mut self, port: &str) -> Result<(), IspError>;

    /// Whether the handshake succeeded
    fn is_connected(&self) -> bool;

    /// Start the application and hand back the open port
    fn leave_bootloader(&mut self) -> Result<Box<dyn SerialPort>, IspError>;

    /// Write `image`, reporting progress in percent
    fn program_chip(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), IspError>;

    /// Release the port
    fn close(&mut self);
}

/// Programmer shared between the connect and firmware-update threads
pub type SharedIsp = Arc<Mutex<Box<dyn IspProgrammer>>>;

/// Wrap a programmer for sharing
pub fn shared(programmer: impl IspProgrammer + 'static) -> SharedIsp {
    let boxed: Box<dyn IspProgrammer> = Box::new(programmer);
    Arc::new(Mutex::new(boxed))
}

#[derive(Default)]
struct MockIspState {
    device: Option<MockDevice>,
    connected: bool,
    program_failure: Option<IspError>,
    programmed: Vec<Vec<u8>>,
    connect_calls: usize,
}

/// Scripted programmer
///
/// Without a device every connect fails, like a board whose bootloader
/// never answers. Clones share state so a test can inspect what a printer
/// did with its copy.
#[derive(Clone, Default)]
pub struct MockIspProgrammer {
    state: Arc<Mutex<MockIspState>>,
}

impl MockIspProgrammer {
    /// Programmer whose bootloader never answers
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Programmer that reaches the bootloader of `device`
    pub fn with_device(device: MockDevice) -> Self {
        let programmer = Self::default();
        programmer.state.lock().device = Some(device);
        programmer
    }

    /// Make the next `program_chip` calls fail with `error`
    pub fn fail_programming(&self, error: IspError) {
        self.state.lock().program_failure = Some(error);
    }

    /// Images written so far
    pub fn programmed_images(&self) -> Vec<Vec<u8>> {
        self.state.lock().programmed.clone()
    }

    /// Number of connect attempts
    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }
}

impl IspProgrammer for MockIspProgrammer {
    fn connect(&mut self, _port: &str) -> Result<(), IspError> {
        let mut state = self.state.lock();
        state.connect_calls += 1;
        if state.device.is_none() {
            return Err(IspError::NotConnected);
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn leave_bootloader(&mut self) -> Result<Box<dyn SerialPort>, IspError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(IspError::NotConnected);
        }
        state.connected = false;
        let device = state.device.as_ref().ok_or(IspError::NotConnected)?;
        Ok(Box::new(device.port("isp", 115200, Duration::from_millis(100))))
    }

    fn program_chip(
        &mut self,
        image: &FirmwareImage,
        progress: &mut dyn FnMut(f64),
    ) -> Result<(), IspError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(IspError::NotConnected);
        }
        if let Some(error) = state.program_failure.clone() {
            return Err(error);
        }

        let pages = image.pages(256).count().max(1);
        for (index, _) in image.pages(256).enumerate() {
            progress((index + 1) as f64 * 100.0 / pages as f64);
        }
        state.programmed.push(image.data().to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_outcomes() {
        assert_eq!(
            IspError::Io("broken pipe".into()).outcome(),
            FirmwareUpdateOutcome::IoError
        );
        assert_eq!(
            IspError::Protocol("bad signature".into()).outcome(),
            FirmwareUpdateOutcome::UnknownError
        );
        let io: IspError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(io, IspError::Io(_)));
    }

    #[test]
    fn test_unreachable_programmer() {
        let mut isp = MockIspProgrammer::unreachable();
        assert!(isp.connect("/dev/ttyACM0").is_err());
        assert!(!isp.is_connected());
        assert!(isp.leave_bootloader().is_err());
        assert_eq!(isp.connect_calls(), 1);
    }

    #[test]
    fn test_program_reports_progress() {
        let image = FirmwareImage::parse_hex(":0100000001FE\n:00000001FF\n").unwrap();
        let mut isp = MockIspProgrammer::with_device(MockDevice::new());
        isp.connect("/dev/ttyACM0").unwrap();

        let mut last = 0.0;
        isp.program_chip(&image, &mut |p| last = p).unwrap();
        assert_eq!(last, 100.0);
        assert_eq!(isp.programmed_images(), vec![vec![0x01]]);

        assert!(isp.leave_bootloader().is_ok());
        assert!(!isp.is_connected());
    }
}
