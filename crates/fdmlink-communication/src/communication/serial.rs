//! Serial port implementation
//!
//! Provides the hardware-backed [`SerialPort`] on top of the `serialport`
//! crate.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Opening at a given baud rate with a bounded read timeout
//! - Re-clocking an open port (after leaving the bootloader)
//! - Splitting a port into reader and writer halves

use super::{PortFactory, SerialPort};
use fdmlink_core::{ConnectionError, Error, Result};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Arduino Mega 2560")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }

    /// Set USB details
    fn with_usb(mut self, usb: &serialport::UsbPortInfo) -> Self {
        self.vid = Some(usb.vid);
        self.pid = Some(usb.pid);
        self.manufacturer = usb.manufacturer.clone();
        self.serial_number = usb.serial_number.clone();
        self
    }
}

/// List serial ports a printer may be attached to
///
/// Filters to the usual USB CDC/serial adapter names:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::other(format!("Failed to enumerate ports: {}", e))
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, describe(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => info.with_usb(usb),
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name looks like a USB printer connection
fn is_printer_port(port_name: &str) -> bool {
    if let Some(number) = port_name.strip_prefix("COM") {
        return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
    }

    port_name.starts_with("/dev/ttyUSB")
        || port_name.starts_with("/dev/ttyACM")
        || port_name.starts_with("/dev/cu.usbserial")
        || port_name.starts_with("/dev/cu.usbmodem")
}

fn describe(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Hardware serial port backed by the `serialport` crate
pub struct RealSerialPort {
    name: String,
    port: Box<dyn serialport::SerialPort>,
}

impl RealSerialPort {
    /// Open `name` at `baud_rate` (8N1, no flow control)
    pub fn open(
        name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> std::result::Result<Self, ConnectionError> {
        let port = serialport::new(name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                tracing::warn!("Failed to open serial port {} at {}: {}", name, baud_rate, e);
                match e.kind() {
                    serialport::ErrorKind::NoDevice
                    | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                        ConnectionError::PortNotFound {
                            port: name.to_string(),
                        }
                    }
                    _ => ConnectionError::FailedToOpen {
                        port: name.to_string(),
                        reason: e.to_string(),
                    },
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            port,
        })
    }
}

impl SerialPort for RealSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Write::flush(&mut self.port)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud_rate).map_err(io::Error::from)
    }

    fn baud_rate(&self) -> io::Result<u32> {
        self.port.baud_rate().map_err(io::Error::from)
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialPort>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(RealSerialPort {
            name: self.name.clone(),
            port,
        }))
    }
}

/// Opens [`RealSerialPort`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortFactory;

impl PortFactory for SerialPortFactory {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> std::result::Result<Box<dyn SerialPort>, ConnectionError> {
        Ok(Box::new(RealSerialPort::open(port, baud_rate, timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printer_port_names() {
        assert!(is_printer_port("COM3"));
        assert!(is_printer_port("/dev/ttyACM0"));
        assert!(is_printer_port("/dev/ttyUSB1"));
        assert!(is_printer_port("/dev/cu.usbmodem14101"));
        assert!(!is_printer_port("COM"));
        assert!(!is_printer_port("COMX"));
        assert!(!is_printer_port("/dev/ttyS0"));
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = RealSerialPort::open(
            "/dev/ttyACM-does-not-exist",
            115200,
            Duration::from_millis(10),
        );
        assert!(result.is_err());
    }
}
