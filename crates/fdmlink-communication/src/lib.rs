//! # fdmlink Communication
//!
//! Host side of a USB-attached FDM printer running Marlin-style firmware.
//! Streams checksummed G-code under a byte-budget flow-control window,
//! parses device output on a dedicated listen thread, drives the print
//! job state machine and reflashes firmware through an in-system
//! programmer.

pub mod communication;
pub mod firmware;
pub mod printer;
pub mod protocol;

pub use communication::{
    mock::{MockDevice, MockPortFactory, MockSerialPort},
    sender::{FillReport, Sender, SenderConfig},
    serial::{list_ports, RealSerialPort, SerialPortFactory, SerialPortInfo},
    ConnectionParams, PortFactory, SerialPort, DEFAULT_BAUD_ROTATION,
};

pub use firmware::{
    FirmwareConfig, FirmwareImage, FirmwareSource, FirmwareUpdateOutcome, FirmwareUpdater,
    GithubReleaseSource, IspError, IspProgrammer, MockIspProgrammer, ReleaseInfo, ReleaseSource,
    SharedIsp, StaticReleaseSource, UpdateTarget,
};

pub use printer::{
    ConnectionManager, JobController, Listener, MotionProfile, Telemetry, UsbPrinter,
    UsbPrinterBuilder,
};

pub use protocol::{
    checksum, prepare_command, prepare_line, DeviceResponse, FramedLine, ResponseParser,
};
