//! # fdmlink
//!
//! USB host for fused-deposition 3D printers running Marlin-derived
//! firmware:
//! - Checksummed, line-numbered G-code streaming under a byte-budget window
//! - Resend recovery, pause/resume/cancel with parking moves
//! - Temperature, endstop and firmware-version telemetry
//! - Firmware flashing through an in-system programmer
//!
//! ## Architecture
//!
//! fdmlink is organized as a workspace with multiple crates:
//!
//! 1. **fdmlink-core** - Error taxonomy, printer data model, firmware versions, event bus
//! 2. **fdmlink-communication** - Serial link, framing, sender, listener, job controller, firmware updater
//! 3. **fdmlink-settings** - Persisted configuration
//! 4. **fdmlink** - This facade and the `fdmlink` command line tool

pub use fdmlink_communication;
pub use fdmlink_core;
pub use fdmlink_settings;

pub use fdmlink_core::{
    needs_update, ConnectionError, Error, EventBus, EventCategory, EventFilter, FirmwareError,
    FirmwareVersion, MachineFamily, PrinterError, PrinterEvent, PrinterState, ProgressInfo,
    ProtocolError, Result, Temperatures, ToolheadState,
};

pub use fdmlink_communication::{
    list_ports, ConnectionParams, FirmwareConfig, FirmwareImage, FirmwareSource,
    FirmwareUpdateOutcome, GithubReleaseSource, MotionProfile, ReleaseSource, SenderConfig,
    SerialPortInfo, UsbPrinter, UsbPrinterBuilder,
};

pub use fdmlink_settings::{Config, ConfigError, MachineSettings, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Environment variable selecting the log format (`json` or anything else for text)
pub const LOG_FORMAT_VAR: &str = "FDMLINK_LOG_FORMAT";

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Output on stderr, keeping stdout for command results
/// - RUST_LOG environment variable support, `info` when unset
/// - JSON lines when `FDMLINK_LOG_FORMAT=json`
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        let fmt_layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_current_span(false);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .with_line_number(true);
        registry.with(fmt_layer).try_init()?;
    }

    Ok(())
}
