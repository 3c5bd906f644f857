//! Configuration for fdmlink
//!
//! Provides configuration file handling and validation. Supports JSON and
//! TOML file formats, stored in the platform configuration directory by
//! default.
//!
//! Configuration is organized into logical sections:
//! - Connection parameters (port, baud rates, timeouts, baud verification)
//! - Streaming (window capacity, priming, acknowledgment and poll timers)
//! - Motion (pause, resume and finish moves)
//! - Machine (family, extruder count)
//! - Firmware (release endpoints, user agent, programmer settle delay)

use crate::error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
use fdmlink_communication::{
    ConnectionParams, FirmwareConfig, MotionProfile, SenderConfig, UsbPrinterBuilder,
};
use fdmlink_core::MachineFamily;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the directory under the platform config directory
pub const APP_DIR: &str = "fdmlink";

/// Default configuration file name
pub const CONFIG_FILE: &str = "config.toml";

/// Largest extruder count a printer may declare
pub const MAX_EXTRUDERS: usize = 8;

/// Machine description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// Family tag (`bcn3dsigma`, `bcn3dsigmax`); unset means "ask the device"
    pub family: Option<String>,
    /// Number of extruders
    pub extruder_count: usize,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            family: None,
            extruder_count: 2,
        }
    }
}

impl MachineSettings {
    /// Configured family, parsed
    pub fn family(&self) -> Option<MachineFamily> {
        self.family.as_deref().map(MachineFamily::from_tag)
    }
}

/// Complete fdmlink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Serial connection parameters
    pub connection: ConnectionParams,
    /// Flow-control window and timers
    pub streaming: SenderConfig,
    /// Pause, resume and finish moves
    pub motion: MotionProfile,
    /// Machine description
    pub machine: MachineSettings,
    /// Release lookup and programming
    pub firmware: FirmwareConfig,
}

enum Format {
    Json,
    Toml,
}

fn format_of(path: &Path) -> ConfigResult<Format> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Format::Json),
        Some("toml") => Ok(Format::Toml),
        other => Err(ConfigError::UnsupportedFormat(
            other.unwrap_or("<none>").to_string(),
        )),
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location (`<config dir>/fdmlink/config.toml`)
    pub fn default_path() -> SettingsResult<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            SettingsError::ConfigDirectory("no configuration directory on this platform".into())
        })?;
        Ok(base.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let format = format_of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            SettingsError::LoadError(format!("{}: {}", path.display(), e))
        })?;

        let config: Self = match format {
            Format::Json => serde_json::from_str(&content)?,
            Format::Toml => toml::from_str(&content)?,
        };
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the file at `path`, or defaults when it does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML), creating parent directories
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = match format_of(path)? {
            Format::Json => serde_json::to_string_pretty(self)?,
            Format::Toml => toml::to_string_pretty(self)?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SettingsError::ConfigDirectory(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Validate configuration
    ///
    /// The port may be empty; it is usually given on the command line.
    pub fn validate(&self) -> ConfigResult<()> {
        let connection = &self.connection;
        if connection.baud_rate == 0 {
            return Err(ConfigError::out_of_range("connection.baud_rate", 0));
        }
        if connection.baud_rotation.contains(&0) {
            return Err(ConfigError::out_of_range("connection.baud_rotation", 0));
        }
        if connection.read_timeout_ms == 0 {
            return Err(ConfigError::out_of_range("connection.read_timeout_ms", 0));
        }
        if connection.verify_baud && connection.required_responses == 0 {
            return Err(ConfigError::out_of_range("connection.required_responses", 0));
        }

        let streaming = &self.streaming;
        if streaming.window_capacity < 16 {
            return Err(ConfigError::out_of_range(
                "streaming.window_capacity",
                streaming.window_capacity,
            ));
        }
        if streaming.ok_timeout_ms == 0 {
            return Err(ConfigError::out_of_range("streaming.ok_timeout_ms", 0));
        }
        if !(0.0..1.0).contains(&streaming.estimate_threshold) {
            return Err(ConfigError::out_of_range(
                "streaming.estimate_threshold",
                streaming.estimate_threshold,
            ));
        }

        let motion = &self.motion;
        for (key, speed) in [
            ("motion.retract_speed", motion.retract_speed),
            ("motion.z_speed", motion.z_speed),
            ("motion.travel_speed", motion.travel_speed),
        ] {
            if speed <= 0.0 {
                return Err(ConfigError::out_of_range(key, speed));
            }
        }

        if self.machine.extruder_count == 0 || self.machine.extruder_count > MAX_EXTRUDERS {
            return Err(ConfigError::out_of_range(
                "machine.extruder_count",
                self.machine.extruder_count,
            ));
        }
        if let Some(family) = self.machine.family() {
            if self.firmware.endpoint_for(&family).is_err() {
                return Err(ConfigError::UnknownFamily(family.to_string()));
            }
        }

        if self.firmware.request_timeout_secs == 0 {
            return Err(ConfigError::out_of_range("firmware.request_timeout_secs", 0));
        }
        Ok(())
    }

    /// Printer builder carrying every section of this config
    ///
    /// A non-empty `port` overrides the configured one.
    pub fn printer_builder(&self, port: Option<&str>) -> UsbPrinterBuilder {
        let mut params = self.connection.clone();
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            params.port = port.to_string();
        }

        let builder = UsbPrinterBuilder::new(params)
            .streaming(self.streaming.clone())
            .motion(self.motion.clone())
            .firmware(self.firmware.clone())
            .extruder_count(self.machine.extruder_count);
        match self.machine.family() {
            Some(family) => builder.family(family),
            None => builder,
        }
    }
}
