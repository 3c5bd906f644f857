//! fdmlink Settings Crate
//!
//! Loads, validates and saves the fdmlink configuration.

pub mod config;
pub mod error;

pub use config::{Config, MachineSettings, APP_DIR, CONFIG_FILE, MAX_EXTRUDERS};
pub use error::{ConfigError, ConfigResult, SettingsError, SettingsResult};
