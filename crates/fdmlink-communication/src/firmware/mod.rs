//! Firmware reprogramming
//!
//! Resolves an image (a local Intel HEX file or the latest release for the
//! printer family), decides whether flashing is worth it and drives the
//! in-system programmer. Every run ends in one [`FirmwareUpdateOutcome`].

pub mod image;
pub mod isp;
pub mod release;
pub mod updater;

pub use image::FirmwareImage;
pub use isp::{shared, IspError, IspProgrammer, MockIspProgrammer, SharedIsp};
pub use release::{GithubReleaseSource, ReleaseInfo, ReleaseSource, StaticReleaseSource};
pub use updater::{FirmwareUpdater, UpdateTarget};

use fdmlink_core::{FirmwareError, MachineFamily};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Where the image to flash comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    /// A local Intel HEX file
    File(PathBuf),
    /// The latest release published for the printer family
    Latest,
}

/// Result of a firmware update run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareUpdateOutcome {
    /// Image written
    Completed,
    /// Programmer failed for an unclassified reason
    UnknownError,
    /// Programmer could not be reached
    CommunicationError,
    /// Serial I/O failed while programming
    IoError,
    /// No usable image (download failed, unreadable file, wrong family)
    MissingImage,
    /// Device already runs the latest release
    AlreadyLatest,
}

impl FirmwareUpdateOutcome {
    /// Numeric code reported to callers; `0` is success
    pub fn code(&self) -> u8 {
        match self {
            FirmwareUpdateOutcome::Completed => 0,
            FirmwareUpdateOutcome::UnknownError => 1,
            FirmwareUpdateOutcome::CommunicationError => 2,
            FirmwareUpdateOutcome::IoError => 3,
            FirmwareUpdateOutcome::MissingImage => 4,
            FirmwareUpdateOutcome::AlreadyLatest => 5,
        }
    }

    /// Outcome for a numeric code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FirmwareUpdateOutcome::Completed),
            1 => Some(FirmwareUpdateOutcome::UnknownError),
            2 => Some(FirmwareUpdateOutcome::CommunicationError),
            3 => Some(FirmwareUpdateOutcome::IoError),
            4 => Some(FirmwareUpdateOutcome::MissingImage),
            5 => Some(FirmwareUpdateOutcome::AlreadyLatest),
            _ => None,
        }
    }

    /// Whether the image was written
    pub fn is_success(&self) -> bool {
        *self == FirmwareUpdateOutcome::Completed
    }

    /// Human readable description
    pub fn description(&self) -> &'static str {
        match self {
            FirmwareUpdateOutcome::Completed => "Firmware updated",
            FirmwareUpdateOutcome::UnknownError => "Unknown error while updating firmware",
            FirmwareUpdateOutcome::CommunicationError => "Could not communicate with the printer",
            FirmwareUpdateOutcome::IoError => "I/O error while writing firmware",
            FirmwareUpdateOutcome::MissingImage => "Firmware image missing or unusable",
            FirmwareUpdateOutcome::AlreadyLatest => "Printer already runs the latest firmware",
        }
    }
}

impl fmt::Display for FirmwareUpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Release lookup and programming settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Release metadata URL per machine family tag
    pub release_endpoints: BTreeMap<String, String>,
    /// `User-Agent` sent to the release API
    pub user_agent: String,
    /// HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Wait between programmer connect and the connected check
    pub isp_settle_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        let mut release_endpoints = BTreeMap::new();
        release_endpoints.insert(
            MachineFamily::Sigma.tag().to_string(),
            "https://api.github.com/repos/bcn3d/bcn3dsigma-firmware/releases/latest".to_string(),
        );
        release_endpoints.insert(
            MachineFamily::SigmaX.tag().to_string(),
            "https://api.github.com/repos/bcn3d/bcn3dsigmax-firmware/releases/latest".to_string(),
        );
        Self {
            release_endpoints,
            user_agent: format!("fdmlink/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 30,
            isp_settle_ms: 1000,
        }
    }
}

impl FirmwareConfig {
    /// Release metadata URL for `family`
    pub fn endpoint_for(&self, family: &MachineFamily) -> Result<&str, FirmwareError> {
        self.release_endpoints
            .get(family.tag())
            .map(String::as_str)
            .ok_or_else(|| FirmwareError::UnknownFamily {
                family: family.to_string(),
            })
    }

    /// HTTP timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Programmer settle delay
    pub fn isp_settle(&self) -> Duration {
        Duration::from_millis(self.isp_settle_ms)
    }
}
