//! Firmware identification
//!
//! Parses the version the device announces in its boot banner or `M115`
//! report, and decides whether a release is an upgrade.

use crate::error::FirmwareError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Printer family a firmware build targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineFamily {
    /// BCN3D Sigma
    Sigma,
    /// BCN3D Sigmax
    SigmaX,
    /// Any other family, lowercase tag
    Other(String),
}

impl MachineFamily {
    /// Parse a family tag such as `bcn3dsigmax`, `Sigma` or `Sigma X`
    pub fn from_tag(tag: &str) -> Self {
        let normalized: String = tag
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let stripped = normalized.strip_prefix("bcn3d").unwrap_or(&normalized);
        match stripped {
            "sigmax" => MachineFamily::SigmaX,
            "sigma" => MachineFamily::Sigma,
            _ => MachineFamily::Other(normalized),
        }
    }

    /// Detect the family from a firmware file or asset name
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.contains("sigmax") {
            Some(MachineFamily::SigmaX)
        } else if lower.contains("sigma") {
            Some(MachineFamily::Sigma)
        } else {
            None
        }
    }

    /// Canonical tag used for release lookups
    pub fn tag(&self) -> &str {
        match self {
            MachineFamily::Sigma => "bcn3dsigma",
            MachineFamily::SigmaX => "bcn3dsigmax",
            MachineFamily::Other(tag) => tag,
        }
    }
}

impl fmt::Display for MachineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Parsed firmware version
///
/// Ordering compares the numeric triple first; for equal numbers a
/// prerelease sorts before the release. The family tag does not take part
/// in ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
    /// Prerelease label (`rc1`, `beta`, ...)
    pub prerelease: Option<String>,
    /// Machine family announced alongside the version
    pub family: Option<MachineFamily>,
}

impl FirmwareVersion {
    /// Create a release version
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            family: None,
        }
    }

    /// Attach a prerelease label
    pub fn with_prerelease(mut self, label: impl Into<String>) -> Self {
        self.prerelease = Some(label.into());
        self
    }

    /// Attach a machine family
    pub fn with_family(mut self, family: MachineFamily) -> Self {
        self.family = Some(family);
        self
    }

    /// Parse a version token such as `v1.2.3`, `01.02.00-rc1` or `2.0`
    pub fn parse(text: &str) -> Result<Self, FirmwareError> {
        let invalid = || FirmwareError::InvalidVersion {
            version: text.to_string(),
        };
        let token = text.trim();
        let token = token
            .strip_prefix('v')
            .or_else(|| token.strip_prefix('V'))
            .unwrap_or(token);

        let (numbers, prerelease) = match token.split_once('-') {
            Some((numbers, label)) if !label.is_empty() => (numbers, Some(label.to_string())),
            Some(_) => return Err(invalid()),
            None => (token, None),
        };

        let parts: Vec<&str> = numbers.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(invalid());
        }
        let mut values = [0u32; 3];
        for (slot, part) in values.iter_mut().zip(&parts) {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self {
            major: values[0],
            minor: values[1],
            patch: values[2],
            prerelease,
            family: None,
        })
    }

    /// Whether `line` is nothing but a version token
    pub fn is_version(line: &str) -> bool {
        let line = line.trim();
        !line.is_empty() && !line.contains(char::is_whitespace) && Self::parse(line).is_ok()
    }

    /// Extract the version from a boot banner or `M115` report
    ///
    /// Recognizes `FIRMWARE_VERSION:<v>` (with `MACHINE_TYPE:<family>`
    /// when present) and banner lines that consist of a bare version.
    pub fn from_banner(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(version) = banner_field(line, "FIRMWARE_VERSION") {
            let mut parsed = Self::parse(&version).ok()?;
            parsed.family = banner_field(line, "MACHINE_TYPE").map(|t| MachineFamily::from_tag(&t));
            return Some(parsed);
        }
        if Self::is_version(line) {
            return Self::parse(line).ok();
        }
        None
    }

    /// Whether this build is a prerelease
    pub fn is_prerelease(&self) -> bool {
        self.prerelease.is_some()
    }

    /// Whether flashing `latest` over this version is worthwhile
    ///
    /// Prerelease builds are always upgradable, even when numerically equal
    /// to or newer than the latest release.
    pub fn is_upgradable_to(&self, latest: &FirmwareVersion) -> bool {
        self.is_prerelease() || self < latest
    }

    fn numeric(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

/// Upgrade decision for a cached version that may be unknown
pub fn needs_update(current: Option<&FirmwareVersion>, latest: &FirmwareVersion) -> bool {
    match current {
        None => true,
        Some(current) => current.is_upgradable_to(latest),
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.numeric()
            .cmp(&other.numeric())
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref label) = self.prerelease {
            write!(f, "-{}", label)?;
        }
        Ok(())
    }
}

/// Value of `KEY:` in an `M115` style report, up to `;` or the next key
fn banner_field(line: &str, key: &str) -> Option<String> {
    let marker = format!("{}:", key);
    let start = line.find(&marker)? + marker.len();
    let rest = &line[start..];

    let mut end = rest.find(';').unwrap_or(rest.len());
    for (i, _) in rest.match_indices(' ') {
        if i >= end {
            break;
        }
        let next = &rest[i + 1..];
        let is_key = next
            .split_once(':')
            .map(|(k, _)| !k.is_empty() && k.chars().all(|c| c.is_ascii_uppercase() || c == '_'))
            .unwrap_or(false);
        if is_key {
            end = i;
            break;
        }
    }

    let value = rest[..end].trim();
    (!value.is_empty()).then(|| value.to_string())
}
