//! Firmware release lookup
//!
//! The latest release of each printer family is published as a GitHub
//! release whose tag is the version and whose `.hex` asset is the image.

use super::FirmwareConfig;
use fdmlink_core::{FirmwareError, FirmwareVersion, MachineFamily};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

/// A published firmware release
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    /// Release version, family attached
    pub version: FirmwareVersion,
    /// Name of the image asset
    pub asset_name: Option<String>,
    /// Where the image can be downloaded
    pub download_url: Option<String>,
}

/// Source of release metadata and images
pub trait ReleaseSource: Send + Sync {
    /// Latest release for `family`
    fn latest(&self, family: &MachineFamily) -> Result<ReleaseInfo, FirmwareError>;

    /// Download the release image into a temporary file
    ///
    /// The file is deleted when the handle drops.
    fn download(&self, release: &ReleaseInfo) -> Result<NamedTempFile, FirmwareError>;
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

impl GithubRelease {
    fn into_info(self, family: &MachineFamily) -> Result<ReleaseInfo, FirmwareError> {
        let mut version = FirmwareVersion::parse(&self.tag_name)?.with_family(family.clone());
        if self.prerelease && !version.is_prerelease() {
            version = version.with_prerelease("pre");
        }

        let asset = self
            .assets
            .into_iter()
            .find(|asset| asset.name.to_ascii_lowercase().ends_with(".hex"));
        Ok(ReleaseInfo {
            version,
            asset_name: asset.as_ref().map(|a| a.name.clone()),
            download_url: asset.map(|a| a.browser_download_url),
        })
    }
}

fn lookup_error(e: impl std::fmt::Display) -> FirmwareError {
    FirmwareError::ReleaseLookup {
        reason: e.to_string(),
    }
}

fn temp_image(bytes: &[u8], name: Option<&str>) -> Result<NamedTempFile, FirmwareError> {
    // Keep the asset name in the file name; the image family is read from it.
    let prefix = match name {
        Some(name) => format!("fdmlink-{}-", name.trim_end_matches(".hex")),
        None => "fdmlink-firmware-".to_string(),
    };
    let mut file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".hex")
        .tempfile()
        .map_err(lookup_error)?;
    file.write_all(bytes).map_err(lookup_error)?;
    file.flush().map_err(lookup_error)?;
    Ok(file)
}

/// Release source backed by the GitHub releases API
pub struct GithubReleaseSource {
    client: Client,
    config: FirmwareConfig,
}

impl GithubReleaseSource {
    /// Build an HTTP client with the configured user agent and timeout
    pub fn new(config: FirmwareConfig) -> Result<Self, FirmwareError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.request_timeout())
            .build()
            .map_err(lookup_error)?;
        Ok(Self { client, config })
    }
}

impl ReleaseSource for GithubReleaseSource {
    fn latest(&self, family: &MachineFamily) -> Result<ReleaseInfo, FirmwareError> {
        let url = self.config.endpoint_for(family)?;
        tracing::debug!("Fetching latest release for {} from {}", family, url);

        let release: GithubRelease = self
            .client
            .get(url)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(lookup_error)?;
        let info = release.into_info(family)?;
        tracing::info!("Latest {} firmware is {}", family, info.version);
        Ok(info)
    }

    fn download(&self, release: &ReleaseInfo) -> Result<NamedTempFile, FirmwareError> {
        let url = release
            .download_url
            .as_deref()
            .ok_or_else(|| FirmwareError::InvalidImage {
                reason: format!("release {} has no .hex asset", release.version),
            })?;
        tracing::info!("Downloading firmware from {}", url);

        let bytes = self
            .client
            .get(url)
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.bytes())
            .map_err(lookup_error)?;
        let file = temp_image(&bytes, release.asset_name.as_deref())?;
        tracing::debug!("Firmware stored in {}", file.path().display());
        Ok(file)
    }
}

/// Fixed releases, for tests and offline use
#[derive(Debug, Clone, Default)]
pub struct StaticReleaseSource {
    releases: HashMap<String, (ReleaseInfo, Option<String>)>,
}

impl StaticReleaseSource {
    /// Create an empty source; every lookup fails
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `version` for `family` with an optional HEX image
    pub fn with_release(
        mut self,
        family: MachineFamily,
        version: FirmwareVersion,
        image: Option<&str>,
    ) -> Self {
        let asset_name = image.map(|_| format!("{}-firmware-{}.hex", family.tag(), version));
        let info = ReleaseInfo {
            version: version.with_family(family.clone()),
            download_url: asset_name.as_ref().map(|name| format!("static://{}", name)),
            asset_name,
        };
        self.releases.insert(
            family.tag().to_string(),
            (info, image.map(str::to_string)),
        );
        self
    }
}

impl ReleaseSource for StaticReleaseSource {
    fn latest(&self, family: &MachineFamily) -> Result<ReleaseInfo, FirmwareError> {
        self.releases
            .get(family.tag())
            .map(|(info, _)| info.clone())
            .ok_or_else(|| FirmwareError::UnknownFamily {
                family: family.to_string(),
            })
    }

    fn download(&self, release: &ReleaseInfo) -> Result<NamedTempFile, FirmwareError> {
        let image = self
            .releases
            .values()
            .find(|(info, _)| info.download_url == release.download_url)
            .and_then(|(_, image)| image.as_deref())
            .ok_or_else(|| FirmwareError::InvalidImage {
                reason: format!("release {} has no .hex asset", release.version),
            })?;
        temp_image(image.as_bytes(), release.asset_name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_release_json() {
        let json = r#"{
            "tag_name": "v1.3.2",
            "prerelease": false,
            "assets": [
                {"name": "notes.txt", "browser_download_url": "https://example.com/notes.txt"},
                {"name": "bcn3dsigmax-1.3.2.hex", "browser_download_url": "https://example.com/fw.hex"}
            ]
        }"#;
        let release: GithubRelease = serde_json::from_str(json).unwrap();
        let info = release.into_info(&MachineFamily::SigmaX).unwrap();
        assert_eq!(info.version, FirmwareVersion::new(1, 3, 2));
        assert_eq!(info.version.family, Some(MachineFamily::SigmaX));
        assert_eq!(info.download_url.as_deref(), Some("https://example.com/fw.hex"));
    }

    #[test]
    fn test_prerelease_flag_marks_version() {
        let json = r#"{"tag_name": "2.0.0", "prerelease": true}"#;
        let release: GithubRelease = serde_json::from_str(json).unwrap();
        let info = release.into_info(&MachineFamily::Sigma).unwrap();
        assert!(info.version.is_prerelease());
        assert!(info.download_url.is_none());
    }

    #[test]
    fn test_static_source_downloads_to_temp_file() {
        let source = StaticReleaseSource::new().with_release(
            MachineFamily::Sigma,
            FirmwareVersion::new(1, 0, 0),
            Some(":0100000001FE\n:00000001FF\n"),
        );
        let info = source.latest(&MachineFamily::Sigma).unwrap();
        let file = source.download(&info).unwrap();
        let path = file.path().to_path_buf();
        assert!(path.to_string_lossy().contains("bcn3dsigma"));
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());

        assert!(source.latest(&MachineFamily::SigmaX).is_err());
    }
}
