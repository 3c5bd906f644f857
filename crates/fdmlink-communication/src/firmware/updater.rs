//! Firmware update run
//!
//! One run resolves the image, checks it against the device and writes it
//! through the programmer. The caller owns the connection: it must be
//! closed before [`FirmwareUpdater::run`] and reopened afterwards.

use super::image::FirmwareImage;
use super::isp::SharedIsp;
use super::release::ReleaseSource;
use super::{FirmwareSource, FirmwareUpdateOutcome};
use fdmlink_core::{needs_update, EventBus, FirmwareVersion, MachineFamily, PrinterEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

/// What is known about the device being flashed
#[derive(Debug, Clone, Default)]
pub struct UpdateTarget {
    /// Serial port the programmer opens
    pub port: String,
    /// Device family, when known
    pub family: Option<MachineFamily>,
    /// Firmware the device last announced
    pub current: Option<FirmwareVersion>,
}

enum ResolvedImage {
    Local(PathBuf),
    Downloaded(NamedTempFile),
}

impl ResolvedImage {
    fn path(&self) -> PathBuf {
        match self {
            ResolvedImage::Local(path) => path.clone(),
            ResolvedImage::Downloaded(file) => file.path().to_path_buf(),
        }
    }
}

/// Drives one firmware update
pub struct FirmwareUpdater {
    isp: Option<SharedIsp>,
    releases: Arc<dyn ReleaseSource>,
    events: Arc<EventBus>,
    settle: Duration,
}

impl FirmwareUpdater {
    /// Create an updater
    pub fn new(
        isp: Option<SharedIsp>,
        releases: Arc<dyn ReleaseSource>,
        events: Arc<EventBus>,
        settle: Duration,
    ) -> Self {
        Self {
            isp,
            releases,
            events,
            settle,
        }
    }

    /// Resolve, check and write the image
    ///
    /// A downloaded image lives in a temporary file that is gone once this
    /// returns.
    pub fn run(&self, source: &FirmwareSource, target: &UpdateTarget) -> FirmwareUpdateOutcome {
        tracing::info!("Updating firmware on {}", target.port);
        self.progress(0.0);

        let resolved = match self.resolve(source, target) {
            Ok(resolved) => resolved,
            Err(outcome) => return outcome,
        };

        let image = match FirmwareImage::load(&resolved.path()) {
            Ok(image) if !image.is_empty() => image,
            Ok(_) => {
                tracing::error!("Firmware image {} is empty", resolved.path().display());
                return FirmwareUpdateOutcome::MissingImage;
            }
            Err(e) => {
                tracing::error!("Unable to read firmware image: {}", e);
                return FirmwareUpdateOutcome::MissingImage;
            }
        };
        if let Err(e) = image.check_family(target.family.as_ref()) {
            tracing::error!("Refusing to flash: {}", e);
            return FirmwareUpdateOutcome::MissingImage;
        }

        let outcome = self.program(&image, &target.port);
        if outcome.is_success() {
            self.progress(100.0);
        }
        outcome
    }

    fn resolve(
        &self,
        source: &FirmwareSource,
        target: &UpdateTarget,
    ) -> Result<ResolvedImage, FirmwareUpdateOutcome> {
        if let FirmwareSource::File(path) = source {
            return Ok(ResolvedImage::Local(path.clone()));
        }

        let Some(family) = target.family.as_ref() else {
            tracing::error!("Unknown machine family, cannot look up the latest firmware");
            return Err(FirmwareUpdateOutcome::MissingImage);
        };
        let release = self.releases.latest(family).map_err(|e| {
            tracing::error!("Unable to get the latest release for {}: {}", family, e);
            FirmwareUpdateOutcome::MissingImage
        })?;

        if !needs_update(target.current.as_ref(), &release.version) {
            tracing::info!(
                "Printer already runs the latest firmware ({})",
                release.version
            );
            return Err(FirmwareUpdateOutcome::AlreadyLatest);
        }

        let file = self.releases.download(&release).map_err(|e| {
            tracing::error!("Unable to download firmware {}: {}", release.version, e);
            FirmwareUpdateOutcome::MissingImage
        })?;
        Ok(ResolvedImage::Downloaded(file))
    }

    fn program(&self, image: &FirmwareImage, port: &str) -> FirmwareUpdateOutcome {
        let Some(isp) = self.isp.as_ref() else {
            tracing::error!("No in-system programmer available");
            return FirmwareUpdateOutcome::CommunicationError;
        };
        let mut programmer = isp.lock();

        if let Err(e) = programmer.connect(port) {
            tracing::warn!("Programmer connect failed: {}", e);
            programmer.close();
        }
        thread::sleep(self.settle);

        if !programmer.is_connected() {
            tracing::error!("Unable to reach the bootloader on {}", port);
            return FirmwareUpdateOutcome::CommunicationError;
        }

        let events = self.events.clone();
        let mut report = move |percent: f64| {
            events.publish(PrinterEvent::FirmwareUpdateProgress(percent));
        };
        let result = programmer.program_chip(image, &mut report);
        programmer.close();

        match result {
            Ok(()) => {
                tracing::info!("Firmware written ({} bytes)", image.len());
                FirmwareUpdateOutcome::Completed
            }
            Err(e) => {
                tracing::error!("Programming failed: {}", e);
                e.outcome()
            }
        }
    }

    fn progress(&self, percent: f64) {
        self.events.publish(PrinterEvent::FirmwareUpdateProgress(percent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::mock::MockDevice;
    use crate::firmware::isp::{shared, IspError, MockIspProgrammer};
    use crate::firmware::release::StaticReleaseSource;
    use std::io::Write;

    const IMAGE: &str = ":0100000001FE\n:00000001FF\n";

    fn updater(isp: Option<MockIspProgrammer>, latest: FirmwareVersion) -> FirmwareUpdater {
        let releases =
            StaticReleaseSource::new().with_release(MachineFamily::Sigma, latest, Some(IMAGE));
        FirmwareUpdater::new(
            isp.map(shared),
            Arc::new(releases),
            Arc::new(EventBus::new()),
            Duration::ZERO,
        )
    }

    fn target(current: Option<FirmwareVersion>) -> UpdateTarget {
        UpdateTarget {
            port: "/dev/ttyACM0".to_string(),
            family: Some(MachineFamily::Sigma),
            current,
        }
    }

    #[test]
    fn test_latest_release_flashed_when_older() {
        let isp = MockIspProgrammer::with_device(MockDevice::new());
        let updater = updater(Some(isp.clone()), FirmwareVersion::new(1, 1, 0));

        let outcome = updater.run(
            &FirmwareSource::Latest,
            &target(Some(FirmwareVersion::new(1, 0, 0))),
        );
        assert_eq!(outcome, FirmwareUpdateOutcome::Completed);
        assert_eq!(isp.programmed_images(), vec![vec![0x01]]);
    }

    #[test]
    fn test_equal_release_is_already_latest() {
        let isp = MockIspProgrammer::with_device(MockDevice::new());
        let updater = updater(Some(isp.clone()), FirmwareVersion::new(1, 1, 0));

        let outcome = updater.run(
            &FirmwareSource::Latest,
            &target(Some(FirmwareVersion::new(1, 1, 0))),
        );
        assert_eq!(outcome, FirmwareUpdateOutcome::AlreadyLatest);
        assert_eq!(isp.connect_calls(), 0);
    }

    #[test]
    fn test_prerelease_always_upgraded() {
        let isp = MockIspProgrammer::with_device(MockDevice::new());
        let updater = updater(Some(isp.clone()), FirmwareVersion::new(1, 1, 0));

        let current = FirmwareVersion::new(1, 1, 0).with_prerelease("rc2");
        let outcome = updater.run(&FirmwareSource::Latest, &target(Some(current)));
        assert_eq!(outcome, FirmwareUpdateOutcome::Completed);
    }

    #[test]
    fn test_unreachable_programmer_is_communication_error() {
        let unreachable = updater(
            Some(MockIspProgrammer::unreachable()),
            FirmwareVersion::new(1, 1, 0),
        );
        let outcome = unreachable.run(&FirmwareSource::Latest, &target(None));
        assert_eq!(outcome, FirmwareUpdateOutcome::CommunicationError);

        let without_isp = updater(None, FirmwareVersion::new(1, 1, 0));
        let outcome = without_isp.run(&FirmwareSource::Latest, &target(None));
        assert_eq!(outcome, FirmwareUpdateOutcome::CommunicationError);
    }

    #[test]
    fn test_programming_failures_map_to_codes() {
        let isp = MockIspProgrammer::with_device(MockDevice::new());
        let updater = updater(Some(isp.clone()), FirmwareVersion::new(1, 1, 0));

        isp.fail_programming(IspError::Io("write failed".into()));
        assert_eq!(
            updater.run(&FirmwareSource::Latest, &target(None)),
            FirmwareUpdateOutcome::IoError
        );

        isp.fail_programming(IspError::Protocol("bad signature".into()));
        assert_eq!(
            updater.run(&FirmwareSource::Latest, &target(None)),
            FirmwareUpdateOutcome::UnknownError
        );
    }

    #[test]
    fn test_missing_or_mismatched_image() {
        let isp = MockIspProgrammer::with_device(MockDevice::new());
        let updater = updater(Some(isp.clone()), FirmwareVersion::new(1, 1, 0));

        let outcome = updater.run(
            &FirmwareSource::File(PathBuf::from("/nonexistent/firmware.hex")),
            &target(None),
        );
        assert_eq!(outcome, FirmwareUpdateOutcome::MissingImage);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bcn3dsigmax-2.0.0.hex");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(IMAGE.as_bytes())
            .unwrap();
        let outcome = updater.run(&FirmwareSource::File(path.clone()), &target(None));
        assert_eq!(outcome, FirmwareUpdateOutcome::MissingImage);
        assert!(path.exists());

        let no_family = UpdateTarget {
            family: None,
            ..target(None)
        };
        assert_eq!(
            updater.run(&FirmwareSource::Latest, &no_family),
            FirmwareUpdateOutcome::MissingImage
        );
        assert!(isp.programmed_images().is_empty());
    }
}
