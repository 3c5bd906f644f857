//! Cached device telemetry
//!
//! Written by the listen thread, read by anyone. Kept apart from the
//! sender lock so a slow reader of temperatures never stalls streaming.

use crate::protocol::TemperatureReport;
use fdmlink_core::{Endstop, EndstopStates, FirmwareVersion, Temperatures};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Temperatures, endstops, firmware identity and timers
#[derive(Debug, Default)]
pub struct Telemetry {
    temperatures: RwLock<Temperatures>,
    endstops: RwLock<EndstopStates>,
    firmware_version: RwLock<Option<FirmwareVersion>>,
    latest_firmware: RwLock<Option<FirmwareVersion>>,
    bed_preheat_deadline: Mutex<Option<Instant>>,
    endstop_polling: AtomicBool,
    version_probe_sent: AtomicBool,
}

impl Telemetry {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the temperature cache
    pub fn temperatures(&self) -> Temperatures {
        self.temperatures.read().clone()
    }

    /// Merge a temperature report; returns `true` when anything changed
    ///
    /// Readings for extruders beyond `extruder_count` are dropped.
    pub fn apply_temperatures(&self, report: &TemperatureReport, extruder_count: usize) -> bool {
        let mut temperatures = self.temperatures.write();
        let before = temperatures.clone();
        for &(index, reading) in &report.hotends {
            if index < extruder_count {
                temperatures.set_hotend(index, reading);
            }
        }
        if let Some(bed) = report.bed {
            temperatures.bed = Some(bed);
        }
        *temperatures != before
    }

    /// Snapshot of the endstop cache
    pub fn endstops(&self) -> EndstopStates {
        self.endstops.read().clone()
    }

    /// Record an endstop report; returns `true` on a transition
    pub fn update_endstop(&self, endstop: Endstop, triggered: bool) -> bool {
        self.endstops.write().update(endstop, triggered)
    }

    /// Firmware version announced by the device, if known
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.firmware_version.read().clone()
    }

    /// Store the announced version; returns `true` if none was known
    pub fn set_firmware_version(&self, version: FirmwareVersion) -> bool {
        let mut current = self.firmware_version.write();
        let first = current.is_none();
        if first {
            *current = Some(version);
            self.version_probe_sent.store(false, Ordering::SeqCst);
        }
        first
    }

    /// Forget the cached version so the next boot banner is picked up
    pub fn invalidate_firmware_version(&self) {
        *self.firmware_version.write() = None;
        self.version_probe_sent.store(false, Ordering::SeqCst);
    }

    /// Latest released version, if it has been looked up
    pub fn latest_firmware(&self) -> Option<FirmwareVersion> {
        self.latest_firmware.read().clone()
    }

    /// Store the latest released version
    pub fn set_latest_firmware(&self, version: Option<FirmwareVersion>) {
        *self.latest_firmware.write() = version;
    }

    /// Claim the single version probe allowed while the version is unknown
    pub fn claim_version_probe(&self) -> bool {
        self.firmware_version.read().is_none()
            && !self.version_probe_sent.swap(true, Ordering::SeqCst)
    }

    /// Start or stop a bed preheat countdown
    pub fn set_bed_preheat_deadline(&self, deadline: Option<Instant>) {
        *self.bed_preheat_deadline.lock() = deadline;
    }

    /// Time left on the bed preheat countdown
    pub fn bed_preheat_deadline(&self) -> Option<Instant> {
        *self.bed_preheat_deadline.lock()
    }

    /// Clear the countdown if it expired by `now`; returns whether it did
    pub fn take_expired_bed_preheat(&self, now: Instant) -> bool {
        let mut deadline = self.bed_preheat_deadline.lock();
        match *deadline {
            Some(at) if at <= now => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Enable or disable `M119` polling
    pub fn set_endstop_polling(&self, enabled: bool) {
        self.endstop_polling.store(enabled, Ordering::SeqCst);
    }

    /// Whether `M119` polling is enabled
    pub fn endstop_polling(&self) -> bool {
        self.endstop_polling.load(Ordering::SeqCst)
    }

    /// Drop everything learned from the device
    pub fn reset(&self) {
        *self.temperatures.write() = Temperatures::default();
        *self.endstops.write() = EndstopStates::default();
        *self.bed_preheat_deadline.lock() = None;
        self.version_probe_sent.store(false, Ordering::SeqCst);
    }
}
