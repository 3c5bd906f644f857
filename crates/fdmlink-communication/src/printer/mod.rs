//! USB printer
//!
//! [`UsbPrinter`] is the caller-facing handle. It wires the connection
//! manager, job controller, telemetry cache and firmware updater together
//! and turns caller requests into commands sent through the window.
//!
//! Everything the printer does is reported on its own [`EventBus`].

pub mod connection;
pub mod job;
pub mod listener;
pub mod telemetry;

pub use connection::ConnectionManager;
pub use job::{JobController, MotionProfile};
pub use listener::{Listener, DISCONNECTED_MESSAGE};
pub use telemetry::Telemetry;

use crate::communication::sender::SenderConfig;
use crate::communication::serial::SerialPortFactory;
use crate::communication::{ConnectionParams, PortFactory};
use crate::firmware::{
    FirmwareConfig, FirmwareSource, FirmwareUpdateOutcome, FirmwareUpdater, GithubReleaseSource,
    ReleaseSource, SharedIsp, UpdateTarget,
};
use fdmlink_core::{
    needs_update, ConnectionError, EndstopStates, EventBus, FirmwareError, FirmwareVersion,
    MachineFamily, PrinterError, PrinterEvent, PrinterState, ProgressInfo, Result, Temperatures,
    ToolheadState,
};
use job::format_number;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Assembles a [`UsbPrinter`]
///
/// Defaults: real serial ports, no in-system programmer, GitHub release
/// lookup, one extruder and an unknown machine family.
pub struct UsbPrinterBuilder {
    params: ConnectionParams,
    streaming: SenderConfig,
    motion: MotionProfile,
    firmware: FirmwareConfig,
    family: Option<MachineFamily>,
    extruder_count: usize,
    factory: Option<Arc<dyn PortFactory>>,
    isp: Option<SharedIsp>,
    releases: Option<Arc<dyn ReleaseSource>>,
    events: Option<Arc<EventBus>>,
}

impl UsbPrinterBuilder {
    /// Start from the connection parameters
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            streaming: SenderConfig::default(),
            motion: MotionProfile::default(),
            firmware: FirmwareConfig::default(),
            family: None,
            extruder_count: 1,
            factory: None,
            isp: None,
            releases: None,
            events: None,
        }
    }

    /// Window and polling settings
    pub fn streaming(mut self, streaming: SenderConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Pause, resume and finish moves
    pub fn motion(mut self, motion: MotionProfile) -> Self {
        self.motion = motion;
        self
    }

    /// Release lookup and programmer settings
    pub fn firmware(mut self, firmware: FirmwareConfig) -> Self {
        self.firmware = firmware;
        self
    }

    /// Machine family, used when the device has not announced one
    pub fn family(mut self, family: MachineFamily) -> Self {
        self.family = Some(family);
        self
    }

    /// Number of extruders
    pub fn extruder_count(mut self, count: usize) -> Self {
        self.extruder_count = count.max(1);
        self
    }

    /// Port factory (mock ports in tests)
    pub fn port_factory(mut self, factory: Arc<dyn PortFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// In-system programmer on the printer's serial line
    pub fn isp(mut self, isp: SharedIsp) -> Self {
        self.isp = Some(isp);
        self
    }

    /// Where firmware releases come from
    pub fn release_source(mut self, releases: Arc<dyn ReleaseSource>) -> Self {
        self.releases = Some(releases);
        self
    }

    /// Share an existing event bus
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the printer in the `Closed` state
    pub fn build(self) -> Result<UsbPrinter> {
        let releases: Arc<dyn ReleaseSource> = match self.releases {
            Some(releases) => releases,
            None => Arc::new(GithubReleaseSource::new(self.firmware.clone())?),
        };
        let factory: Arc<dyn PortFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(SerialPortFactory),
        };
        let events = self.events.unwrap_or_else(|| Arc::new(EventBus::new()));

        let job = Arc::new(JobController::new(
            self.streaming,
            self.motion,
            self.extruder_count,
            Arc::clone(&events),
        ));
        let telemetry = Arc::new(Telemetry::new());
        let connection = Arc::new(ConnectionManager::new(
            factory,
            self.isp,
            self.params,
            Arc::clone(&job),
            Arc::clone(&telemetry),
        ));

        Ok(UsbPrinter {
            connection,
            job,
            telemetry,
            releases,
            firmware: self.firmware,
            family: self.family,
            firmware_thread: Mutex::new(None),
        })
    }
}

/// A 3D printer on a USB serial line
pub struct UsbPrinter {
    connection: Arc<ConnectionManager>,
    job: Arc<JobController>,
    telemetry: Arc<Telemetry>,
    releases: Arc<dyn ReleaseSource>,
    firmware: FirmwareConfig,
    family: Option<MachineFamily>,
    firmware_thread: Mutex<Option<JoinHandle<FirmwareUpdateOutcome>>>,
}

impl UsbPrinter {
    /// Builder starting from the connection parameters
    pub fn builder(params: ConnectionParams) -> UsbPrinterBuilder {
        UsbPrinterBuilder::new(params)
    }

    // Connection.

    /// Open the port on the connect thread
    pub fn connect(&self) -> Result<()> {
        self.connection.connect()?;
        Ok(())
    }

    /// Open the port on the calling thread
    pub fn connect_blocking(&self) -> Result<()> {
        self.connection.connect_blocking()?;
        Ok(())
    }

    /// Block until a pending connect finished
    pub fn wait_for_connect(&self) {
        self.connection.wait_for_connect();
    }

    /// Close the port; any job is dropped
    pub fn close(&self) {
        self.connection.close();
    }

    /// The connection manager
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    // Printing.

    /// Start streaming `program`
    ///
    /// `estimate` is the slicer's total print time, used for the remaining
    /// time.
    pub fn start_print<I, S>(&self, program: I, estimate: Option<Duration>) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.job.start_print(program, estimate)
    }

    /// Send one caller command
    pub fn send_command(&self, command: &str) -> Result<()> {
        self.job.send_command(command)
    }

    /// Pause the running print
    pub fn pause(&self) -> Result<()> {
        self.job.pause()
    }

    /// Resume a paused print
    pub fn resume(&self) -> Result<()> {
        self.job.resume()
    }

    /// Cancel the print and make the machine safe
    pub fn cancel_print(&self) -> Result<()> {
        self.job.cancel()
    }

    // Heating.

    /// Heat the bed, switching it off again after `duration`
    pub fn preheat_bed(&self, temperature: f64, duration: Option<Duration>) -> Result<()> {
        self.send_raw(&format!("M140 S{}", format_number(temperature)))?;
        let deadline = duration.map(|d| Instant::now() + d);
        self.telemetry.set_bed_preheat_deadline(deadline);
        tracing::info!("Preheating bed to {}", temperature);
        Ok(())
    }

    /// Switch the bed heater off
    pub fn cancel_preheat_bed(&self) -> Result<()> {
        self.telemetry.set_bed_preheat_deadline(None);
        self.send_raw("M140 S0")
    }

    /// Heat one hotend
    pub fn preheat_hotend(&self, index: usize, temperature: f64) -> Result<()> {
        self.check_extruder(index)?;
        self.send_raw(&format!("M104 T{} S{}", index, format_number(temperature)))
    }

    /// Switch one hotend heater off
    pub fn cancel_preheat_hotend(&self, index: usize) -> Result<()> {
        self.check_extruder(index)?;
        self.send_raw(&format!("M104 T{} S0", index))
    }

    // Motion.

    /// Push `distance` mm of filament through the active hotend
    pub fn purge(&self, distance: f64, speed: f64) -> Result<()> {
        let mut commands = vec![
            "M83".to_string(),
            format!("G1 E{} F{}", format_number(distance), format_number(speed)),
        ];
        if !self.job.toolhead().extrusion_is_relative() {
            commands.push("M82".to_string());
        }
        self.send_all(&commands)
    }

    /// Select the active extruder
    pub fn set_extruder(&self, index: usize) -> Result<()> {
        self.check_extruder(index)?;
        self.send_raw(&format!("T{}", index))
    }

    /// Home X and Y
    pub fn home_head(&self) -> Result<()> {
        self.send_raw("G28 X0 Y0")
    }

    /// Home every axis
    pub fn home_bed(&self) -> Result<()> {
        self.send_raw("G28")
    }

    /// Move the head relative to where it is
    pub fn move_head(&self, x: f64, y: f64, z: f64, speed: f64) -> Result<()> {
        self.send_all(&[
            "G91".to_string(),
            format!(
                "G0 X{} Y{} Z{} F{}",
                format_number(x),
                format_number(y),
                format_number(z),
                format_number(speed)
            ),
            "G90".to_string(),
        ])
    }

    /// Move the head to an absolute position
    pub fn set_head_position(&self, x: f64, y: f64, z: f64, speed: f64) -> Result<()> {
        self.send_all(&[
            "G90".to_string(),
            format!(
                "G0 X{} Y{} Z{} F{}",
                format_number(x),
                format_number(y),
                format_number(z),
                format_number(speed)
            ),
        ])
    }

    /// Start polling endstops with `M119`
    pub fn start_endstop_polling(&self) {
        self.telemetry.set_endstop_polling(true);
    }

    /// Stop polling endstops
    pub fn stop_endstop_polling(&self) {
        self.telemetry.set_endstop_polling(false);
    }

    // Firmware.

    /// Flash firmware on the firmware thread
    ///
    /// The connection is closed first. On success the cached version is
    /// dropped and the printer reconnects; on failure it stays closed.
    /// The outcome is published as [`PrinterEvent::FirmwareUpdateFinished`].
    pub fn update_firmware(&self, source: FirmwareSource) -> Result<()> {
        if !self.connection.begin_firmware_update() {
            return Err(FirmwareError::UpdateInProgress.into());
        }
        let run = self.firmware_run();

        let handle = thread::Builder::new()
            .name("fdmlink-firmware".to_string())
            .spawn(move || run.execute(&source));
        match handle {
            Ok(handle) => {
                *self.firmware_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.connection.end_firmware_update();
                Err(ConnectionError::IoError {
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Flash firmware on the calling thread
    pub fn update_firmware_blocking(&self, source: FirmwareSource) -> Result<FirmwareUpdateOutcome> {
        if !self.connection.begin_firmware_update() {
            return Err(FirmwareError::UpdateInProgress.into());
        }
        Ok(self.firmware_run().execute(&source))
    }

    /// Wait for the firmware thread; `None` if no update was started
    pub fn wait_for_firmware_update(&self) -> Option<FirmwareUpdateOutcome> {
        let handle = self.firmware_thread.lock().take()?;
        handle.join().ok()
    }

    /// Whether a firmware update is running
    pub fn is_updating_firmware(&self) -> bool {
        self.connection.is_updating_firmware()
    }

    /// Look up the latest release for this printer's family
    pub fn check_latest(&self) -> Result<FirmwareVersion> {
        let family = self.family().ok_or_else(|| FirmwareError::UnknownFamily {
            family: "unknown".to_string(),
        })?;
        let release = self.releases.latest(&family)?;
        self.telemetry.set_latest_firmware(Some(release.version.clone()));
        Ok(release.version)
    }

    /// Whether the looked-up latest release is worth flashing
    ///
    /// `false` until [`check_latest`](Self::check_latest) succeeded.
    pub fn update_available(&self) -> bool {
        match self.telemetry.latest_firmware() {
            Some(latest) => needs_update(self.firmware_version().as_ref(), &latest),
            None => false,
        }
    }

    // Accessors.

    /// Current state
    pub fn state(&self) -> PrinterState {
        self.job.state()
    }

    /// Progress of the running job
    pub fn progress(&self) -> ProgressInfo {
        self.job.progress()
    }

    /// Estimated time left
    pub fn remaining_time(&self) -> Option<Duration> {
        self.job.remaining_time()
    }

    /// Last issued toolhead state
    pub fn toolhead(&self) -> ToolheadState {
        self.job.toolhead()
    }

    /// Current layer of the running job
    pub fn current_layer(&self) -> Option<i64> {
        self.job.current_layer()
    }

    /// Cached temperatures
    pub fn temperatures(&self) -> Temperatures {
        self.telemetry.temperatures()
    }

    /// Cached endstop states
    pub fn endstops(&self) -> EndstopStates {
        self.telemetry.endstops()
    }

    /// Firmware version the device announced
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.telemetry.firmware_version()
    }

    /// Latest release found by [`check_latest`](Self::check_latest)
    pub fn firmware_latest_version(&self) -> Option<FirmwareVersion> {
        self.telemetry.latest_firmware()
    }

    /// Machine family announced by the device, else the configured one
    pub fn family(&self) -> Option<MachineFamily> {
        self.firmware_version()
            .and_then(|version| version.family)
            .or_else(|| self.family.clone())
    }

    /// Message of the last fault
    pub fn error_message(&self) -> Option<String> {
        self.job.error_message()
    }

    /// Number of extruders
    pub fn extruder_count(&self) -> usize {
        self.job.extruder_count()
    }

    /// Event bus of this printer
    pub fn events(&self) -> &Arc<EventBus> {
        self.job.events()
    }

    /// Job controller
    pub fn job(&self) -> &Arc<JobController> {
        &self.job
    }

    fn send_raw(&self, command: &str) -> Result<()> {
        self.send_all(&[command.to_string()])
    }

    fn send_all(&self, commands: &[String]) -> Result<()> {
        if !self.state().has_port() {
            return Err(PrinterError::NotConnected.into());
        }
        self.job.send_sequence(commands)
    }

    fn check_extruder(&self, index: usize) -> Result<()> {
        let count = self.extruder_count();
        if index >= count {
            return Err(PrinterError::InvalidExtruder { index, count }.into());
        }
        Ok(())
    }

    fn firmware_run(&self) -> FirmwareRun {
        FirmwareRun {
            connection: Arc::clone(&self.connection),
            telemetry: Arc::clone(&self.telemetry),
            events: Arc::clone(self.job.events()),
            updater: FirmwareUpdater::new(
                self.connection.isp().cloned(),
                Arc::clone(&self.releases),
                Arc::clone(self.job.events()),
                self.firmware.isp_settle(),
            ),
            target: UpdateTarget {
                port: self.connection.params().port,
                family: self.family(),
                current: self.firmware_version(),
            },
        }
    }
}

impl Drop for UsbPrinter {
    fn drop(&mut self) {
        if let Some(handle) = self.firmware_thread.get_mut().take() {
            let _ = handle.join();
        }
        self.connection.close();
    }
}

/// Everything the firmware thread needs, detached from the printer
struct FirmwareRun {
    connection: Arc<ConnectionManager>,
    telemetry: Arc<Telemetry>,
    events: Arc<EventBus>,
    updater: FirmwareUpdater,
    target: UpdateTarget,
}

impl FirmwareRun {
    /// Expects the port already claimed with `begin_firmware_update`
    fn execute(self, source: &FirmwareSource) -> FirmwareUpdateOutcome {
        self.connection.close();
        let outcome = self.updater.run(source, &self.target);
        let events = &self.events;

        if outcome.is_success() {
            self.telemetry.invalidate_firmware_version();
            events.publish(PrinterEvent::FirmwareInvalidated);
        }
        tracing::info!("Firmware update finished: {} ({})", outcome, outcome.code());
        events.publish(PrinterEvent::FirmwareUpdateFinished {
            code: outcome.code(),
            description: outcome.description().to_string(),
        });
        self.connection.end_firmware_update();

        if outcome.is_success() {
            if let Err(e) = self.connection.connect() {
                tracing::error!("Unable to reconnect after the firmware update: {}", e);
            }
        }
        outcome
    }
}
