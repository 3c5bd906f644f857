//! Response listener
//!
//! The listen thread is the only reader of the serial input. It assembles
//! lines from timed reads, classifies them with [`ResponseParser`] and
//! forwards each response to the job controller or the telemetry cache.
//! Between reads it runs the periodic duties:
//!
//! - `M105` temperature polls, also sent when a read times out on an idle line
//! - `M119` endstop polls while endstop polling is on
//! - a forced acknowledgment when the device goes silent mid-print
//! - switching the bed heater off when a timed preheat expires

use super::job::JobController;
use super::telemetry::Telemetry;
use crate::communication::SerialPort;
use crate::protocol::{DeviceResponse, ResponseParser, TemperatureReport, KEEPALIVE_COMMAND};
use fdmlink_core::{ConnectionError, Error, PrinterEvent, PrinterState};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Message recorded when the serial line fails under the listener
pub const DISCONNECTED_MESSAGE: &str = "Printer has been disconnected";

/// Command asking the firmware to identify itself
pub const VERSION_PROBE_COMMAND: &str = "M115";

/// Command reporting endstop states
pub const ENDSTOP_POLL_COMMAND: &str = "M119";

/// Reader half of a connection plus its periodic duties
pub struct Listener {
    reader: Box<dyn SerialPort>,
    job: Arc<JobController>,
    telemetry: Arc<Telemetry>,
    running: Arc<AtomicBool>,
    parser: ResponseParser,
    partial: Vec<u8>,
    last_temperature_poll: Instant,
    last_endstop_poll: Instant,
    last_progress: Instant,
}

impl Listener {
    /// Create a listener over the reader half of a port
    pub fn new(
        reader: Box<dyn SerialPort>,
        job: Arc<JobController>,
        telemetry: Arc<Telemetry>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let now = Instant::now();
        Self {
            reader,
            job,
            telemetry,
            running,
            parser: ResponseParser::new(),
            partial: Vec::new(),
            last_temperature_poll: now,
            last_endstop_poll: now,
            last_progress: now,
        }
    }

    /// Run the listener on a dedicated thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("fdmlink-listen".to_string())
            .spawn(move || self.run())
    }

    /// Read until the run flag clears or the port fails
    pub fn run(mut self) {
        tracing::debug!("Listener started on {}", self.reader.name());
        while self.running.load(Ordering::SeqCst) {
            if !self.poll_once() {
                break;
            }
        }
        tracing::debug!("Listener stopped");
    }

    /// One timed read followed by the periodic duties
    ///
    /// Returns `false` when the listener must stop.
    pub fn poll_once(&mut self) -> bool {
        let mut buf = [0u8; 256];
        match self.reader.read(&mut buf) {
            Ok(count) => {
                self.partial.extend_from_slice(&buf[..count]);
                self.drain_lines();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ) =>
            {
                self.on_idle(Instant::now())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if self.running.load(Ordering::SeqCst) {
                    tracing::error!("Serial read failed: {}", e);
                    self.job.on_disconnect(DISCONNECTED_MESSAGE);
                }
                return false;
            }
        }

        self.run_timers(Instant::now());
        true
    }

    fn drain_lines(&mut self) {
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=end).collect();
            self.handle_raw_line(&raw[..end]);
        }
    }

    fn handle_raw_line(&mut self, raw: &[u8]) {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(_) => {
                tracing::debug!("Undecodable input ({} bytes)", raw.len());
                if self.telemetry.claim_version_probe() {
                    tracing::info!("Probing firmware version");
                    self.send(VERSION_PROBE_COMMAND, false);
                }
                return;
            }
        };

        tracing::trace!("RX {}", line.trim_end());
        if let Some(response) = self.parser.parse(line) {
            self.handle_response(response);
        }
    }

    /// Act on one classified device response
    pub fn handle_response(&mut self, response: DeviceResponse) {
        match response {
            DeviceResponse::Ack(temperatures) => {
                self.last_progress = Instant::now();
                if let Some(report) = temperatures {
                    self.apply_temperatures(&report);
                }
                self.job.on_ack();
            }
            DeviceResponse::Resend(sequence) => {
                self.last_progress = Instant::now();
                self.job.on_resend(sequence);
            }
            DeviceResponse::Fault(message) => self.job.on_fault(&message),
            DeviceResponse::Error(message) => tracing::warn!("Printer error: {}", message),
            DeviceResponse::Temperature(report) => self.apply_temperatures(&report),
            DeviceResponse::Endstops(states) => {
                for (endstop, triggered) in states {
                    if self.telemetry.update_endstop(endstop, triggered) {
                        tracing::debug!("Endstop {} triggered={}", endstop, triggered);
                        self.publish(PrinterEvent::EndstopChanged { endstop, triggered });
                    }
                }
            }
            DeviceResponse::Banner(version) => {
                if self.telemetry.set_firmware_version(version.clone()) {
                    tracing::info!("Firmware version {}", version);
                    self.publish(PrinterEvent::FirmwareDetected(version));
                }
            }
            DeviceResponse::Empty => self.on_idle(Instant::now()),
            DeviceResponse::Unrecognized(line) => tracing::trace!("Ignoring '{}'", line),
        }
    }

    /// A silent read while nothing is outstanding polls temperature
    fn on_idle(&mut self, now: Instant) {
        let state = self.job.state();
        if !matches!(state, PrinterState::Connected | PrinterState::Paused) {
            return;
        }
        if self.job.sender().in_flight_len() > 0 {
            return;
        }
        tracing::trace!("Line idle, polling temperature");
        self.last_temperature_poll = now;
        self.send(KEEPALIVE_COMMAND, true);
    }

    fn apply_temperatures(&self, report: &TemperatureReport) {
        if self
            .telemetry
            .apply_temperatures(report, self.job.extruder_count())
        {
            self.publish(PrinterEvent::TemperatureChanged(self.telemetry.temperatures()));
        }
    }

    /// Periodic duties, run after every read
    pub fn run_timers(&mut self, now: Instant) {
        let state = self.job.state();
        if !state.has_port() {
            return;
        }
        let config = self.job.sender().config().clone();

        if state != PrinterState::Printing {
            self.last_progress = now;
        } else if now.saturating_duration_since(self.last_progress) >= config.ok_timeout() {
            self.last_progress = now;
            self.job.on_ack_timeout();
        }

        if self.telemetry.take_expired_bed_preheat(now) {
            tracing::info!("Bed preheat expired, switching the bed heater off");
            self.send("M140 S0", false);
        }

        if now.saturating_duration_since(self.last_temperature_poll) >= config.temperature_poll() {
            self.last_temperature_poll = now;
            self.send(KEEPALIVE_COMMAND, true);
        }

        if self.telemetry.endstop_polling()
            && now.saturating_duration_since(self.last_endstop_poll) >= config.endstop_poll()
        {
            self.last_endstop_poll = now;
            self.send(ENDSTOP_POLL_COMMAND, true);
        }
    }

    fn send(&self, command: &str, poll: bool) {
        let sender = self.job.sender();
        let result = if poll {
            sender.enqueue_poll(command).map(|_| ())
        } else {
            sender.enqueue_command(command, false)
        };
        match result {
            Ok(()) => {}
            Err(Error::Connection(ConnectionError::IoError { reason })) => {
                tracing::error!("Failed to send '{}': {}", command, reason);
                self.job.on_disconnect(DISCONNECTED_MESSAGE);
            }
            Err(e) => tracing::warn!("Failed to send '{}': {}", command, e),
        }
    }

    fn publish(&self, event: PrinterEvent) {
        self.job.events().publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::mock::MockDevice;
    use crate::communication::sender::SenderConfig;
    use crate::printer::job::MotionProfile;
    use fdmlink_core::{
        Axis, Endstop, EndstopSide, EventBus, EventCategory, EventFilter, FirmwareVersion,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn listener(config: SenderConfig) -> (Listener, MockDevice) {
        let device = MockDevice::new();
        let job = Arc::new(JobController::new(
            config,
            MotionProfile::default(),
            2,
            Arc::new(EventBus::new()),
        ));
        job.begin_connecting();
        job.on_connected(Box::new(device.port("mock", 250000, Duration::from_millis(10))));
        let listener = Listener::new(
            Box::new(device.port("mock", 250000, Duration::from_millis(10))),
            job,
            Arc::new(Telemetry::new()),
            Arc::new(AtomicBool::new(true)),
        );
        (listener, device)
    }

    #[test]
    fn test_ok_with_temperatures_acknowledges() {
        let (mut listener, device) = listener(SenderConfig::default());
        listener.job.send_command("G28").unwrap();
        assert_eq!(listener.job.sender().in_flight_len(), 1);

        device.push_line("ok T:201.5 /210.0 B:60.0 /60.0");
        assert!(listener.poll_once());
        assert_eq!(listener.job.sender().in_flight_len(), 0);
        let temperatures = listener.telemetry.temperatures();
        assert_eq!(temperatures.hotend(0).unwrap().measured, 201.5);
        assert_eq!(temperatures.bed.unwrap().target, Some(60.0));
    }

    #[test]
    fn test_partial_lines_are_joined() {
        let (mut listener, device) = listener(SenderConfig::default());
        listener.job.send_command("G28").unwrap();

        device.push_bytes(b"o");
        listener.poll_once();
        assert_eq!(listener.job.sender().in_flight_len(), 1);
        device.push_bytes(b"k\n");
        listener.poll_once();
        assert_eq!(listener.job.sender().in_flight_len(), 0);
    }

    #[test]
    fn test_fatal_error_moves_to_error_state() {
        let (mut listener, device) = listener(SenderConfig::default());
        listener.job.start_print(["G28", "G1 X1"], None).unwrap();

        device.push_line("Error:Thermal Runaway, system stopped! Heater_ID: 0");
        listener.poll_once();
        assert_eq!(listener.job.state(), PrinterState::Error);
        assert!(listener
            .job
            .error_message()
            .unwrap()
            .contains("Thermal Runaway"));
    }

    #[test]
    fn test_endstop_change_published_on_transition() {
        let (mut listener, device) = listener(SenderConfig::default());
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        listener.job.events().subscribe(
            EventFilter::Categories(vec![EventCategory::Telemetry]),
            move |event| {
                if matches!(event, PrinterEvent::EndstopChanged { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        device.push_line("x_min: TRIGGERED");
        device.push_line("x_min: TRIGGERED");
        listener.poll_once();
        listener.poll_once();

        let x_min = Endstop::new(Axis::X, EndstopSide::Min);
        assert_eq!(listener.telemetry.endstops().get(x_min), Some(true));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_garbage_triggers_single_version_probe() {
        let (mut listener, device) = listener(SenderConfig::default());
        device.push_bytes(&[0xFE, 0xFE, b'\n', 0xFF, b'\n']);
        listener.poll_once();

        let probes = device
            .written_lines()
            .iter()
            .filter(|l| l.as_str() == VERSION_PROBE_COMMAND)
            .count();
        assert_eq!(probes, 1);

        device.push_line("FIRMWARE_NAME:Marlin FIRMWARE_VERSION:1.2.0 MACHINE_TYPE:Sigma");
        listener.poll_once();
        assert_eq!(
            listener.telemetry.firmware_version(),
            Some(FirmwareVersion::new(1, 2, 0))
        );
    }

    #[test]
    fn test_silence_forces_acknowledgment() {
        let (mut listener, device) = listener(SenderConfig {
            window_capacity: 1024,
            prime_lines: 2,
            ok_timeout_ms: 0,
            ..SenderConfig::default()
        });
        listener.job.start_print(["G28", "G1 X1", "G1 X2"], None).unwrap();
        let in_flight = listener.job.sender().in_flight_len();
        assert!(in_flight > 0);

        listener.run_timers(Instant::now());
        assert!(device
            .written_lines()
            .iter()
            .any(|l| l.starts_with("N3 G1 X2*")));
    }

    #[test]
    fn test_bed_preheat_expiry_turns_heater_off() {
        let (mut listener, device) = listener(SenderConfig::default());
        let now = Instant::now();
        listener.telemetry.set_bed_preheat_deadline(Some(now));
        listener.run_timers(now);
        assert!(device.written_lines().contains(&"M140 S0".to_string()));
    }

    #[test]
    fn test_idle_timeout_polls_temperature() {
        let (mut listener, device) = listener(SenderConfig::default());
        assert!(listener.poll_once());
        assert_eq!(device.written_lines(), vec![KEEPALIVE_COMMAND]);

        // The outstanding poll suppresses another until it is answered.
        assert!(listener.poll_once());
        assert_eq!(device.written_lines().len(), 1);

        device.push_line("ok T:20.0 /0.0 B:21.0 /0.0");
        assert!(listener.poll_once());
        listener.handle_response(DeviceResponse::Empty);
        assert_eq!(device.written_lines().len(), 2);
    }

    #[test]
    fn test_idle_timeout_while_printing_sends_nothing() {
        let (mut listener, device) = listener(SenderConfig {
            prime_lines: 1,
            ..SenderConfig::default()
        });
        listener.job.start_print(["G28", "G1 X1"], None).unwrap();
        device.clear_written();
        listener.handle_response(DeviceResponse::Empty);
        assert!(device.written_lines().is_empty());
    }

    #[test]
    fn test_read_failure_reports_disconnect() {
        let (mut listener, device) = listener(SenderConfig::default());
        device.disconnect();
        assert!(!listener.poll_once());
        assert_eq!(listener.job.state(), PrinterState::Error);
        assert_eq!(
            listener.job.error_message().as_deref(),
            Some(DISCONNECTED_MESSAGE)
        );
    }
}
