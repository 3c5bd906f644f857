//! Print Job Controller
//!
//! Owns the printer state machine and the sender. Every state change goes
//! through here, whether it comes from a caller command or from a fault
//! the listener reported:
//!
//! ```text
//! Closed -> Connecting -> Connected -> Printing <-> Paused
//!              |              ^            |          |
//!              v              +-- cancel --+----------+
//!            Closed                        v
//!                                        Error
//! ```

use crate::communication::sender::{FillReport, Sender, SenderConfig};
use crate::communication::SerialPort;
use crate::protocol::LINE_NUMBER_RESET;
use fdmlink_core::{
    ConnectionError, Error, EventBus, PrinterError, PrinterEvent, PrinterState, ProgressInfo,
    Result, ToolheadState,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Motion parameters for the synthesized pause, resume and finish moves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    /// Filament retracted on pause and restored on resume, in mm
    pub retract_distance: f64,
    /// Retract/unretract feed rate in mm/min
    pub retract_speed: f64,
    /// Z lift on pause, in mm
    pub lift_distance: f64,
    /// Z feed rate in mm/min
    pub z_speed: f64,
    /// XY travel feed rate on resume in mm/min
    pub travel_speed: f64,
    /// Dwell after lifting, in milliseconds
    pub dwell_ms: u64,
    /// Command that parks the active hotend
    pub park_command: String,
    /// Command sent when a job completes (leave cloned/mirrored mode)
    pub finish_command: String,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            retract_distance: 5.0,
            retract_speed: 2400.0,
            lift_distance: 2.0,
            z_speed: 600.0,
            travel_speed: 6000.0,
            dwell_ms: 1000,
            park_command: "G69".to_string(),
            finish_command: "M605 S3".to_string(),
        }
    }
}

/// Format a coordinate without float noise (`10`, `0.5`, `-12.25`)
pub fn format_number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Retract, lift, dwell and park
pub fn pause_sequence(motion: &MotionProfile) -> Vec<String> {
    vec![
        "M83".to_string(),
        format!(
            "G1 E-{} F{}",
            format_number(motion.retract_distance),
            format_number(motion.retract_speed)
        ),
        "G91".to_string(),
        format!(
            "G1 Z{} F{}",
            format_number(motion.lift_distance),
            format_number(motion.z_speed)
        ),
        "G90".to_string(),
        format!("G4 P{}", motion.dwell_ms),
        motion.park_command.clone(),
    ]
}

/// Return to the paused position and restore the modal state
pub fn resume_sequence(toolhead: &ToolheadState, motion: &MotionProfile) -> Vec<String> {
    let mut lines = vec![
        "G90".to_string(),
        format!(
            "G1 X{} Y{} F{}",
            format_number(toolhead.x),
            format_number(toolhead.y),
            format_number(motion.travel_speed)
        ),
        format!(
            "G1 Z{} F{}",
            format_number(toolhead.z),
            format_number(motion.z_speed)
        ),
        "M83".to_string(),
        format!(
            "G1 E{} F{}",
            format_number(motion.retract_distance),
            format_number(motion.retract_speed)
        ),
    ];
    if !toolhead.relative_extrusion {
        lines.push("M82".to_string());
    }
    if !toolhead.absolute_positioning {
        lines.push("G91".to_string());
    }
    if toolhead.f > 0.0 {
        lines.push(format!("G1 F{}", format_number(toolhead.f)));
    }
    lines
}

/// Heaters off, fan off, small retract and lift, home, motors off
pub fn cancel_sequence(extruder_count: usize) -> Vec<String> {
    let mut lines: Vec<String> = (0..extruder_count.max(1))
        .map(|i| format!("M104 S0 T{}", i))
        .collect();
    lines.extend(
        [
            "M140 S0",
            "M107",
            "G91",
            "G1 Z+0.5 E-5 Y+10 F12000",
            "G28 X0 Y0",
            "M84",
            "G90",
        ]
        .map(String::from),
    );
    lines
}

/// Remaining print time
///
/// Below `threshold` progress the caller estimate scaled to the remaining
/// fraction is returned as is. Above it the scaled estimate is blended with
/// the wall-clock extrapolation, weighting the extrapolation by progress.
pub fn estimate_remaining(
    estimate: Option<Duration>,
    fraction: f64,
    elapsed: Duration,
    threshold: f64,
) -> Option<Duration> {
    let fraction = fraction.clamp(0.0, 1.0);
    if fraction >= 1.0 {
        return Some(Duration::ZERO);
    }
    let remaining = 1.0 - fraction;
    let scaled = estimate.map(|e| e.mul_f64(remaining));
    if fraction < threshold || fraction <= 0.0 {
        return scaled;
    }

    let extrapolated = elapsed.mul_f64(remaining / fraction);
    Some(match scaled {
        Some(scaled) => scaled.mul_f64(remaining) + extrapolated.mul_f64(fraction),
        None => extrapolated,
    })
}

#[derive(Debug, Default)]
struct JobClock {
    started: Option<Instant>,
    paused_at: Option<Instant>,
    paused_total: Duration,
    estimate: Option<Duration>,
    saved_toolhead: Option<ToolheadState>,
    error_message: Option<String>,
    last_percent: Option<u32>,
}

impl JobClock {
    fn active_elapsed(&self, now: Instant) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let paused = self.paused_total
            + self
                .paused_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or_default();
        now.saturating_duration_since(started).saturating_sub(paused)
    }
}

/// Print job controller
pub struct JobController {
    sender: Sender,
    state: RwLock<PrinterState>,
    clock: Mutex<JobClock>,
    events: Arc<EventBus>,
    motion: MotionProfile,
    extruder_count: usize,
}

impl JobController {
    /// Create a controller in the `Closed` state
    pub fn new(
        streaming: SenderConfig,
        motion: MotionProfile,
        extruder_count: usize,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            sender: Sender::new(streaming),
            state: RwLock::new(PrinterState::Closed),
            clock: Mutex::new(JobClock::default()),
            events,
            motion,
            extruder_count: extruder_count.max(1),
        }
    }

    /// Current printer state
    pub fn state(&self) -> PrinterState {
        *self.state.read()
    }

    /// The sender this controller feeds
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Event bus notifications go to
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Number of extruders
    pub fn extruder_count(&self) -> usize {
        self.extruder_count
    }

    /// Motion parameters
    pub fn motion(&self) -> &MotionProfile {
        &self.motion
    }

    /// Message of the last fault, cleared by cancel or a new print
    pub fn error_message(&self) -> Option<String> {
        self.clock.lock().error_message.clone()
    }

    /// Last issued toolhead state
    pub fn toolhead(&self) -> ToolheadState {
        self.sender.toolhead()
    }

    /// Layer of the most recent layer marker transmitted
    pub fn current_layer(&self) -> Option<i64> {
        self.sender.current_layer()
    }

    /// Progress of the loaded program
    pub fn progress(&self) -> ProgressInfo {
        ProgressInfo {
            transmitted: self.sender.transmitted(),
            total: self.sender.program_len(),
            remaining: self.remaining_time(),
        }
    }

    /// Remaining print time, when a job is loaded
    pub fn remaining_time(&self) -> Option<Duration> {
        let total = self.sender.program_len();
        if total == 0 {
            return None;
        }
        let fraction = self.sender.transmitted() as f64 / total as f64;
        let clock = self.clock.lock();
        clock.started?;
        estimate_remaining(
            clock.estimate,
            fraction,
            clock.active_elapsed(Instant::now()),
            self.sender.config().estimate_threshold,
        )
    }

    // Connection lifecycle, driven by the connection manager.

    /// Move to `Connecting` unless a connection exists or is being made
    ///
    /// The connection manager tears down a failed session before calling
    /// this from `Error`.
    pub fn begin_connecting(&self) -> bool {
        let mut state = self.state.write();
        if !matches!(*state, PrinterState::Closed | PrinterState::Error) {
            return false;
        }
        let from = *state;
        *state = PrinterState::Connecting;
        drop(state);
        self.sender.detach();
        self.announce(from, PrinterState::Connecting);
        true
    }

    /// Port locked: take the writer half and become `Connected`
    pub fn on_connected(&self, writer: Box<dyn SerialPort>) {
        self.sender.attach(writer);
        *self.clock.lock() = JobClock::default();
        self.set_state(PrinterState::Connected);
    }

    /// Connection gone or never made: reset everything and become `Closed`
    pub fn on_closed(&self) {
        self.sender.detach();
        *self.clock.lock() = JobClock::default();
        self.set_state(PrinterState::Closed);
    }

    // Caller commands.

    /// Start streaming a program
    ///
    /// Each item may hold several `\n`-separated lines. The line-number
    /// reset is prepended and the window primed with the first lines.
    pub fn start_print<I, S>(&self, program: I, estimate: Option<Duration>) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut lines = vec![LINE_NUMBER_RESET.to_string()];
        for chunk in program {
            lines.extend(chunk.as_ref().split('\n').map(|l| l.trim_end_matches('\r').to_string()));
        }
        if lines.len() == 1 {
            return Err(PrinterError::EmptyProgram.into());
        }

        {
            let mut state = self.state.write();
            match *state {
                PrinterState::Connected => {}
                PrinterState::Closed | PrinterState::Connecting => {
                    return Err(PrinterError::NotConnected.into())
                }
                other => {
                    return Err(PrinterError::Busy {
                        state: other.to_string(),
                    }
                    .into())
                }
            }
            *state = PrinterState::Printing;
        }

        tracing::info!("Starting print of {} lines", lines.len() - 1);
        self.sender.load_program(lines);
        *self.clock.lock() = JobClock {
            started: Some(Instant::now()),
            estimate,
            ..JobClock::default()
        };
        self.announce(PrinterState::Connected, PrinterState::Printing);

        let prime = self.sender.config().prime_lines.max(1);
        self.handle_fill(self.sender.fill_window(Some(prime)));
        Ok(())
    }

    /// Send a caller command through the window
    pub fn send_command(&self, command: &str) -> Result<()> {
        if !self.state().has_port() {
            return Err(PrinterError::NotConnected.into());
        }
        self.sender.enqueue_command(command, true)
    }

    /// Send several synthesized commands; they do not move the tracked toolhead
    pub fn send_sequence(&self, commands: &[String]) -> Result<()> {
        for command in commands {
            self.sender.enqueue_command(command, false)?;
        }
        Ok(())
    }

    /// Suspend streaming and park the head
    pub fn pause(&self) -> Result<()> {
        self.transition(PrinterState::Printing, PrinterState::Paused)?;

        let toolhead = self.sender.flush_for_pause();
        {
            let mut clock = self.clock.lock();
            clock.saved_toolhead = Some(toolhead);
            clock.paused_at = Some(Instant::now());
        }
        tracing::info!(
            "Paused at line {} (X{} Y{} Z{} F{})",
            self.sender.position(),
            toolhead.x,
            toolhead.y,
            toolhead.z,
            toolhead.f
        );
        self.announce(PrinterState::Printing, PrinterState::Paused);

        let result = self.send_sequence(&pause_sequence(&self.motion));
        self.surface(result)
    }

    /// Undo the park moves and continue streaming
    pub fn resume(&self) -> Result<()> {
        self.transition(PrinterState::Paused, PrinterState::Printing)?;

        let toolhead = {
            let mut clock = self.clock.lock();
            if let Some(at) = clock.paused_at.take() {
                clock.paused_total += at.elapsed();
            }
            clock.saved_toolhead.take()
        }
        .unwrap_or_else(|| self.sender.toolhead());

        self.announce(PrinterState::Paused, PrinterState::Printing);
        let result = self.send_sequence(&resume_sequence(&toolhead, &self.motion));
        self.surface(result)?;

        self.sender.set_feeding(true);
        self.handle_fill(self.sender.fill_window(None));
        Ok(())
    }

    /// Abandon the job and make the machine safe
    pub fn cancel(&self) -> Result<()> {
        let from = self.state();
        if matches!(from, PrinterState::Closed | PrinterState::Connecting) {
            return Err(PrinterError::NotConnected.into());
        }

        tracing::info!("Cancelling print ({})", from);
        self.sender.abort();
        *self.clock.lock() = JobClock::default();
        self.emit_progress(true);

        if !self.sender.is_attached() {
            self.set_state(PrinterState::Closed);
            return Ok(());
        }

        let result = self.send_sequence(&cancel_sequence(self.extruder_count));
        self.set_state(PrinterState::Connected);
        self.surface(result)
    }

    // Listener callbacks.

    /// The device acknowledged one line
    pub fn on_ack(&self) {
        self.sender.acknowledge();
        self.pump();
    }

    /// The device stayed silent mid-print; assume an `ok` was lost
    ///
    /// Also restarts streaming after a resend whose trailing `ok` never came.
    pub fn on_ack_timeout(&self) {
        let in_flight = self.sender.in_flight_len();
        if in_flight > 0 {
            tracing::warn!(
                "No acknowledgment for {} in-flight lines, assuming one was lost",
                in_flight
            );
            self.sender.acknowledge();
        }
        self.pump();
    }

    /// The device asked for a retransmission from `sequence`
    pub fn on_resend(&self, sequence: u64) {
        if let Err(e) = self.sender.handle_resend(sequence) {
            tracing::warn!("Ignoring resend request: {}", e);
        }
    }

    /// The device reported a fatal fault
    pub fn on_fault(&self, message: &str) {
        tracing::error!("Printer fault: {}", message);
        self.enter_error(message);
    }

    /// The serial line failed
    pub fn on_disconnect(&self, message: &str) {
        tracing::error!("Serial failure: {}", message);
        self.sender.release_writer();
        self.enter_error(message);
    }

    /// Drain pending commands and feed program lines
    pub fn pump(&self) {
        self.handle_fill(self.sender.fill_window(None));
    }

    fn handle_fill(&self, result: Result<FillReport>) {
        match result {
            Ok(report) => {
                if report.program_lines > 0 && self.state().is_job_active() {
                    self.emit_progress(false);
                }
                if report.program_finished && self.state() == PrinterState::Printing {
                    self.complete();
                }
            }
            Err(e) => {
                let _ = self.surface::<()>(Err(e));
            }
        }
    }

    fn complete(&self) {
        if self.transition(PrinterState::Printing, PrinterState::Connected).is_err() {
            return;
        }
        let elapsed = self.clock.lock().active_elapsed(Instant::now());
        tracing::info!("Print finished after {:?}", elapsed);

        let total = self.sender.program_len();
        self.sender.finish_program();
        self.emit(PrinterEvent::ProgressChanged(ProgressInfo {
            transmitted: total,
            total,
            remaining: Some(Duration::ZERO),
        }));
        self.announce(PrinterState::Printing, PrinterState::Connected);

        let finish = self.motion.finish_command.clone();
        if let Err(e) = self.sender.enqueue_command(&finish, false) {
            tracing::warn!("Failed to send '{}': {}", finish, e);
        }
        *self.clock.lock() = JobClock::default();
        self.emit_progress(true);
    }

    /// Route streaming errors into the state machine
    fn surface<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            match e {
                Error::Connection(ConnectionError::IoError { reason }) => {
                    self.on_disconnect(reason);
                }
                Error::Protocol(_) if self.state().is_job_active() => {
                    self.on_fault(&e.to_string());
                }
                _ => {}
            }
        }
        result
    }

    fn enter_error(&self, message: &str) {
        let from = {
            let mut state = self.state.write();
            if *state == PrinterState::Error {
                return;
            }
            let from = *state;
            *state = PrinterState::Error;
            from
        };

        self.sender.set_feeding(false);
        self.sender.clear_queues();
        self.clock.lock().error_message = Some(message.to_string());
        self.emit(PrinterEvent::Fault {
            message: message.to_string(),
        });
        self.announce(from, PrinterState::Error);
    }

    fn transition(&self, expected: PrinterState, to: PrinterState) -> Result<()> {
        let mut state = self.state.write();
        if *state != expected {
            if matches!(*state, PrinterState::Closed | PrinterState::Connecting) {
                return Err(PrinterError::NotConnected.into());
            }
            return Err(PrinterError::InvalidStateTransition {
                current: state.to_string(),
                requested: to.to_string(),
            }
            .into());
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: PrinterState) {
        let from = std::mem::replace(&mut *self.state.write(), to);
        if from != to {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: PrinterState, to: PrinterState) {
        tracing::info!("Printer state {} -> {}", from, to);
        self.emit(PrinterEvent::StateChanged { from, to });
    }

    fn emit_progress(&self, force: bool) {
        let progress = self.progress();
        let percent = progress.percent() as u32;
        {
            let mut clock = self.clock.lock();
            if !force && clock.last_percent == Some(percent) {
                return;
            }
            clock.last_percent = Some(percent);
        }
        self.emit(PrinterEvent::ProgressChanged(progress));
    }

    fn emit(&self, event: PrinterEvent) {
        self.events.publish(event);
    }
}

impl std::fmt::Debug for JobController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobController")
            .field("state", &self.state())
            .field("sender", &self.sender)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::mock::MockDevice;

    fn controller(capacity: usize, prime_lines: usize) -> (JobController, MockDevice) {
        let device = MockDevice::new();
        let job = JobController::new(
            SenderConfig {
                window_capacity: capacity,
                prime_lines,
                ..SenderConfig::default()
            },
            MotionProfile::default(),
            2,
            Arc::new(EventBus::new()),
        );
        assert!(job.begin_connecting());
        job.on_connected(Box::new(device.port("mock", 250000, Duration::from_millis(10))));
        (job, device)
    }

    #[test]
    fn test_start_print_requires_connection() {
        let job = JobController::new(
            SenderConfig::default(),
            MotionProfile::default(),
            1,
            Arc::new(EventBus::new()),
        );
        assert!(matches!(
            job.start_print(["G28"], None),
            Err(Error::Printer(PrinterError::NotConnected))
        ));

        let (job, _device) = controller(128, 4);
        assert!(matches!(
            job.start_print(Vec::<String>::new(), None),
            Err(Error::Printer(PrinterError::EmptyProgram))
        ));
    }

    #[test]
    fn test_print_runs_to_completion() {
        let (job, device) = controller(1024, 4);
        job.start_print(["G28\nG1 Z0.3"], Some(Duration::from_secs(60)))
            .unwrap();

        assert_eq!(job.state(), PrinterState::Connected);
        let written = device.written_lines();
        assert!(written[0].starts_with("N0 M110*"));
        assert!(written[1].starts_with("N1 G28*"));
        assert!(written[2].starts_with("N2 G1 Z0.3*"));
        assert_eq!(written[3], "M605 S3");
        assert_eq!(job.progress().total, 0);
    }

    #[test]
    fn test_second_print_refused_while_printing() {
        let (job, _device) = controller(1024, 1);
        job.start_print(["G28", "G1 X1", "G1 X2"], None).unwrap();
        assert_eq!(job.state(), PrinterState::Printing);
        assert!(matches!(
            job.start_print(["G28"], None),
            Err(Error::Printer(PrinterError::Busy { .. }))
        ));
    }

    #[test]
    fn test_pause_resume_restores_feed_rate() {
        let (job, device) = controller(1024, 2);
        job.start_print(["G1 X10 Y10 F1800", "G1 X20 Y20", "G1 X30 Y30"], None)
            .unwrap();
        assert_eq!(job.toolhead().f, 1800.0);

        job.pause().unwrap();
        assert_eq!(job.state(), PrinterState::Paused);
        assert!(device.written_lines().contains(&"G69".to_string()));

        device.clear_written();
        job.resume().unwrap();
        // The rest of the program fits the window, so the job completes.
        assert_eq!(job.state(), PrinterState::Connected);

        let written = device.written_lines();
        let restore = written.iter().position(|l| l == "G1 F1800").unwrap();
        let next = written
            .iter()
            .position(|l| l.starts_with("N2 G1 X20 Y20*"))
            .unwrap();
        assert!(restore < next);
        assert!(written[..next].iter().all(|l| !l.starts_with("N1 ")));
    }

    #[test]
    fn test_pause_only_while_printing() {
        let (job, _device) = controller(1024, 2);
        assert!(matches!(
            job.pause(),
            Err(Error::Printer(PrinterError::InvalidStateTransition { .. }))
        ));
        assert!(job.resume().is_err());
    }

    #[test]
    fn test_fault_then_cancel() {
        let (job, device) = controller(1024, 1);
        job.start_print(["G28", "G1 X1"], None).unwrap();

        job.on_fault("Error: Printer halted. kill() called!");
        assert_eq!(job.state(), PrinterState::Error);
        assert_eq!(job.sender().in_flight_len(), 0);
        assert!(job.error_message().unwrap().contains("kill()"));

        device.clear_written();
        job.cancel().unwrap();
        assert_eq!(job.state(), PrinterState::Connected);
        assert!(job.error_message().is_none());
        let written = device.written_lines();
        assert_eq!(written[0], "M104 S0 T0");
        assert_eq!(written[1], "M104 S0 T1");
        assert_eq!(written.last().map(String::as_str), Some("G90"));
    }

    #[test]
    fn test_disconnect_releases_port() {
        let (job, device) = controller(1024, 1);
        job.start_print(["G28", "G1 X1"], None).unwrap();
        device.disconnect();

        job.on_disconnect("Printer has been disconnected");
        assert_eq!(job.state(), PrinterState::Error);
        assert!(!job.sender().is_attached());

        job.cancel().unwrap();
        assert_eq!(job.state(), PrinterState::Closed);
    }

    #[test]
    fn test_acks_drive_streaming() {
        let (job, device) = controller(40, 4);
        job.start_print(["G1 X10 Y10", "G1 X20 Y20", "G1 X30 Y30"], None)
            .unwrap();
        let sent = device.written_lines().len();
        assert!(sent < 4);

        for _ in 0..6 {
            job.on_ack();
        }
        assert_eq!(job.state(), PrinterState::Connected);
        assert!(device.written_lines().contains(&"M605 S3".to_string()));
        assert_eq!(job.sender().bytes_sent(), job.sender().in_flight_bytes());
    }

    #[test]
    fn test_resend_after_completion_replays_tail() {
        let (job, device) = controller(1024, 8);
        job.start_print(["G28", "G1 X1", "M104 S0"], None).unwrap();
        assert_eq!(job.state(), PrinterState::Connected);
        assert!(job.sender().is_draining());

        device.clear_written();
        job.on_resend(3);
        job.on_ack();
        assert_eq!(
            device.written_lines(),
            vec![crate::protocol::FramedLine::new(3, "M104 S0").to_string()]
        );
        assert_eq!(job.state(), PrinterState::Connected);

        job.on_ack();
        assert!(!job.sender().is_draining());
        assert_eq!(job.sender().in_flight_len(), 0);
        assert_eq!(job.progress().total, 0);
    }

    #[test]
    fn test_last_line_sent_while_pausing_still_completes() {
        let (job, device) = controller(1024, 1);
        job.start_print(["G1 X10 Y10", "G1 X20 Y20"], None).unwrap();

        // Acknowledgments handled after the state change but before the flush.
        *job.state.write() = PrinterState::Paused;
        job.on_ack();
        job.on_ack();
        assert!(device
            .written_lines()
            .iter()
            .any(|l| l.starts_with("N2 G1 X20 Y20*")));
        assert_eq!(job.state(), PrinterState::Paused);
        *job.state.write() = PrinterState::Printing;

        job.pause().unwrap();
        job.resume().unwrap();
        assert_eq!(job.state(), PrinterState::Connected);
        assert!(device.written_lines().contains(&"M605 S3".to_string()));
        job.start_print(["G28"], None).unwrap();
    }

    #[test]
    fn test_caller_commands_are_prepared() {
        let (job, device) = controller(1024, 1);
        job.send_command("M0").unwrap();
        job.send_command("; just a note").unwrap();
        job.send_command("").unwrap();
        job.send_command("G28 X0 ; home x").unwrap();
        assert_eq!(
            device.written_lines(),
            vec!["M105", "M105", "M105", "G28 X0"]
        );
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(0.5), "0.5");
        assert_eq!(format_number(-12.25), "-12.25");
        assert_eq!(format_number(10.199999999), "10.2");
        assert_eq!(format_number(-0.0001), "0");
    }

    #[test]
    fn test_pause_sequence() {
        assert_eq!(
            pause_sequence(&MotionProfile::default()),
            vec!["M83", "G1 E-5 F2400", "G91", "G1 Z2 F600", "G90", "G4 P1000", "G69"]
        );
    }

    #[test]
    fn test_resume_restores_modes_and_feed_rate() {
        let toolhead = ToolheadState {
            x: 12.5,
            y: 40.0,
            z: 3.2,
            e: 120.0,
            f: 1800.0,
            ..ToolheadState::default()
        };
        let lines = resume_sequence(&toolhead, &MotionProfile::default());
        assert_eq!(
            lines,
            vec![
                "G90",
                "G1 X12.5 Y40 F6000",
                "G1 Z3.2 F600",
                "M83",
                "G1 E5 F2400",
                "M82",
                "G1 F1800"
            ]
        );

        let relative = ToolheadState {
            relative_extrusion: true,
            absolute_positioning: false,
            ..toolhead
        };
        let lines = resume_sequence(&relative, &MotionProfile::default());
        assert!(!lines.contains(&"M82".to_string()));
        assert_eq!(lines[lines.len() - 2], "G91");
    }

    #[test]
    fn test_cancel_sequence_per_extruder() {
        let lines = cancel_sequence(2);
        assert_eq!(&lines[..3], &["M104 S0 T0", "M104 S0 T1", "M140 S0"]);
        assert_eq!(lines.last().map(String::as_str), Some("G90"));
        assert!(lines.contains(&"G28 X0 Y0".to_string()));
    }

    #[test]
    fn test_estimate_below_threshold_uses_caller_estimate() {
        let estimate = Some(Duration::from_secs(1000));
        let remaining =
            estimate_remaining(estimate, 0.005, Duration::from_secs(500), 0.01).unwrap();
        assert_eq!(remaining, Duration::from_secs(995));
        assert_eq!(estimate_remaining(None, 0.005, Duration::from_secs(5), 0.01), None);
    }

    #[test]
    fn test_estimate_blends_after_threshold() {
        // Half done after 100 s against a 1000 s estimate:
        // scaled = 500 s, extrapolated = 100 s, blend = 500*0.5 + 100*0.5.
        let remaining = estimate_remaining(
            Some(Duration::from_secs(1000)),
            0.5,
            Duration::from_secs(100),
            0.01,
        )
        .unwrap();
        assert_eq!(remaining.as_secs(), 300);

        let remaining =
            estimate_remaining(None, 0.25, Duration::from_secs(100), 0.01).unwrap();
        assert_eq!(remaining.as_secs(), 300);
        assert_eq!(
            estimate_remaining(None, 1.0, Duration::from_secs(1), 0.01),
            Some(Duration::ZERO)
        );
    }
}
