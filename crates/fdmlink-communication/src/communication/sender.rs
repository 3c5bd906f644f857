//! Flow-controlled sender with byte-budget window and resend recovery
//!
//! Streams numbered, checksummed program lines and unnumbered commands to
//! the device without ever having more unacknowledged bytes outstanding
//! than the device receive buffer holds.
//!
//! # Features
//! - Byte-budget window (`bytes_sent`) bounded by a fixed capacity
//! - In-flight FIFO popped once per `ok`
//! - Pending queue for lines that do not fit yet
//! - Resend recovery by rewinding the playback position
//! - Optimistic toolhead tracking of every transmitted line
//!
//! All state sits behind one lock so the listen thread and the caller
//! thread can never interleave a read-modify-write of the budget.

use super::SerialPort;
use crate::protocol::{layer_marker, prepare_command, prepare_line, FramedLine};
use fdmlink_core::{ConnectionError, Error, ProtocolError, Result, ToolheadState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Configuration for streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Device receive buffer size in bytes
    pub window_capacity: usize,
    /// Program lines sent immediately when a print starts
    pub prime_lines: usize,
    /// Silence while printing after which a lost `ok` is assumed
    pub ok_timeout_ms: u64,
    /// Interval between `M105` temperature polls
    pub temperature_poll_ms: u64,
    /// Interval between `M119` polls while endstop polling is on
    pub endstop_poll_ms: u64,
    /// Progress fraction below which the remaining time comes from the
    /// caller estimate alone
    pub estimate_threshold: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            window_capacity: 128,
            prime_lines: 4,
            ok_timeout_ms: 5000,
            temperature_poll_ms: 5000,
            endstop_poll_ms: 500,
            estimate_threshold: 0.01,
        }
    }
}

impl SenderConfig {
    /// Forced acknowledgment timeout
    pub fn ok_timeout(&self) -> Duration {
        Duration::from_millis(self.ok_timeout_ms)
    }

    /// Temperature poll interval
    pub fn temperature_poll(&self) -> Duration {
        Duration::from_millis(self.temperature_poll_ms)
    }

    /// Endstop poll interval
    pub fn endstop_poll(&self) -> Duration {
        Duration::from_millis(self.endstop_poll_ms)
    }
}

/// A line queued for or awaiting acknowledgment
#[derive(Debug, Clone)]
struct WindowEntry {
    /// Exact bytes written, newline included
    wire: String,
    /// Prepared payload
    payload: String,
    /// Program sequence number, `None` for unnumbered commands
    sequence: Option<u64>,
    /// Whether an unnumbered command updates the tracked toolhead
    track: bool,
}

impl WindowEntry {
    fn numbered(line: FramedLine) -> Self {
        Self {
            wire: line.to_wire(),
            sequence: Some(line.sequence),
            payload: line.payload,
            track: true,
        }
    }

    fn raw(payload: &str, track: bool) -> Self {
        Self {
            wire: format!("{}\n", payload),
            payload: payload.to_string(),
            sequence: None,
            track,
        }
    }

    fn len(&self) -> usize {
        self.wire.len()
    }
}

/// Outcome of a [`Sender::fill_window`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    /// Entries written during this pass, commands included
    pub written: usize,
    /// Program lines written during this pass
    pub program_lines: usize,
    /// Every program line has been transmitted and the job has not been
    /// finished yet
    pub program_finished: bool,
}

#[derive(Default)]
struct SenderState {
    writer: Option<Box<dyn SerialPort>>,
    program: Vec<String>,
    position: usize,
    /// Lines below this index have been transmitted at least once
    furthest: usize,
    feeding: bool,
    /// Program finished but its tail still awaits acknowledgment
    draining: bool,
    bytes_sent: usize,
    in_flight: VecDeque<WindowEntry>,
    pending: VecDeque<WindowEntry>,
    toolhead: ToolheadState,
    current_layer: Option<i64>,
}

impl SenderState {
    fn clear_queues(&mut self) -> usize {
        let dropped = self.in_flight.len() + self.pending.len();
        let freed: usize = self.in_flight.iter().map(WindowEntry::len).sum();
        self.bytes_sent = self.bytes_sent.saturating_sub(freed);
        self.in_flight.clear();
        self.pending.clear();
        dropped
    }

    fn pending_sequence(&self) -> Option<u64> {
        self.pending.iter().find_map(|e| e.sequence)
    }

    fn fully_transmitted(&self) -> bool {
        !self.program.is_empty()
            && self.position >= self.program.len()
            && self.pending_sequence().is_none()
    }

    /// Drop a finished program once no numbered line awaits an `ok`
    fn retire_if_drained(&mut self) {
        if !self.draining || !self.fully_transmitted() {
            return;
        }
        if self.in_flight.iter().any(|e| e.sequence.is_some()) {
            return;
        }
        tracing::debug!("Program tail acknowledged, releasing {} lines", self.program.len());
        self.program.clear();
        self.position = 0;
        self.furthest = 0;
        self.feeding = false;
        self.draining = false;
    }

    fn transmitted(&self) -> usize {
        match self.pending_sequence() {
            Some(sequence) => sequence as usize,
            None => self.position,
        }
    }
}

/// Flow-controlled sender
pub struct Sender {
    config: SenderConfig,
    state: Mutex<SenderState>,
}

impl Sender {
    /// Create a new sender with no port attached
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SenderState::default()),
        }
    }

    /// Streaming configuration
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Window capacity in bytes
    pub fn capacity(&self) -> usize {
        self.config.window_capacity
    }

    /// Take ownership of the port's writer half
    pub fn attach(&self, writer: Box<dyn SerialPort>) {
        let mut state = self.state.lock();
        *state = SenderState {
            writer: Some(writer),
            ..SenderState::default()
        };
    }

    /// Drop the writer half and reset every bookkeeping field
    pub fn detach(&self) {
        *self.state.lock() = SenderState::default();
    }

    /// Drop the writer half after an I/O failure, keeping the loaded program
    pub fn release_writer(&self) {
        let mut state = self.state.lock();
        state.writer = None;
        state.feeding = false;
        state.clear_queues();
    }

    /// Whether a writer half is attached
    pub fn is_attached(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    /// Load a program and reset window, toolhead and position
    ///
    /// Feeding starts enabled; lines go out on the next
    /// [`fill_window`](Self::fill_window).
    pub fn load_program(&self, program: Vec<String>) {
        let mut state = self.state.lock();
        state.clear_queues();
        state.bytes_sent = 0;
        state.program = program;
        state.position = 0;
        state.furthest = 0;
        state.feeding = true;
        state.draining = false;
        state.toolhead = ToolheadState::default();
        state.current_layer = None;
    }

    /// Drop the program, both queues and the tracked toolhead
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.clear_queues();
        state.program.clear();
        state.position = 0;
        state.furthest = 0;
        state.feeding = false;
        state.draining = false;
        state.toolhead = ToolheadState::default();
        state.current_layer = None;
    }

    /// Mark a fully transmitted program as finished
    ///
    /// The program is kept until its last numbered line is acknowledged so
    /// a resend for the tail can still be served; it is hidden from
    /// [`program_len`](Self::program_len) and
    /// [`transmitted`](Self::transmitted) meanwhile.
    pub fn finish_program(&self) {
        let mut state = self.state.lock();
        state.feeding = false;
        state.draining = true;
        state.retire_if_drained();
    }

    /// Enable or suspend feeding of program lines
    pub fn set_feeding(&self, feeding: bool) {
        self.state.lock().feeding = feeding;
    }

    /// Whether program lines are being fed
    pub fn is_feeding(&self) -> bool {
        self.state.lock().feeding
    }

    /// Queue an unnumbered command
    ///
    /// The command goes out immediately when it fits the window and nothing
    /// is pending ahead of it, otherwise it waits in the pending queue.
    /// `track` decides whether it updates the tracked toolhead.
    ///
    /// The command is prepared like a program line: comments are dropped,
    /// and empty commands or the pause menu commands become the keep-alive.
    pub fn enqueue_command(&self, command: &str, track: bool) -> Result<()> {
        let prepared = prepare_command(command);
        let payload = prepared.as_str();

        let mut state = self.state.lock();
        if state.writer.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }

        let entry = WindowEntry::raw(payload, track);
        if entry.len() >= self.config.window_capacity {
            return Err(ProtocolError::CommandTooLong {
                command: payload.to_string(),
                length: entry.len(),
                capacity: self.config.window_capacity,
            }
            .into());
        }

        if state.pending.is_empty() && self.fits(&state, &entry) {
            self.transmit(&mut state, entry)
        } else {
            tracing::debug!("Window full, holding '{}'", payload);
            state.pending.push_back(entry);
            Ok(())
        }
    }

    /// Queue a poll command unless something is already waiting
    ///
    /// Returns whether the command was accepted.
    pub fn enqueue_poll(&self, command: &str) -> Result<bool> {
        if !self.state.lock().pending.is_empty() {
            return Ok(false);
        }
        self.enqueue_command(command, false)?;
        Ok(true)
    }

    /// Drain the pending queue, then feed program lines while they fit
    ///
    /// `limit` caps the number of program lines framed in this pass.
    pub fn fill_window(&self, limit: Option<usize>) -> Result<FillReport> {
        let mut state = self.state.lock();
        let mut report = FillReport::default();

        while let Some(entry) = state.pending.front() {
            if !self.fits(&state, entry) {
                return Ok(report);
            }
            let Some(entry) = state.pending.pop_front() else {
                break;
            };
            let numbered = entry.sequence.is_some();
            self.transmit(&mut state, entry)?;
            report.written += 1;
            if numbered {
                report.program_lines += 1;
            }
        }

        while state.feeding && state.position < state.program.len() {
            if limit.is_some_and(|limit| report.program_lines >= limit) {
                break;
            }

            let sequence = state.position as u64;
            let framed = FramedLine::new(sequence, prepare_line(&state.program[state.position]));
            let length = framed.wire_len();
            if length >= self.config.window_capacity {
                return Err(ProtocolError::LineTooLong {
                    sequence,
                    length,
                    capacity: self.config.window_capacity,
                }
                .into());
            }

            let entry = WindowEntry::numbered(framed);
            state.position += 1;
            if self.fits(&state, &entry) {
                self.transmit(&mut state, entry)?;
                report.written += 1;
                report.program_lines += 1;
            } else {
                state.pending.push_back(entry);
                break;
            }
        }

        report.program_finished =
            state.feeding && !state.draining && state.fully_transmitted();
        if state.draining && state.fully_transmitted() {
            state.feeding = false;
        }
        Ok(report)
    }

    /// Release the oldest in-flight entry
    ///
    /// Returns `false` for an acknowledgment with nothing in flight, which
    /// is logged and otherwise ignored.
    pub fn acknowledge(&self) -> bool {
        let mut state = self.state.lock();
        let matched = match state.in_flight.pop_front() {
            Some(entry) => {
                state.bytes_sent = state.bytes_sent.saturating_sub(entry.len());
                tracing::trace!(
                    "ack '{}', {} bytes in flight",
                    entry.payload,
                    state.bytes_sent
                );
                true
            }
            None => {
                tracing::warn!("Unmatched acknowledgment ignored");
                false
            }
        };
        state.retire_if_drained();
        matched
    }

    /// Recover from a device resend request
    ///
    /// Both queues are dropped and the playback position moves to
    /// `sequence`; the replay happens on the next fill, driven by the
    /// device's trailing `ok`. A finished program whose tail is still
    /// unacknowledged resumes feeding for the replay.
    pub fn handle_resend(&self, sequence: u64) -> std::result::Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let dropped = state.clear_queues();

        if state.program.is_empty() {
            tracing::warn!("Resend {} requested with no program loaded", sequence);
            return Ok(());
        }
        if sequence as usize > state.program.len() {
            return Err(ProtocolError::ResendOutOfRange {
                requested: sequence,
                total: state.program.len(),
            });
        }

        tracing::info!(
            "Resend from line {} (was at {}, dropped {} queued entries)",
            sequence,
            state.position,
            dropped
        );
        state.position = sequence as usize;
        if state.draining {
            state.feeding = true;
            state.retire_if_drained();
        }
        Ok(())
    }

    /// Drop both queues for a pause and return the toolhead to park from
    ///
    /// A program line still waiting in the pending queue was never sent, so
    /// the position moves back to it.
    pub fn flush_for_pause(&self) -> ToolheadState {
        let mut state = self.state.lock();
        state.feeding = false;
        if let Some(sequence) = state.pending_sequence() {
            state.position = sequence as usize;
        }
        state.clear_queues();
        state.toolhead
    }

    /// Drop both queues without touching the program
    pub fn clear_queues(&self) {
        self.state.lock().clear_queues();
    }

    /// Bytes currently unacknowledged
    pub fn bytes_sent(&self) -> usize {
        self.state.lock().bytes_sent
    }

    /// Sum of the in-flight entry lengths
    pub fn in_flight_bytes(&self) -> usize {
        self.state.lock().in_flight.iter().map(WindowEntry::len).sum()
    }

    /// Number of entries awaiting acknowledgment
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Number of entries waiting for window space
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Next program index to frame
    pub fn position(&self) -> usize {
        self.state.lock().position
    }

    /// Program lines actually written so far
    pub fn transmitted(&self) -> usize {
        let state = self.state.lock();
        if state.draining {
            return 0;
        }
        state.transmitted()
    }

    /// Number of program lines, reset sentinel included
    pub fn program_len(&self) -> usize {
        let state = self.state.lock();
        if state.draining {
            return 0;
        }
        state.program.len()
    }

    /// Whether a finished program is still kept for resends of its tail
    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Last issued toolhead state
    pub fn toolhead(&self) -> ToolheadState {
        self.state.lock().toolhead
    }

    /// Layer of the most recent layer marker sent
    pub fn current_layer(&self) -> Option<i64> {
        self.state.lock().current_layer
    }

    fn fits(&self, state: &SenderState, entry: &WindowEntry) -> bool {
        state.bytes_sent + entry.len() < self.config.window_capacity
    }

    fn transmit(&self, state: &mut SenderState, entry: WindowEntry) -> Result<()> {
        let writer = state
            .writer
            .as_mut()
            .ok_or(Error::Connection(ConnectionError::NotConnected))?;

        writer
            .write_all(entry.wire.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| {
                tracing::error!("Failed to write '{}': {}", entry.payload, e);
                ConnectionError::IoError {
                    reason: e.to_string(),
                }
            })?;
        tracing::trace!("TX {}", entry.wire.trim_end());

        let first_time = match entry.sequence {
            Some(sequence) => {
                let first = sequence as usize >= state.furthest;
                state.furthest = state.furthest.max(sequence as usize + 1);
                first
            }
            None => entry.track,
        };
        if first_time {
            state.toolhead.apply(&entry.payload);
            if let Some(layer) = layer_marker(&entry.payload) {
                state.current_layer = Some(layer);
            }
        }

        state.bytes_sent += entry.len();
        state.in_flight.push_back(entry);
        Ok(())
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Sender")
            .field("capacity", &self.config.window_capacity)
            .field("bytes_sent", &state.bytes_sent)
            .field("in_flight", &state.in_flight.len())
            .field("pending", &state.pending.len())
            .field("position", &state.position)
            .finish()
    }
}
