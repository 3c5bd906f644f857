//! Connection manager
//!
//! Owns the serial session: opening the port (through the in-system
//! programmer when one answers, otherwise by baud rotation), splitting it
//! into reader and writer halves, and the connect and listen threads.
//!
//! # Connect sequence
//! 1. State `Connecting`
//! 2. Programmer handshake + leave bootloader; success means a freshly
//!    booted device, so the cached firmware version is dropped
//! 3. Otherwise open at each candidate baud, accepting one only after the
//!    device answered enough `M105` probes legibly
//! 4. Boot delay, writer half to the sender, listener started, state
//!    `Connected`

use super::job::JobController;
use super::listener::Listener;
use super::telemetry::Telemetry;
use crate::communication::{ConnectionParams, PortFactory, SerialPort};
use crate::firmware::SharedIsp;
use crate::protocol::KEEPALIVE_COMMAND;
use fdmlink_core::{ConnectionError, PrinterEvent, PrinterState};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Serial session owner
pub struct ConnectionManager {
    factory: Arc<dyn PortFactory>,
    isp: Option<SharedIsp>,
    params: RwLock<ConnectionParams>,
    job: Arc<JobController>,
    telemetry: Arc<Telemetry>,
    running: Arc<AtomicBool>,
    closing: AtomicBool,
    updating_firmware: AtomicBool,
    connector: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    last_error: RwLock<Option<ConnectionError>>,
}

impl ConnectionManager {
    /// Create a manager for the given port
    pub fn new(
        factory: Arc<dyn PortFactory>,
        isp: Option<SharedIsp>,
        params: ConnectionParams,
        job: Arc<JobController>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            factory,
            isp,
            params: RwLock::new(params),
            job,
            telemetry,
            running: Arc::new(AtomicBool::new(false)),
            closing: AtomicBool::new(false),
            updating_firmware: AtomicBool::new(false),
            connector: Mutex::new(None),
            listener: Mutex::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Connection parameters
    pub fn params(&self) -> ConnectionParams {
        self.params.read().clone()
    }

    /// Replace the connection parameters used by the next connect
    pub fn set_params(&self, params: ConnectionParams) {
        *self.params.write() = params;
    }

    /// Programmer shared with the firmware updater
    pub fn isp(&self) -> Option<&SharedIsp> {
        self.isp.as_ref()
    }

    /// Error of the last failed connect
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.last_error.read().clone()
    }

    /// Whether a firmware update owns the port
    pub fn is_updating_firmware(&self) -> bool {
        self.updating_firmware.load(Ordering::SeqCst)
    }

    /// Claim the port for a firmware update; `false` if already claimed
    pub fn begin_firmware_update(&self) -> bool {
        !self.updating_firmware.swap(true, Ordering::SeqCst)
    }

    /// Release the port after a firmware update
    pub fn end_firmware_update(&self) {
        self.updating_firmware.store(false, Ordering::SeqCst);
    }

    /// Start connecting on the connect thread
    ///
    /// Does nothing while a connection exists or is being made.
    pub fn connect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if !self.prepare_connect()? {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("fdmlink-connect".to_string())
            .spawn(move || {
                let _ = manager.establish();
            })
            .map_err(|e| {
                self.job.on_closed();
                ConnectionError::IoError {
                    reason: e.to_string(),
                }
            })?;
        *self.connector.lock() = Some(handle);
        Ok(())
    }

    /// Run the connect sequence on the calling thread
    pub fn connect_blocking(&self) -> Result<(), ConnectionError> {
        if !self.prepare_connect()? {
            return match self.job.state() {
                PrinterState::Connecting => Err(ConnectionError::AlreadyConnected),
                _ => Ok(()),
            };
        }
        self.establish()
    }

    /// Block until the connect thread finished
    pub fn wait_for_connect(&self) {
        let handle = self.connector.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Stop the threads, drop the port and return to `Closed`
    pub fn close(&self) {
        tracing::info!("Closing connection");
        self.closing.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let connector = self.connector.lock().take();
        if let Some(handle) = connector {
            let _ = handle.join();
        }
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            let _ = handle.join();
        }

        self.job.on_closed();
        self.telemetry.reset();
        self.closing.store(false, Ordering::SeqCst);
    }

    /// Returns `false` when a connection already exists or is being made
    fn prepare_connect(&self) -> Result<bool, ConnectionError> {
        if self.is_updating_firmware() {
            return Err(ConnectionError::FirmwareUpdateInProgress);
        }
        self.params.read().validate()?;

        if self.job.state() == PrinterState::Error {
            // Tear down the failed session before starting a new one.
            self.close();
        }
        let finished = {
            let mut connector = self.connector.lock();
            match connector.as_ref() {
                Some(handle) if handle.is_finished() => connector.take(),
                _ => None,
            }
        };
        if let Some(handle) = finished {
            let _ = handle.join();
        }
        Ok(self.job.begin_connecting())
    }

    fn establish(&self) -> Result<(), ConnectionError> {
        let params = self.params();
        *self.last_error.write() = None;

        let result = self.open_port(&params).and_then(|port| self.start_session(&params, port));
        if let Err(ref e) = result {
            if self.closing.load(Ordering::SeqCst) {
                tracing::debug!("Connect to {} abandoned: {}", params.port, e);
            } else {
                tracing::error!("Unable to connect to {}: {}", params.port, e);
                *self.last_error.write() = Some(e.clone());
                self.job.on_closed();
                self.job.events().publish(PrinterEvent::ConnectionFailed {
                    port: params.port.clone(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn open_port(&self, params: &ConnectionParams) -> Result<Box<dyn SerialPort>, ConnectionError> {
        if let Some(port) = self.open_through_programmer(params) {
            return Ok(port);
        }

        let mut tried = Vec::new();
        for baud in params.baud_candidates() {
            self.check_not_closing()?;
            tried.push(baud);
            tracing::debug!("Trying {} at {} baud", params.port, baud);

            let mut port = match self.factory.open(&params.port, baud, params.read_timeout()) {
                Ok(port) => port,
                Err(e @ ConnectionError::PortNotFound { .. }) => return Err(e),
                Err(e) => {
                    tracing::debug!("Open at {} baud failed: {}", baud, e);
                    continue;
                }
            };

            if !params.verify_baud || self.probe_baud(port.as_mut(), params)? {
                tracing::info!("Locked {} at {} baud", params.port, baud);
                return Ok(port);
            }
        }

        Err(ConnectionError::BaudNegotiationFailed {
            port: params.port.clone(),
            tried,
        })
    }

    fn open_through_programmer(&self, params: &ConnectionParams) -> Option<Box<dyn SerialPort>> {
        let isp = self.isp.as_ref()?;
        let mut programmer = isp.lock();

        let result = programmer
            .connect(&params.port)
            .and_then(|_| programmer.leave_bootloader());
        match result {
            Ok(mut port) => {
                tracing::info!("Bootloader handshake on {} succeeded", params.port);
                if let Err(e) = port.set_timeout(params.read_timeout()) {
                    tracing::warn!("Unable to set read timeout: {}", e);
                }
                self.telemetry.invalidate_firmware_version();
                Some(port)
            }
            Err(e) => {
                tracing::debug!("No bootloader on {}: {}", params.port, e);
                programmer.close();
                None
            }
        }
    }

    /// Send `M105` until enough legible answers arrive or the probe times out
    fn probe_baud(
        &self,
        port: &mut dyn SerialPort,
        params: &ConnectionParams,
    ) -> Result<bool, ConnectionError> {
        let deadline = Instant::now() + params.probe_timeout();
        let probe = format!("{}\n", KEEPALIVE_COMMAND);
        let mut answers = 0;
        let mut partial = Vec::new();
        let mut buf = [0u8; 128];

        if port.write_all(probe.as_bytes()).is_err() {
            return Ok(false);
        }
        while Instant::now() < deadline {
            self.check_not_closing()?;
            match port.read(&mut buf) {
                Ok(count) => partial.extend_from_slice(&buf[..count]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(_) => return Ok(false),
            }

            while let Some(end) = partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = partial.drain(..=end).collect();
                let Ok(text) = std::str::from_utf8(&line) else {
                    continue;
                };
                let text = text.trim();
                if text.starts_with("ok") || text.contains("T:") {
                    answers += 1;
                    if answers >= params.required_responses {
                        return Ok(true);
                    }
                    if port.write_all(probe.as_bytes()).is_err() {
                        return Ok(false);
                    }
                }
            }
        }
        tracing::debug!("Baud probe got {} of {} answers", answers, params.required_responses);
        Ok(false)
    }

    fn start_session(
        &self,
        params: &ConnectionParams,
        reader: Box<dyn SerialPort>,
    ) -> Result<(), ConnectionError> {
        self.wait(params.boot_delay())?;

        let writer = reader.try_clone().map_err(|e| ConnectionError::IoError {
            reason: e.to_string(),
        })?;
        self.check_not_closing()?;

        self.running.store(true, Ordering::SeqCst);
        self.job.on_connected(writer);
        let listener = Listener::new(
            reader,
            Arc::clone(&self.job),
            Arc::clone(&self.telemetry),
            Arc::clone(&self.running),
        );
        match listener.spawn() {
            Ok(handle) => {
                *self.listener.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(ConnectionError::IoError {
                    reason: e.to_string(),
                })
            }
        }
    }

    fn wait(&self, duration: Duration) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_not_closing()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn check_not_closing(&self) -> Result<(), ConnectionError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionLost {
                reason: "connection closed while connecting".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
