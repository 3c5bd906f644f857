//! In-memory printer for tests and dry runs
//!
//! [`MockDevice`] plays the firmware side of the link: it records every
//! line the host writes, can answer through a scripted responder and lets
//! the test push arbitrary output. [`MockSerialPort`] handles share the
//! device the way cloned OS handles share a real port.

use super::{PortFactory, SerialPort};
use fdmlink_core::ConnectionError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    partial: Vec<u8>,
    lines: Vec<String>,
    responder: Option<Responder>,
    device_baud: Option<u32>,
    port_baud: u32,
    disconnected: bool,
}

impl MockState {
    fn push_line(&mut self, line: &str) {
        self.rx.extend(line.as_bytes());
        self.rx.push_back(b'\n');
    }
}

/// Firmware side of an in-memory serial link
#[derive(Clone, Default)]
pub struct MockDevice {
    inner: Arc<(Mutex<MockState>, Condvar)>,
}

impl MockDevice {
    /// Create a silent device
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device that answers `ok` to every line it receives
    pub fn auto_ok() -> Self {
        let device = Self::new();
        device.set_responder(|_| vec!["ok".to_string()]);
        device
    }

    /// Install a responder called for every complete line the host writes
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.inner.0.lock().responder = Some(Box::new(responder));
    }

    /// Remove the responder; the device goes quiet
    pub fn clear_responder(&self) {
        self.inner.0.lock().responder = None;
    }

    /// Only answer legibly when the port runs at `baud`
    ///
    /// At any other rate the host reads garbage, like a real board would
    /// produce.
    pub fn set_device_baud(&self, baud: Option<u32>) {
        self.inner.0.lock().device_baud = baud;
    }

    /// Queue one line of device output
    pub fn push_line(&self, line: &str) {
        let (lock, cvar) = &*self.inner;
        lock.lock().push_line(line);
        cvar.notify_all();
    }

    /// Queue raw device output
    pub fn push_bytes(&self, bytes: &[u8]) {
        let (lock, cvar) = &*self.inner;
        lock.lock().rx.extend(bytes);
        cvar.notify_all();
    }

    /// Every complete line the host has written, in order
    pub fn written_lines(&self) -> Vec<String> {
        self.inner.0.lock().lines.clone()
    }

    /// Forget the recorded host output
    pub fn clear_written(&self) {
        self.inner.0.lock().lines.clear();
    }

    /// Block until the host has written at least `count` lines
    pub fn wait_for_lines(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |lines| lines.len() >= count)
    }

    /// Block until a written line satisfies `predicate`
    pub fn wait_for_line<P>(&self, timeout: Duration, predicate: P) -> bool
    where
        P: Fn(&str) -> bool,
    {
        self.wait_until(timeout, |lines| lines.iter().any(|l| predicate(l)))
    }

    fn wait_until<P>(&self, timeout: Duration, condition: P) -> bool
    where
        P: Fn(&[String]) -> bool,
    {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut state = lock.lock();
        while !condition(&state.lines) {
            if cvar.wait_until(&mut state, deadline).timed_out() {
                return condition(&state.lines);
            }
        }
        true
    }

    /// Simulate unplugging the cable; every read and write fails afterwards
    pub fn disconnect(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().disconnected = true;
        cvar.notify_all();
    }

    /// Baud rate the host last opened or re-clocked the port at
    pub fn port_baud(&self) -> u32 {
        self.inner.0.lock().port_baud
    }

    /// Open a host-side handle onto this device
    pub fn port(&self, name: &str, baud_rate: u32, timeout: Duration) -> MockSerialPort {
        self.inner.0.lock().port_baud = baud_rate;
        MockSerialPort {
            device: self.clone(),
            name: name.to_string(),
            timeout,
        }
    }
}

/// Host side of an in-memory serial link
pub struct MockSerialPort {
    device: MockDevice,
    name: String,
    timeout: Duration,
}

impl SerialPort for MockSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.device.inner;
        let deadline = Instant::now() + self.timeout;
        let mut state = lock.lock();
        loop {
            if state.disconnected {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            if !state.rx.is_empty() {
                let garbled = state
                    .device_baud
                    .is_some_and(|baud| baud != state.port_baud);
                let count = buf.len().min(state.rx.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..count)) {
                    *slot = if garbled && byte != b'\n' { 0xFE } else { byte };
                }
                return Ok(count);
            }
            if cvar.wait_until(&mut state, deadline).timed_out() && state.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let (lock, cvar) = &*self.device.inner;
        let mut state = lock.lock();
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }

        for &byte in data {
            if byte != b'\n' {
                state.partial.push(byte);
                continue;
            }
            let line = String::from_utf8_lossy(&state.partial).into_owned();
            state.partial.clear();
            if line.is_empty() {
                continue;
            }

            let replies = match state.responder.take() {
                Some(mut responder) => {
                    let replies = responder(&line);
                    state.responder = Some(responder);
                    replies
                }
                None => Vec::new(),
            };
            state.lines.push(line);
            for reply in replies {
                state.push_line(&reply);
            }
        }
        cvar.notify_all();
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.device.inner.0.lock().port_baud = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> io::Result<u32> {
        Ok(self.device.port_baud())
    }

    fn try_clone(&self) -> io::Result<Box<dyn SerialPort>> {
        Ok(Box::new(MockSerialPort {
            device: self.device.clone(),
            name: self.name.clone(),
            timeout: self.timeout,
        }))
    }
}

/// Opens [`MockSerialPort`]s onto one [`MockDevice`]
#[derive(Clone)]
pub struct MockPortFactory {
    device: MockDevice,
    available: bool,
    opened: Arc<Mutex<Vec<u32>>>,
}

impl MockPortFactory {
    /// Factory whose every open succeeds onto `device`
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            available: true,
            opened: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Factory that reports the port as missing
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(MockDevice::new())
        }
    }

    /// Baud rates the host opened the port at, in order
    pub fn opened_bauds(&self) -> Vec<u32> {
        self.opened.lock().clone()
    }
}

impl PortFactory for MockPortFactory {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn SerialPort>, ConnectionError> {
        self.opened.lock().push(baud_rate);
        if !self.available {
            return Err(ConnectionError::PortNotFound {
                port: port.to_string(),
            });
        }
        Ok(Box::new(self.device.port(port, baud_rate, timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_line(port: &mut dyn SerialPort) -> io::Result<String> {
        let mut buf = [0u8; 64];
        let n = port.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    #[test]
    fn test_responder_answers_each_line() {
        let device = MockDevice::auto_ok();
        let mut port = device.port("mock", 115200, Duration::from_millis(50));

        port.write_all(b"N1 G28*18\nM105\n").unwrap();
        assert_eq!(device.written_lines(), vec!["N1 G28*18", "M105"]);
        assert_eq!(read_line(&mut port).unwrap(), "ok\nok\n");
    }

    #[test]
    fn test_read_times_out() {
        let device = MockDevice::new();
        let mut port = device.port("mock", 115200, Duration::from_millis(20));
        let err = read_line(&mut port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_wrong_baud_garbles_output() {
        let device = MockDevice::new();
        device.set_device_baud(Some(250000));
        let mut port = device.port("mock", 115200, Duration::from_millis(20));

        device.push_line("ok");
        let mut buf = [0u8; 8];
        let n = port.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xFE, 0xFE, b'\n']);

        port.set_baud_rate(250000).unwrap();
        device.push_line("ok");
        assert_eq!(read_line(&mut port).unwrap(), "ok\n");
    }

    #[test]
    fn test_disconnect_fails_io() {
        let device = MockDevice::new();
        let mut port = device.port("mock", 115200, Duration::from_millis(20));
        let mut clone = port.try_clone().unwrap();
        device.disconnect();
        assert!(port.write_all(b"M105\n").is_err());
        assert_eq!(
            read_line(clone.as_mut()).unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
