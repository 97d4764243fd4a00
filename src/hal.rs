//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the usb-serial link to the device.
//!     abstracts away the difference between a real Arduino/ESP32 on a tty
//!     (using `serial2`) and a development machine or test (using a mock).
//!
//! design:
//!     - "Compile Anywhere": the relay builds and runs without a device attached.
//!     - "Blocking inside": port i/o is synchronous; serial.rs moves it onto
//!       spawn_blocking threads.
//!
//! relationships:
//!     - used by: serial.rs (open / write / read acknowledgement)
//!     - uses: serial2 (real ports)
//!
//! ==============================================================================

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// opens ports by path
pub trait PortProvider: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn PortHandle>>;
    fn name(&self) -> &'static str;
}

/// an open port, exclusively owned by the serial link
pub trait PortHandle: Send + Sync {
    fn write_line(&self, line: &[u8]) -> io::Result<()>;
    /// read one reply line, waiting at most `timeout`; Ok(None) when the device stayed silent
    fn read_reply(&self, timeout: Duration) -> io::Result<Option<String>>;
}

/// "resource busy": the tty is held by another process (serial monitor, IDE upload)
pub fn is_busy(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(16) {
        return true;
    }
    #[cfg(windows)]
    if err.raw_os_error() == Some(5) {
        return true;
    }
    err.to_string().to_ascii_lowercase().contains("busy")
}

// ==============================================================================================
// REAL IMPLEMENTATION (serial2)
// ==============================================================================================

/// read poll granularity while waiting for an acknowledgement
const READ_POLL: Duration = Duration::from_millis(50);

pub struct Serial2Provider;

impl Serial2Provider {
    /// ports visible to the os, for startup hints
    pub fn available_ports() -> Vec<PathBuf> {
        serial2::SerialPort::available_ports().unwrap_or_default()
    }
}

impl PortProvider for Serial2Provider {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn PortHandle>> {
        let mut port = serial2::SerialPort::open(path, baud_rate)?;
        port.set_read_timeout(READ_POLL)?;
        tracing::debug!("[SERIAL] opened {} at {} baud", path, baud_rate);
        Ok(Box::new(Serial2Port {
            port,
            pending: Mutex::new(ReplyBuffer::default()),
        }))
    }

    fn name(&self) -> &'static str {
        "serial"
    }
}

/// bytes read from the device but not yet handed out as a reply
///
/// a read can return more than one line (or half of one); whatever follows
/// the first newline is kept for the next `read_reply`.
#[derive(Default)]
struct ReplyBuffer {
    bytes: Vec<u8>,
}

impl ReplyBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    /// next complete line, trimmed; blank lines are skipped
    fn next_line(&mut self) -> Option<String> {
        while let Some(end) = self.bytes.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.bytes.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }
}

struct Serial2Port {
    port: serial2::SerialPort,
    pending: Mutex<ReplyBuffer>,
}

impl PortHandle for Serial2Port {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        self.port.write_all(line)?;
        self.port.flush()
    }

    fn read_reply(&self, timeout: Duration) -> io::Result<Option<String>> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(line) = pending.next_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 64];

        while Instant::now() < deadline {
            match self.port.read(&mut buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial port closed"));
                }
                Ok(n) => {
                    pending.push(&buf[..n]);
                    if let Some(line) = pending.next_line() {
                        return Ok(Some(line));
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(e) => return Err(e),
            }
        }

        // a partial line stays buffered until the device finishes it
        Ok(None)
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (no device attached / tests)
// ==============================================================================================

#[derive(Default)]
struct MockState {
    open_attempts: AtomicU32,
    busy_remaining: AtomicU32,
    always_busy: AtomicBool,
    fail_writes: AtomicBool,
    reply: Mutex<Option<String>>,
    written: Mutex<Vec<String>>,
}

/// in-memory port: records every line written and can simulate a busy tty
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        tracing::info!("[MOCK SERIAL] using mock port (no hardware access)");
        Self::default()
    }
}

// test controls
#[cfg(test)]
impl MockProvider {
    /// the next `attempts` opens fail with "resource busy"
    pub fn busy_for(self, attempts: u32) -> Self {
        self.state.busy_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    /// every open fails with "resource busy"
    pub fn always_busy(self) -> Self {
        self.state.always_busy.store(true, Ordering::SeqCst);
        self
    }

    /// reply line returned after each write
    pub fn with_reply(self, reply: &str) -> Self {
        *self.state.reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(reply.to_string());
        self
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn open_attempts(&self) -> u32 {
        self.state.open_attempts.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<String> {
        self.state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PortProvider for MockProvider {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn PortHandle>> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);

        let busy = self.state.always_busy.load(Ordering::SeqCst)
            || self
                .state
                .busy_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if busy {
            tracing::debug!("[MOCK SERIAL] {} busy", path);
            return Err(io::Error::from_raw_os_error(16));
        }

        tracing::debug!("[MOCK SERIAL] opened {} at {} baud", path, baud_rate);
        Ok(Box::new(MockPort {
            state: self.state.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

struct MockPort {
    state: Arc<MockState>,
}

impl PortHandle for MockPort {
    fn write_line(&self, line: &[u8]) -> io::Result<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let text = String::from_utf8_lossy(line).to_string();
        tracing::debug!("[MOCK SERIAL] write {:?}", text);
        self.state
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text);
        Ok(())
    }

    fn read_reply(&self, _timeout: Duration) -> io::Result<Option<String>> {
        Ok(self
            .state
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_errors_are_recognised() {
        #[cfg(unix)]
        assert!(is_busy(&io::Error::from_raw_os_error(16)));
        assert!(is_busy(&io::Error::new(io::ErrorKind::Other, "Resource busy")));
        assert!(!is_busy(&io::Error::new(io::ErrorKind::NotFound, "no such file")));
    }

    #[test]
    fn mock_is_busy_for_a_number_of_attempts() {
        let mock = MockProvider::new().busy_for(2);
        assert!(mock.open("/dev/null", 9600).is_err());
        assert!(mock.open("/dev/null", 9600).is_err());
        assert!(mock.open("/dev/null", 9600).is_ok());
        assert_eq!(mock.open_attempts(), 3);
    }

    #[test]
    fn mock_records_writes_and_replies() {
        let mock = MockProvider::new().with_reply("ok");
        let port = mock.open("/dev/ttyUSB0", 115200).unwrap();
        port.write_line(b"90,1\n").unwrap();
        assert_eq!(mock.written(), vec!["90,1\n".to_string()]);
        assert_eq!(port.read_reply(Duration::from_millis(10)).unwrap().as_deref(), Some("ok"));

        mock.fail_writes(true);
        assert!(port.write_line(b"0,0\n").is_err());
        assert_eq!(mock.written().len(), 1);
    }

    #[test]
    fn reply_buffer_keeps_what_follows_the_first_line() {
        let mut buffer = ReplyBuffer::default();
        buffer.push(b"OK 90\r\nOK 45\nOK ");
        assert_eq!(buffer.next_line().as_deref(), Some("OK 90"));
        assert_eq!(buffer.next_line().as_deref(), Some("OK 45"));
        assert_eq!(buffer.next_line(), None);

        buffer.push(b"12\n");
        assert_eq!(buffer.next_line().as_deref(), Some("OK 12"));
        assert!(buffer.bytes.is_empty());
    }

    #[test]
    fn reply_buffer_skips_blank_lines() {
        let mut buffer = ReplyBuffer::default();
        buffer.push(b"\n\r\n  \nready\n");
        assert_eq!(buffer.next_line().as_deref(), Some("ready"));
        assert_eq!(buffer.next_line(), None);
    }
}
