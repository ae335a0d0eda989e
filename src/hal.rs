//! # Collaborator Interfaces
//!
//! The core never touches hardware or the operating system directly. It
//! consumes a handful of narrow traits, implemented here for a desktop/Linux
//! host and for tests:
//!
//! | Trait          | Production                    | Tests / development     |
//! |----------------|-------------------------------|-------------------------|
//! | [`Clock`]      | [`MonotonicClock`]            | [`ManualClock`]         |
//! | [`SerialPort`] | `UartSerialPort` (`hardware`) | [`BufferSerialPort`], [`ReplaySerialPort`] |
//! | [`FileSystem`] | [`StdFileSystem`]             | [`StdFileSystem`] on a temp dir |
//!
//! The CAN driver and the 1-Wire transport have their own seams in
//! [`crate::nmea2000`] and [`crate::onewire`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use crate::Millis;

/// Monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> Millis;
}

/// Wall-independent clock counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Millis>>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        ManualClock {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Millis) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.get()
    }
}

/// Non-blocking byte port in the style of a microcontroller UART driver.
pub trait SerialPort {
    /// Open the port at the given baud rate, 8N1.
    fn begin(&mut self, baud: u32) -> io::Result<()>;
    /// Bytes that can be read without blocking.
    fn available(&mut self) -> usize;
    /// Next byte, or `None` when the receive buffer is empty.
    fn read(&mut self) -> Option<u8>;
}

/// In-memory receive buffer with UART overflow semantics: once `capacity`
/// bytes are queued, pushing more drops the oldest.
#[derive(Debug)]
pub struct BufferSerialPort {
    buffer: VecDeque<u8>,
    capacity: usize,
    dropped: usize,
}

impl BufferSerialPort {
    pub fn new(capacity: usize) -> Self {
        BufferSerialPort {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.buffer.len() == self.capacity {
                self.buffer.pop_front();
                self.dropped += 1;
            }
            self.buffer.push_back(byte);
        }
    }

    /// Bytes lost to overflow so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl SerialPort for BufferSerialPort {
    fn begin(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }

    fn available(&mut self) -> usize {
        self.buffer.len()
    }

    fn read(&mut self) -> Option<u8> {
        self.buffer.pop_front()
    }
}

/// Replays a captured NMEA 0183 log at line speed, looping at the end.
///
/// Bytes are released at the rate the real port would deliver them
/// (10 bits per byte for 8N1), so the handler sees the same trickle of
/// partial sentences it sees on the boat.
pub struct ReplaySerialPort {
    data: Vec<u8>,
    clock: Rc<dyn Clock>,
    started_at: Option<Millis>,
    bytes_per_second: u64,
    consumed: u64,
}

impl ReplaySerialPort {
    pub fn new(data: Vec<u8>, clock: Rc<dyn Clock>) -> Self {
        ReplaySerialPort {
            data,
            clock,
            started_at: None,
            bytes_per_second: 480,
            consumed: 0,
        }
    }

    /// Load a capture file.
    pub fn from_file<P: AsRef<Path>>(path: P, clock: Rc<dyn Clock>) -> io::Result<Self> {
        let data = fs::read(path)?;
        if data.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty capture"));
        }
        Ok(Self::new(data, clock))
    }

    fn released(&self) -> u64 {
        match self.started_at {
            Some(start) => {
                let elapsed = self.clock.now_ms().saturating_sub(start);
                elapsed * self.bytes_per_second / 1000
            }
            None => 0,
        }
    }
}

impl SerialPort for ReplaySerialPort {
    fn begin(&mut self, baud: u32) -> io::Result<()> {
        self.bytes_per_second = u64::from(baud / 10).max(1);
        self.started_at = Some(self.clock.now_ms());
        self.consumed = 0;
        Ok(())
    }

    fn available(&mut self) -> usize {
        if self.data.is_empty() {
            return 0;
        }
        self.released().saturating_sub(self.consumed) as usize
    }

    fn read(&mut self) -> Option<u8> {
        if self.data.is_empty() || self.consumed >= self.released() {
            return None;
        }
        let byte = self.data[(self.consumed % self.data.len() as u64) as usize];
        self.consumed += 1;
        Some(byte)
    }
}

/// Raspberry Pi UART through rppal.
#[cfg(all(target_os = "linux", feature = "hardware"))]
pub struct UartSerialPort {
    path: PathBuf,
    uart: Option<rppal::uart::Uart>,
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
impl UartSerialPort {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        UartSerialPort {
            path: path.as_ref().to_path_buf(),
            uart: None,
        }
    }
}

#[cfg(all(target_os = "linux", feature = "hardware"))]
impl SerialPort for UartSerialPort {
    fn begin(&mut self, baud: u32) -> io::Result<()> {
        use rppal::uart::{Parity, Uart};

        let mut uart =
            Uart::with_path(&self.path, baud, Parity::None, 8, 1).map_err(io::Error::other)?;
        // Non-blocking reads
        uart.set_read_mode(0, std::time::Duration::ZERO)
            .map_err(io::Error::other)?;
        self.uart = Some(uart);
        Ok(())
    }

    fn available(&mut self) -> usize {
        self.uart
            .as_ref()
            .and_then(|uart| uart.input_len().ok())
            .unwrap_or(0)
    }

    fn read(&mut self) -> Option<u8> {
        let uart = self.uart.as_mut()?;
        let mut byte = [0u8; 1];
        match uart.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }
}

/// Minimal filesystem used for calibration persistence. Paths are absolute
/// within the device filesystem (`/calibration.json`).
pub trait FileSystem {
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
    /// Create or truncate `path` and write `data` durably.
    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()>;
    /// Replace `to` with `from` in one step.
    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&mut self, path: &str) -> io::Result<()>;
    fn exists(&self, path: &str) -> bool;
}

/// Filesystem rooted at a host directory (the mounted data partition).
#[derive(Debug, Clone)]
pub struct StdFileSystem {
    root: PathBuf,
}

impl StdFileSystem {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        StdFileSystem {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileSystem for StdFileSystem {
    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(path))
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(self.resolve(path))?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }
}
