//! # Event Log
//!
//! Bounded log sink for the one-line diagnostic events the operator sees on
//! the log stream ("source went stale", "heave clamped", "PGN 128267 parse
//! failure"). Every event is forwarded to `tracing` as well; the ring keeps
//! the most recent ones for the WebSocket collaborator to drain.
//!
//! The ring is allocated once. Event detail text is formatted into a fixed
//! inline buffer and truncated if it does not fit, so recording never
//! allocates.

use std::fmt::{self, Write};

use serde::{Serialize, Serializer};

use crate::Millis;

/// Detail text capacity in bytes.
pub const DETAIL_LEN: usize = 96;

/// Event severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Parse a level name as written in the config file.
    pub fn parse(name: &str) -> Option<Level> {
        match name.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            _ => None,
        }
    }
}

/// Fixed-capacity text that silently truncates on overflow.
#[derive(Clone, Copy)]
pub struct FixedText<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedText<N> {
    pub const fn new() -> Self {
        FixedText {
            bytes: [0; N],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for FixedText<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for FixedText<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut take = s.len().min(N - self.len);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl<const N: usize> fmt::Display for FixedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> fmt::Debug for FixedText<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> Serialize for FixedText<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One recorded event.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LogEvent {
    pub at: Millis,
    pub level: Level,
    /// Emitting component, e.g. `nmea2000`
    pub component: &'static str,
    /// Short event name, e.g. `parse_failure`
    pub event: &'static str,
    pub detail: FixedText<DETAIL_LEN>,
}

impl LogEvent {
    const EMPTY: LogEvent = LogEvent {
        at: 0,
        level: Level::Debug,
        component: "",
        event: "",
        detail: FixedText::new(),
    };
}

/// Ring buffer of recent events plus per-level counters.
#[derive(Debug)]
pub struct EventLog {
    ring: Vec<LogEvent>,
    head: usize,
    len: usize,
    min_level: Level,
    warnings: u32,
    errors: u32,
    overwritten: u32,
}

impl EventLog {
    /// Allocate a log holding up to `capacity` events at or above `min_level`.
    pub fn new(capacity: usize, min_level: Level) -> Self {
        let capacity = capacity.max(1);
        EventLog {
            ring: vec![LogEvent::EMPTY; capacity],
            head: 0,
            len: 0,
            min_level,
            warnings: 0,
            errors: 0,
            overwritten: 0,
        }
    }

    /// Record an event. It always reaches `tracing`; it is kept in the ring
    /// only at or above the configured minimum level.
    pub fn record(
        &mut self,
        at: Millis,
        level: Level,
        component: &'static str,
        event: &'static str,
        detail: fmt::Arguments<'_>,
    ) {
        let mut text = FixedText::<DETAIL_LEN>::new();
        let _ = text.write_fmt(detail);

        match level {
            Level::Debug => tracing::debug!(component, event, "{}", text),
            Level::Info => tracing::info!(component, event, "{}", text),
            Level::Warn => {
                self.warnings = self.warnings.saturating_add(1);
                tracing::warn!(component, event, "{}", text)
            }
            Level::Error => {
                self.errors = self.errors.saturating_add(1);
                tracing::error!(component, event, "{}", text)
            }
        }

        if level < self.min_level {
            return;
        }
        let capacity = self.ring.len();
        let slot = (self.head + self.len) % capacity;
        self.ring[slot] = LogEvent {
            at,
            level,
            component,
            event,
            detail: text,
        };
        if self.len == capacity {
            self.head = (self.head + 1) % capacity;
            self.overwritten = self.overwritten.saturating_add(1);
        } else {
            self.len += 1;
        }
    }

    pub fn debug(
        &mut self,
        at: Millis,
        component: &'static str,
        event: &'static str,
        detail: fmt::Arguments<'_>,
    ) {
        self.record(at, Level::Debug, component, event, detail);
    }

    pub fn info(
        &mut self,
        at: Millis,
        component: &'static str,
        event: &'static str,
        detail: fmt::Arguments<'_>,
    ) {
        self.record(at, Level::Info, component, event, detail);
    }

    pub fn warn(
        &mut self,
        at: Millis,
        component: &'static str,
        event: &'static str,
        detail: fmt::Arguments<'_>,
    ) {
        self.record(at, Level::Warn, component, event, detail);
    }

    pub fn error(
        &mut self,
        at: Millis,
        component: &'static str,
        event: &'static str,
        detail: fmt::Arguments<'_>,
    ) {
        self.record(at, Level::Error, component, event, detail);
    }

    /// Retained events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        let capacity = self.ring.len();
        (0..self.len).map(move |i| &self.ring[(self.head + i) % capacity])
    }

    /// Hand every retained event to `sink`, oldest first, and empty the ring.
    pub fn drain_into(&mut self, mut sink: impl FnMut(&LogEvent)) {
        for event in self.iter() {
            sink(event);
        }
        self.head = 0;
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// WARN events recorded since startup, retained or not.
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Events pushed out of the ring before anyone drained them.
    pub fn overwritten(&self) -> u32 {
        self.overwritten
    }
}
