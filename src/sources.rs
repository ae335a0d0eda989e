//! # Sensor Sources and Prioritization
//!
//! Several physical devices can report the same sensor class (two GNSS
//! receivers, an autopilot compass and an NMEA 2000 heading sensor). Exactly
//! one of them drives the repository at any time. This module keeps the fixed
//! source tables ([`SourceManager`]) and the small state machine that picks the
//! active source per class ([`SourcePrioritizer`]).
//!
//! ## Selection Rules
//! 1. A fresh source with manual override wins unconditionally
//! 2. Otherwise the fresh source with the highest rolling update frequency
//! 3. Ties keep the previously active source, so selection never flaps
//! 4. On cold start the first source to report becomes active
//!
//! A source is fresh while its last accepted reading is less than
//! [`STALE_AFTER_MS`](crate::STALE_AFTER_MS) old. The stale check and the
//! priority recomputation run as separate scheduler steps.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::{is_fresh, Millis};

/// Capacity of each per-class source table.
pub const MAX_SOURCES_PER_CLASS: usize = 5;

/// Number of timestamps kept for the rolling frequency estimate.
const FREQUENCY_WINDOW: usize = 10;

/// Longest stored source identifier, in bytes.
pub const SOURCE_ID_LEN: usize = 15;

/// Sensor classes with competing sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SensorClass {
    Gps,
    Compass,
}

impl SensorClass {
    pub const ALL: [SensorClass; 2] = [SensorClass::Gps, SensorClass::Compass];

    fn index(self) -> usize {
        match self {
            SensorClass::Gps => 0,
            SensorClass::Compass => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorClass::Gps => "gps",
            SensorClass::Compass => "compass",
        }
    }
}

/// Physical transport a source reports over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Transport {
    Serial,
    Can,
    OneWire,
}

/// Source identifier stored inline (no heap), truncated to
/// [`SOURCE_ID_LEN`] bytes on a character boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SourceId {
    bytes: [u8; SOURCE_ID_LEN],
    len: u8,
}

impl SourceId {
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(SOURCE_ID_LEN);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; SOURCE_ID_LEN];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        SourceId {
            bytes,
            len: end as u8,
        }
    }

    /// Build an id from formatted parts without allocating, e.g.
    /// `SourceId::format(format_args!("N2K-{}", address))`.
    pub fn format(args: fmt::Arguments<'_>) -> Self {
        let mut id = SourceId::new("");
        // Overlong ids are cut by write_str
        let _ = fmt::write(&mut id, args);
        id
    }

    pub fn as_str(&self) -> &str {
        // Only ever filled from &str slices cut at char boundaries
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Write for SourceId {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let start = self.len as usize;
        let room = SOURCE_ID_LEN - start;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.bytes[start..start + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take as u8;
        Ok(())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceId({:?})", self.as_str())
    }
}

impl Serialize for SourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Index of a registered source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceHandle {
    pub class: SensorClass,
    slot: u8,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceError {
    #[error("source table for {} is full", .0.name())]
    TableFull(SensorClass),
}

/// Ring of the most recent update timestamps.
#[derive(Clone, Copy, Debug, Default)]
struct FrequencyWindow {
    stamps: [Millis; FREQUENCY_WINDOW],
    len: usize,
    next: usize,
}

impl FrequencyWindow {
    fn push(&mut self, at: Millis) {
        self.stamps[self.next] = at;
        self.next = (self.next + 1) % FREQUENCY_WINDOW;
        self.len = (self.len + 1).min(FREQUENCY_WINDOW);
    }

    /// Mean interval between the stored timestamps, if there are two or more.
    fn mean_interval_ms(&self) -> Option<f64> {
        if self.len < 2 {
            return None;
        }
        let newest = self.stamps[(self.next + FREQUENCY_WINDOW - 1) % FREQUENCY_WINDOW];
        let oldest = self.stamps[(self.next + FREQUENCY_WINDOW - self.len) % FREQUENCY_WINDOW];
        let span = newest.saturating_sub(oldest);
        if span == 0 {
            return None;
        }
        Some(span as f64 / (self.len - 1) as f64)
    }
}

/// One physical source of a sensor class.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSource {
    pub id: SourceId,
    pub class: SensorClass,
    pub transport: Transport,
    /// Rolling update frequency in Hz
    pub frequency_hz: f64,
    pub avg_interval_ms: f64,
    pub last_update: Millis,
    pub update_count: u32,
    pub reject_count: u32,
    pub active: bool,
    pub manual_override: bool,
    pub available: bool,
    #[serde(skip)]
    window: FrequencyWindow,
}

impl SensorSource {
    fn new(id: SourceId, class: SensorClass, transport: Transport) -> Self {
        SensorSource {
            id,
            class,
            transport,
            frequency_hz: 0.0,
            avg_interval_ms: 0.0,
            last_update: 0,
            update_count: 0,
            reject_count: 0,
            active: false,
            manual_override: false,
            available: false,
            window: FrequencyWindow::default(),
        }
    }

    /// True once the source has reported and its last report is recent.
    pub fn is_fresh(&self, now: Millis) -> bool {
        self.update_count > 0 && is_fresh(self.last_update, now)
    }

    fn record(&mut self, now: Millis) {
        self.update_count = self.update_count.saturating_add(1);
        self.last_update = now;
        self.available = true;
        self.window.push(now);
        if let Some(interval) = self.window.mean_interval_ms() {
            self.avg_interval_ms = interval;
            self.frequency_hz = 1000.0 / interval;
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ClassTable {
    slots: [Option<SensorSource>; MAX_SOURCES_PER_CLASS],
    active: Option<usize>,
}

/// Fixed-capacity source tables, one per sensor class, with the active index
/// of each class.
#[derive(Clone, Debug, Default)]
pub struct SourceManager {
    tables: [ClassTable; 2],
}

impl SourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, or return the existing handle if `id` is already
    /// registered in `class`.
    pub fn register(
        &mut self,
        id: SourceId,
        class: SensorClass,
        transport: Transport,
    ) -> Result<SourceHandle, SourceError> {
        if let Some(handle) = self.find(class, id) {
            return Ok(handle);
        }
        let table = &mut self.tables[class.index()];
        let slot = table
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(SourceError::TableFull(class))?;
        table.slots[slot] = Some(SensorSource::new(id, class, transport));
        Ok(SourceHandle {
            class,
            slot: slot as u8,
        })
    }

    pub fn find(&self, class: SensorClass, id: SourceId) -> Option<SourceHandle> {
        self.tables[class.index()]
            .slots
            .iter()
            .position(|slot| slot.map_or(false, |source| source.id == id))
            .map(|slot| SourceHandle {
                class,
                slot: slot as u8,
            })
    }

    pub fn get(&self, handle: SourceHandle) -> Option<&SensorSource> {
        self.tables[handle.class.index()].slots[handle.slot as usize].as_ref()
    }

    fn get_mut(&mut self, handle: SourceHandle) -> Option<&mut SensorSource> {
        self.tables[handle.class.index()].slots[handle.slot as usize].as_mut()
    }

    /// Registered sources of a class, in registration order.
    pub fn sources(&self, class: SensorClass) -> impl Iterator<Item = &SensorSource> {
        self.tables[class.index()].slots.iter().flatten()
    }

    /// The currently active source of a class.
    pub fn active(&self, class: SensorClass) -> Option<&SensorSource> {
        let table = &self.tables[class.index()];
        table.active.and_then(|slot| table.slots[slot].as_ref())
    }

    fn activate(&mut self, class: SensorClass, winner: Option<usize>) {
        let table = &mut self.tables[class.index()];
        table.active = winner;
        for (slot, source) in table.slots.iter_mut().enumerate() {
            if let Some(source) = source {
                source.active = Some(slot) == winner;
            }
        }
    }
}

/// Chooses the active source per class and fails over on staleness.
#[derive(Clone, Debug, Default)]
pub struct SourcePrioritizer {
    manager: SourceManager,
}

impl SourcePrioritizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manager(&self) -> &SourceManager {
        &self.manager
    }

    /// Register a source. New sources start inactive.
    pub fn register(
        &mut self,
        name: &str,
        class: SensorClass,
        transport: Transport,
    ) -> Result<SourceHandle, SourceError> {
        self.manager.register(SourceId::new(name), class, transport)
    }

    pub fn register_id(
        &mut self,
        id: SourceId,
        class: SensorClass,
        transport: Transport,
    ) -> Result<SourceHandle, SourceError> {
        self.manager.register(id, class, transport)
    }

    pub fn lookup(&self, class: SensorClass, name: &str) -> Option<SourceHandle> {
        self.manager.find(class, SourceId::new(name))
    }

    pub fn source(&self, handle: SourceHandle) -> Option<&SensorSource> {
        self.manager.get(handle)
    }

    /// Record an accepted reading. If the class has no active source the
    /// reporting source takes over immediately.
    pub fn record_update(&mut self, handle: SourceHandle, now: Millis) {
        let Some(source) = self.manager.get_mut(handle) else {
            return;
        };
        source.record(now);
        if self.manager.tables[handle.class.index()].active.is_none() {
            self.manager.activate(handle.class, Some(handle.slot as usize));
        }
    }

    /// Record a reading refused by validation.
    pub fn record_reject(&mut self, handle: SourceHandle) {
        if let Some(source) = self.manager.get_mut(handle) {
            source.reject_count = source.reject_count.saturating_add(1);
        }
    }

    pub fn is_active(&self, handle: SourceHandle) -> bool {
        self.manager.tables[handle.class.index()].active == Some(handle.slot as usize)
    }

    /// Re-select the active source of every class.
    pub fn update_priorities(&mut self, now: Millis) {
        for class in SensorClass::ALL {
            let winner = self.select(class, now);
            if winner != self.manager.tables[class.index()].active {
                if let Some(source) = winner.and_then(|slot| {
                    self.manager.tables[class.index()].slots[slot].as_ref()
                }) {
                    tracing::info!(
                        class = class.name(),
                        source = %source.id,
                        hz = source.frequency_hz,
                        "active source changed"
                    );
                }
            }
            self.manager.activate(class, winner);
        }
    }

    fn select(&self, class: SensorClass, now: Millis) -> Option<usize> {
        let table = &self.manager.tables[class.index()];
        let fresh = |slot: usize| table.slots[slot].filter(|source| source.is_fresh(now));

        let overridden = (0..MAX_SOURCES_PER_CLASS)
            .find(|&slot| fresh(slot).map_or(false, |source| source.manual_override));
        if overridden.is_some() {
            return overridden;
        }

        // Seeding with the current active source keeps it on a tie
        let mut best = table.active.filter(|&slot| fresh(slot).is_some());
        for slot in 0..MAX_SOURCES_PER_CLASS {
            let Some(candidate) = fresh(slot) else {
                continue;
            };
            let better = match best.and_then(|slot| table.slots[slot]) {
                Some(current) => candidate.frequency_hz > current.frequency_hz,
                None => true,
            };
            if better {
                best = Some(slot);
            }
        }
        best
    }

    /// Flag sources whose last reading is older than the staleness window.
    /// An active stale source loses ACTIVE. `on_stale` is called once per
    /// source at the moment it turns stale.
    pub fn check_stale(&mut self, now: Millis, mut on_stale: impl FnMut(&SensorSource)) {
        for class in SensorClass::ALL {
            let table = &mut self.manager.tables[class.index()];
            for slot in 0..MAX_SOURCES_PER_CLASS {
                let Some(source) = table.slots[slot].as_mut() else {
                    continue;
                };
                if source.update_count == 0 || source.is_fresh(now) {
                    continue;
                }
                if source.available {
                    source.available = false;
                    on_stale(&*source);
                }
                if source.active {
                    source.active = false;
                    table.active = None;
                }
            }
        }
    }

    /// Pin `handle` as the active source of its class until cleared.
    ///
    /// Any other override in the class is released and the other sources
    /// lose ACTIVE. The pinned source is active while it is fresh.
    pub fn set_manual_override(&mut self, handle: SourceHandle, now: Millis) {
        let class = handle.class;
        let table = &mut self.manager.tables[class.index()];
        for (slot, source) in table.slots.iter_mut().enumerate() {
            if let Some(source) = source {
                source.manual_override = slot == handle.slot as usize;
            }
        }
        let fresh = self
            .manager
            .get(handle)
            .map_or(false, |source| source.is_fresh(now));
        self.manager
            .activate(class, fresh.then_some(handle.slot as usize));
    }

    /// Release the manual override of a class. The active source stays
    /// until the next priority recomputation.
    pub fn clear_manual_override(&mut self, class: SensorClass) {
        for source in self.manager.tables[class.index()].slots.iter_mut().flatten() {
            source.manual_override = false;
        }
    }

    /// Number of active sources in a class. Always 0 or 1.
    pub fn active_count(&self, class: SensorClass) -> usize {
        self.manager.sources(class).filter(|source| source.active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn feed(
        prioritizer: &mut SourcePrioritizer,
        handle: SourceHandle,
        start: Millis,
        step: Millis,
        count: u64,
    ) {
        for i in 0..count {
            prioritizer.record_update(handle, start + i * step);
        }
    }

    #[test]
    fn test_source_id_truncates() {
        let id = SourceId::new("NMEA0183-VH-EXTRA-LONG");
        assert_eq!(id.as_str().len(), SOURCE_ID_LEN);
        assert_eq!(id.as_str(), "NMEA0183-VH-EXT");
        assert_eq!(SourceId::format(format_args!("N2K-{}", 35)).as_str(), "N2K-35");
        // Multi-byte characters are never split
        assert_eq!(SourceId::new("ééééééééé").as_str().len(), 14);
    }

    #[test]
    fn test_frequency_from_window() {
        let mut prioritizer = SourcePrioritizer::new();
        let gps = prioritizer
            .register("GPS_A", SensorClass::Gps, Transport::Serial)
            .unwrap();
        feed(&mut prioritizer, gps, 0, 100, 10);
        let source = prioritizer.source(gps).unwrap();
        assert_relative_eq!(source.frequency_hz, 10.0, epsilon = 1e-9);
        assert_relative_eq!(source.avg_interval_ms, 100.0, epsilon = 1e-9);
        assert_eq!(source.update_count, 10);
    }

    #[test]
    fn test_register_is_idempotent_and_bounded() {
        let mut prioritizer = SourcePrioritizer::new();
        let first = prioritizer
            .register("A", SensorClass::Compass, Transport::Can)
            .unwrap();
        let again = prioritizer
            .register("A", SensorClass::Compass, Transport::Can)
            .unwrap();
        assert_eq!(first, again);
        for name in ["B", "C", "D", "E"] {
            prioritizer
                .register(name, SensorClass::Compass, Transport::Can)
                .unwrap();
        }
        assert_eq!(
            prioritizer.register("F", SensorClass::Compass, Transport::Can),
            Err(SourceError::TableFull(SensorClass::Compass))
        );
        // GPS table is independent
        assert!(prioritizer
            .register("F", SensorClass::Gps, Transport::Can)
            .is_ok());
    }

    #[test]
    fn test_cold_start_first_source_active() {
        let mut prioritizer = SourcePrioritizer::new();
        let a = prioritizer
            .register("A", SensorClass::Gps, Transport::Serial)
            .unwrap();
        let b = prioritizer
            .register("B", SensorClass::Gps, Transport::Can)
            .unwrap();
        assert!(!prioritizer.is_active(a));
        prioritizer.record_update(b, 10);
        assert!(prioritizer.is_active(b));
        prioritizer.record_update(a, 20);
        assert!(!prioritizer.is_active(a));
    }

    #[test]
    fn test_highest_frequency_wins() {
        let mut prioritizer = SourcePrioritizer::new();
        let slow = prioritizer
            .register("SLOW", SensorClass::Gps, Transport::Serial)
            .unwrap();
        let fast = prioritizer
            .register("FAST", SensorClass::Gps, Transport::Can)
            .unwrap();
        feed(&mut prioritizer, slow, 0, 1000, 3);
        feed(&mut prioritizer, fast, 0, 100, 20);
        assert!(prioritizer.is_active(slow));
        prioritizer.update_priorities(2000);
        assert!(prioritizer.is_active(fast));
        assert_eq!(prioritizer.active_count(SensorClass::Gps), 1);
    }

    #[test]
    fn test_tie_keeps_previous_active() {
        let mut prioritizer = SourcePrioritizer::new();
        let a = prioritizer
            .register("A", SensorClass::Compass, Transport::Serial)
            .unwrap();
        let b = prioritizer
            .register("B", SensorClass::Compass, Transport::Can)
            .unwrap();
        feed(&mut prioritizer, b, 0, 100, 5);
        feed(&mut prioritizer, a, 0, 100, 5);
        prioritizer.update_priorities(500);
        assert!(prioritizer.is_active(b));
        prioritizer.update_priorities(600);
        assert!(prioritizer.is_active(b));
    }

    #[test]
    fn test_stale_source_loses_active() {
        let mut prioritizer = SourcePrioritizer::new();
        let a = prioritizer
            .register("A", SensorClass::Gps, Transport::Serial)
            .unwrap();
        prioritizer.record_update(a, 1000);

        let mut stale = Vec::new();
        prioritizer.check_stale(5999, |source| stale.push(source.id));
        assert!(stale.is_empty());
        assert!(prioritizer.is_active(a));

        prioritizer.check_stale(6000, |source| stale.push(source.id));
        assert_eq!(stale, vec![SourceId::new("A")]);
        assert!(!prioritizer.is_active(a));
        assert!(!prioritizer.source(a).unwrap().available);

        // Reported once only
        prioritizer.check_stale(9000, |source| stale.push(source.id));
        assert_eq!(stale.len(), 1);

        prioritizer.record_update(a, 9100);
        assert!(prioritizer.source(a).unwrap().available);
        assert!(prioritizer.is_active(a));
    }

    #[test]
    fn test_manual_override_wins_while_fresh() {
        let mut prioritizer = SourcePrioritizer::new();
        let slow = prioritizer
            .register("SLOW", SensorClass::Gps, Transport::Serial)
            .unwrap();
        let fast = prioritizer
            .register("FAST", SensorClass::Gps, Transport::Can)
            .unwrap();
        feed(&mut prioritizer, fast, 0, 100, 20);
        feed(&mut prioritizer, slow, 0, 1000, 2);

        prioritizer.set_manual_override(slow, 1900);
        assert!(prioritizer.is_active(slow));
        assert!(!prioritizer.is_active(fast));
        prioritizer.update_priorities(1950);
        assert!(prioritizer.is_active(slow));

        // Override source goes quiet: the fast one takes over
        feed(&mut prioritizer, fast, 2000, 100, 60);
        prioritizer.check_stale(7900, |_| {});
        prioritizer.update_priorities(7900);
        assert!(prioritizer.is_active(fast));
        assert!(prioritizer.source(slow).unwrap().manual_override);

        // And wins back as soon as it reports again
        prioritizer.record_update(slow, 8000);
        prioritizer.update_priorities(8000);
        assert!(prioritizer.is_active(slow));

        prioritizer.clear_manual_override(SensorClass::Gps);
        prioritizer.update_priorities(8100);
        assert!(prioritizer.is_active(fast));
    }

    #[test]
    fn test_override_moves_between_sources() {
        let mut prioritizer = SourcePrioritizer::new();
        let a = prioritizer
            .register("A", SensorClass::Compass, Transport::Serial)
            .unwrap();
        let b = prioritizer
            .register("B", SensorClass::Compass, Transport::Can)
            .unwrap();
        prioritizer.record_update(a, 0);
        prioritizer.record_update(b, 0);
        prioritizer.set_manual_override(a, 10);
        prioritizer.set_manual_override(b, 20);
        assert!(!prioritizer.source(a).unwrap().manual_override);
        assert!(prioritizer.is_active(b));
        assert_eq!(prioritizer.active_count(SensorClass::Compass), 1);
    }
}
