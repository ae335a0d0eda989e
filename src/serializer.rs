//! # JSON Views
//!
//! Read-only JSON documents for the display and log collaborators: the full
//! repository snapshot, the source table and the handler counters. These
//! are built on demand by the collaborator, off the ingest path.

use serde::Serialize;

use crate::events::{EventLog, LogEvent};
use crate::nmea0183::Nmea0183Stats;
use crate::nmea2000::Nmea2000Stats;
use crate::onewire::OneWireStats;
use crate::repository::Snapshot;
use crate::sources::{SensorClass, SensorSource, SourcePrioritizer};

/// Every entity, derived data, calibration and diagnostics at one instant.
pub fn snapshot_json(snapshot: &Snapshot) -> serde_json::Result<String> {
    serde_json::to_string(snapshot)
}

#[derive(Serialize)]
struct SourceTable<'a> {
    gps: Vec<&'a SensorSource>,
    compass: Vec<&'a SensorSource>,
}

/// Registered sources per class with their statistics and flags.
pub fn sources_json(prioritizer: &SourcePrioritizer) -> serde_json::Result<String> {
    let manager = prioritizer.manager();
    let table = SourceTable {
        gps: manager.sources(SensorClass::Gps).collect(),
        compass: manager.sources(SensorClass::Compass).collect(),
    };
    serde_json::to_string(&table)
}

/// Protocol handler counters and event log totals.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerStatus {
    pub nmea0183: Nmea0183Stats,
    pub nmea2000: Nmea2000Stats,
    pub onewire: OneWireStats,
    pub loop_frequency: f64,
    pub warnings: u32,
    pub errors: u32,
}

pub fn status_json(status: &HandlerStatus) -> serde_json::Result<String> {
    serde_json::to_string(status)
}

/// Drain the event ring as one JSON line per event.
pub fn drain_events_json(events: &mut EventLog) -> Vec<String> {
    let mut lines = Vec::with_capacity(events.len());
    events.drain_into(|event: &LogEvent| {
        if let Ok(line) = serde_json::to_string(event) {
            lines.push(line);
        }
    });
    lines
}
