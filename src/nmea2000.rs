//! # NMEA 2000 Handler
//!
//! Decodes the PGN payloads delivered by the CAN bus driver and routes them
//! into repository ingress.
//!
//! ## Inbox
//! The driver's receive hook pushes messages into a [`CanInbox`], a ring of
//! 32 messages allocated once. When the ring is full the oldest message is
//! dropped and counted. [`Nmea2000Handler::pump`] drains it every 10 ms.
//!
//! ## Payloads
//! Fields are little-endian fixed point. A raw value of all ones (unsigned)
//! or the largest positive value (signed) means "not available": the update
//! is skipped with a DEBUG trace and existing state is left alone. A payload
//! too short for the fields it must carry is a parse failure: one ERROR
//! event and the target entity flips to unavailable.
//!
//! ## Sources
//! Bus devices are identified as `N2K-<address>`. GNSS and heading senders
//! register with the prioritizer the first time they are seen.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::angles::{kelvin_to_celsius, mps_to_knots, normalize_positive, normalize_signed};
use crate::boat_data::EntityKind;
use crate::repository::{
    AttitudeReading, BoatData, DstReading, EngineReading, GpsFix, HeadingReading,
};
use crate::sources::{SensorClass, SourceError, SourceId, Transport};

/// Largest payload of a fast-packet PGN.
pub const MAX_PAYLOAD: usize = 223;

/// Messages held by the inbox.
pub const INBOX_CAPACITY: usize = 32;

// PGN numbers handled by the gateway
pub const PGN_VESSEL_HEADING: u32 = 127250;
pub const PGN_RATE_OF_TURN: u32 = 127251;
pub const PGN_HEAVE: u32 = 127252;
pub const PGN_ATTITUDE: u32 = 127257;
pub const PGN_MAGNETIC_VARIATION: u32 = 127258;
pub const PGN_ENGINE_RAPID: u32 = 127488;
pub const PGN_ENGINE_DYNAMIC: u32 = 127489;
pub const PGN_SPEED: u32 = 128259;
pub const PGN_WATER_DEPTH: u32 = 128267;
pub const PGN_POSITION_RAPID: u32 = 129025;
pub const PGN_COG_SOG_RAPID: u32 = 129026;
pub const PGN_GNSS_POSITION: u32 = 129029;
pub const PGN_WIND: u32 = 130306;
pub const PGN_TEMPERATURE_EXTENDED: u32 = 130316;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgnError {
    #[error("PGN {pgn} payload too short: {len} bytes, field needs {needed}")]
    Truncated { pgn: u32, len: usize, needed: usize },
    #[error("PGN {0} is not handled")]
    Unsupported(u32),
}

// -- Messages and inbox --

/// One PGN as delivered by the bus driver.
#[derive(Clone, Copy)]
pub struct N2kMessage {
    pub pgn: u32,
    /// Sender address on the bus
    pub source: u8,
    len: usize,
    data: [u8; MAX_PAYLOAD],
}

impl N2kMessage {
    /// Copy a payload. Anything past [`MAX_PAYLOAD`] is cut off.
    pub fn new(pgn: u32, source: u8, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_PAYLOAD);
        let mut data = [0; MAX_PAYLOAD];
        data[..len].copy_from_slice(&payload[..len]);
        N2kMessage {
            pgn,
            source,
            len,
            data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl fmt::Debug for N2kMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("N2kMessage")
            .field("pgn", &self.pgn)
            .field("source", &self.source)
            .field("payload", &self.payload())
            .finish()
    }
}

/// Fixed ring of received messages, oldest dropped on overflow.
#[derive(Debug)]
pub struct CanInbox {
    ring: Vec<N2kMessage>,
    head: usize,
    len: usize,
    dropped: u32,
}

impl Default for CanInbox {
    fn default() -> Self {
        Self::new()
    }
}

impl CanInbox {
    pub fn new() -> Self {
        CanInbox {
            ring: vec![N2kMessage::new(0, 0, &[]); INBOX_CAPACITY],
            head: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Driver receive hook.
    pub fn push(&mut self, message: N2kMessage) {
        let slot = (self.head + self.len) % INBOX_CAPACITY;
        self.ring[slot] = message;
        if self.len == INBOX_CAPACITY {
            self.head = (self.head + 1) % INBOX_CAPACITY;
            self.dropped = self.dropped.saturating_add(1);
        } else {
            self.len += 1;
        }
    }

    pub fn pop(&mut self) -> Option<N2kMessage> {
        if self.len == 0 {
            return None;
        }
        let message = self.ring[self.head];
        self.head = (self.head + 1) % INBOX_CAPACITY;
        self.len -= 1;
        Some(message)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Messages lost to overflow since startup.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

// -- Payload fields --

/// Bounds-checked little-endian field reader over one payload.
struct Fields<'a> {
    pgn: u32,
    data: &'a [u8],
}

impl<'a> Fields<'a> {
    fn bytes<const N: usize>(&self, at: usize) -> Result<[u8; N], PgnError> {
        self.data
            .get(at..at + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or(PgnError::Truncated {
                pgn: self.pgn,
                len: self.data.len(),
                needed: at + N,
            })
    }

    fn byte(&self, at: usize) -> Result<u8, PgnError> {
        Ok(self.bytes::<1>(at)?[0])
    }

    fn u16(&self, at: usize) -> Result<Option<u16>, PgnError> {
        let raw = u16::from_le_bytes(self.bytes(at)?);
        Ok((raw != u16::MAX).then_some(raw))
    }

    fn i16(&self, at: usize) -> Result<Option<i16>, PgnError> {
        let raw = i16::from_le_bytes(self.bytes(at)?);
        Ok((raw != i16::MAX).then_some(raw))
    }

    fn u24(&self, at: usize) -> Result<Option<u32>, PgnError> {
        let [a, b, c] = self.bytes::<3>(at)?;
        let raw = u32::from_le_bytes([a, b, c, 0]);
        Ok((raw != 0x00FF_FFFF).then_some(raw))
    }

    fn u32(&self, at: usize) -> Result<Option<u32>, PgnError> {
        let raw = u32::from_le_bytes(self.bytes(at)?);
        Ok((raw != u32::MAX).then_some(raw))
    }

    fn i32(&self, at: usize) -> Result<Option<i32>, PgnError> {
        let raw = i32::from_le_bytes(self.bytes(at)?);
        Ok((raw != i32::MAX).then_some(raw))
    }

    fn i64(&self, at: usize) -> Result<Option<i64>, PgnError> {
        let raw = i64::from_le_bytes(self.bytes(at)?);
        Ok((raw != i64::MAX).then_some(raw))
    }
}

// -- Decoding --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadingReference {
    True,
    Magnetic,
}

/// A decoded PGN in repository units (radians, knots, metres, °C).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum N2kReading {
    Heading { heading: f64, reference: HeadingReference },
    RateOfTurn(f64),
    Heave(f64),
    Attitude { pitch: Option<f64>, heel: Option<f64> },
    Variation(f64),
    EngineRpm(f64),
    EngineDynamic {
        oil_temperature: Option<f64>,
        alternator_voltage: Option<f64>,
    },
    WaterSpeed(f64),
    Depth(f64),
    Position { latitude: f64, longitude: f64 },
    CogSog { cog: Option<f64>, sog: Option<f64> },
    ApparentWind { awa: f64, aws: f64 },
    SeaTemperature(f64),
}

/// Outcome of decoding a handled PGN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Reading(N2kReading),
    /// The payload carries the "not available" sentinel in the named field
    NotAvailable(&'static str),
    /// Valid but not for us (other instance, reference or source)
    Filtered,
}

use Decoded::{Filtered, NotAvailable, Reading};

/// Decode a payload. Returns [`PgnError::Unsupported`] for PGNs outside
/// the handled set.
pub fn decode(pgn: u32, payload: &[u8]) -> Result<Decoded, PgnError> {
    let f = Fields { pgn, data: payload };
    let decoded = match pgn {
        PGN_VESSEL_HEADING => {
            let heading = f.u16(1)?;
            let reference = match f.byte(7)? & 0x03 {
                0 => HeadingReference::True,
                1 => HeadingReference::Magnetic,
                _ => return Ok(Filtered),
            };
            match heading {
                Some(raw) => Reading(N2kReading::Heading {
                    heading: normalize_positive(raw as f64 * 1e-4),
                    reference,
                }),
                None => NotAvailable("heading"),
            }
        }
        PGN_RATE_OF_TURN => match f.i32(1)? {
            Some(raw) => Reading(N2kReading::RateOfTurn(raw as f64 * 3.125e-8)),
            None => NotAvailable("rate"),
        },
        PGN_HEAVE => match f.i16(1)? {
            Some(raw) => Reading(N2kReading::Heave(raw as f64 * 0.01)),
            None => NotAvailable("heave"),
        },
        PGN_ATTITUDE => {
            // Yaw at offset 1 is ignored; 127250 is the heading source
            let pitch = f.i16(3)?.map(|raw| raw as f64 * 1e-4);
            let heel = f.i16(5)?.map(|raw| raw as f64 * 1e-4);
            if pitch.is_none() && heel.is_none() {
                NotAvailable("pitch/roll")
            } else {
                Reading(N2kReading::Attitude { pitch, heel })
            }
        }
        PGN_MAGNETIC_VARIATION => match f.i16(4)? {
            Some(raw) => Reading(N2kReading::Variation(raw as f64 * 1e-4)),
            None => NotAvailable("variation"),
        },
        PGN_ENGINE_RAPID => {
            if f.byte(0)? != 0 {
                return Ok(Filtered);
            }
            match f.u16(1)? {
                Some(raw) => Reading(N2kReading::EngineRpm(raw as f64 * 0.25)),
                None => NotAvailable("speed"),
            }
        }
        PGN_ENGINE_DYNAMIC => {
            if f.byte(0)? != 0 {
                return Ok(Filtered);
            }
            let oil_temperature = f.u16(3)?.map(|raw| kelvin_to_celsius(raw as f64 * 0.1));
            let alternator_voltage = f.i16(7)?.map(|raw| raw as f64 * 0.01);
            if oil_temperature.is_none() && alternator_voltage.is_none() {
                NotAvailable("oil temperature/alternator")
            } else {
                Reading(N2kReading::EngineDynamic {
                    oil_temperature,
                    alternator_voltage,
                })
            }
        }
        PGN_SPEED => match f.u16(1)? {
            Some(raw) => Reading(N2kReading::WaterSpeed(mps_to_knots(raw as f64 * 0.01))),
            None => NotAvailable("water speed"),
        },
        PGN_WATER_DEPTH => {
            let depth = f.u32(1)?;
            let offset = f.i16(5)?.map_or(0.0, |raw| raw as f64 * 0.001);
            match depth {
                Some(raw) => Reading(N2kReading::Depth(raw as f64 * 0.01 + offset)),
                None => NotAvailable("depth"),
            }
        }
        PGN_POSITION_RAPID => match (f.i32(0)?, f.i32(4)?) {
            (Some(lat), Some(lon)) => Reading(N2kReading::Position {
                latitude: lat as f64 * 1e-7,
                longitude: lon as f64 * 1e-7,
            }),
            _ => NotAvailable("position"),
        },
        PGN_COG_SOG_RAPID => {
            if f.byte(1)? & 0x03 != 0 {
                return Ok(Filtered);
            }
            let cog = f.u16(2)?.map(|raw| normalize_positive(raw as f64 * 1e-4));
            let sog = f.u16(4)?.map(|raw| mps_to_knots(raw as f64 * 0.01));
            if cog.is_none() && sog.is_none() {
                NotAvailable("cog/sog")
            } else {
                Reading(N2kReading::CogSog { cog, sog })
            }
        }
        PGN_GNSS_POSITION => {
            let latitude = f.i64(7)?;
            let longitude = f.i64(15)?;
            if f.byte(31)? >> 4 == 0 {
                return Ok(Filtered);
            }
            match (latitude, longitude) {
                (Some(lat), Some(lon)) => Reading(N2kReading::Position {
                    latitude: lat as f64 * 1e-16,
                    longitude: lon as f64 * 1e-16,
                }),
                _ => NotAvailable("position"),
            }
        }
        PGN_WIND => {
            let speed = f.u16(1)?;
            let angle = f.u16(3)?;
            // 2 = apparent; true-wind references are dropped
            if f.byte(5)? & 0x07 != 2 {
                return Ok(Filtered);
            }
            match (speed, angle) {
                (Some(speed), Some(angle)) => Reading(N2kReading::ApparentWind {
                    awa: normalize_signed(angle as f64 * 1e-4),
                    aws: mps_to_knots(speed as f64 * 0.01),
                }),
                _ => NotAvailable("wind"),
            }
        }
        PGN_TEMPERATURE_EXTENDED => {
            if f.byte(2)? != 0 {
                return Ok(Filtered);
            }
            match f.u24(3)? {
                Some(raw) => Reading(N2kReading::SeaTemperature(kelvin_to_celsius(
                    raw as f64 * 0.001,
                ))),
                None => NotAvailable("temperature"),
            }
        }
        other => return Err(PgnError::Unsupported(other)),
    };
    Ok(decoded)
}

/// Entity a PGN writes to, and so the one flipped on a parse failure.
pub fn target_entity(pgn: u32) -> Option<EntityKind> {
    match pgn {
        PGN_VESSEL_HEADING | PGN_RATE_OF_TURN | PGN_HEAVE | PGN_ATTITUDE => {
            Some(EntityKind::Compass)
        }
        PGN_MAGNETIC_VARIATION | PGN_POSITION_RAPID | PGN_COG_SOG_RAPID
        | PGN_GNSS_POSITION => Some(EntityKind::Gps),
        PGN_ENGINE_RAPID | PGN_ENGINE_DYNAMIC => Some(EntityKind::Engine),
        PGN_SPEED | PGN_WATER_DEPTH | PGN_TEMPERATURE_EXTENDED => Some(EntityKind::Dst),
        PGN_WIND => Some(EntityKind::Wind),
        _ => None,
    }
}

// -- Handler --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Nmea2000Stats {
    pub handled: u32,
    /// Unknown PGNs and filtered instances or references
    pub ignored: u32,
    pub not_available: u32,
    pub parse_failures: u32,
    /// Decoded but refused by validation, the prioritizer or a full source table
    pub ingress_refused: u32,
    pub inbox_overflows: u32,
}

#[derive(Debug, Default)]
pub struct Nmea2000Handler {
    stats: Nmea2000Stats,
}

impl Nmea2000Handler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Nmea2000Stats {
        self.stats
    }

    /// Handle every message waiting in the inbox.
    pub fn pump(&mut self, inbox: &mut CanInbox, boat: &mut BoatData) {
        while let Some(message) = inbox.pop() {
            self.handle(&message, boat);
        }
        self.stats.inbox_overflows = inbox.dropped();
    }

    pub fn handle(&mut self, message: &N2kMessage, boat: &mut BoatData) {
        let pgn = message.pgn;
        let decoded = match decode(pgn, message.payload()) {
            Ok(decoded) => decoded,
            Err(PgnError::Unsupported(_)) => {
                self.stats.ignored += 1;
                return;
            }
            Err(error) => {
                self.stats.parse_failures += 1;
                let now = boat.now();
                boat.events_mut().error(
                    now,
                    "nmea2000",
                    "parse_failure",
                    format_args!("source={} {}", message.source, error),
                );
                if let Some(entity) = target_entity(pgn) {
                    boat.mark_unavailable(entity);
                }
                return;
            }
        };

        let diagnostics = boat.diagnostics_mut();
        diagnostics.nmea2000_messages = diagnostics.nmea2000_messages.saturating_add(1);
        let reading = match decoded {
            Reading(reading) => reading,
            NotAvailable(field) => {
                self.stats.not_available += 1;
                let now = boat.now();
                boat.events_mut().debug(
                    now,
                    "nmea2000",
                    "not_available",
                    format_args!("pgn={} source={} field={}", pgn, message.source, field),
                );
                return;
            }
            Filtered => {
                self.stats.ignored += 1;
                return;
            }
        };

        self.stats.handled += 1;
        let source = SourceId::format(format_args!("N2K-{}", message.source));
        if !self.ingest(reading, source, boat) {
            self.stats.ingress_refused += 1;
        }
    }

    fn ingest(&mut self, reading: N2kReading, source: SourceId, boat: &mut BoatData) -> bool {
        match reading {
            N2kReading::Heading { heading, reference } => {
                if !ensure_registered(boat, source, SensorClass::Compass) {
                    return false;
                }
                let mut heading_reading = HeadingReading::default();
                match reference {
                    HeadingReference::True => heading_reading.true_heading = Some(heading),
                    HeadingReference::Magnetic => heading_reading.magnetic_heading = Some(heading),
                }
                boat.update_heading(heading_reading, source)
            }
            N2kReading::RateOfTurn(rate) => boat.update_attitude(
                AttitudeReading {
                    rate_of_turn: Some(rate),
                    ..AttitudeReading::default()
                },
                source,
            ),
            N2kReading::Heave(heave) => boat.update_attitude(
                AttitudeReading {
                    heave: Some(heave),
                    ..AttitudeReading::default()
                },
                source,
            ),
            N2kReading::Attitude { pitch, heel } => boat.update_attitude(
                AttitudeReading {
                    pitch,
                    heel,
                    ..AttitudeReading::default()
                },
                source,
            ),
            N2kReading::Variation(variation) => boat.update_variation(variation, source),
            N2kReading::EngineRpm(rpm) => boat.update_engine(
                EngineReading {
                    rpm: Some(rpm),
                    ..EngineReading::default()
                },
                source,
            ),
            N2kReading::EngineDynamic {
                oil_temperature,
                alternator_voltage,
            } => boat.update_engine(
                EngineReading {
                    oil_temperature,
                    alternator_voltage,
                    ..EngineReading::default()
                },
                source,
            ),
            N2kReading::WaterSpeed(speed) => boat.update_dst(
                DstReading {
                    boat_speed: Some(speed),
                    ..DstReading::default()
                },
                source,
            ),
            N2kReading::Depth(depth) => boat.update_dst(
                DstReading {
                    depth: Some(depth),
                    ..DstReading::default()
                },
                source,
            ),
            N2kReading::SeaTemperature(temperature) => boat.update_dst(
                DstReading {
                    sea_temperature: Some(temperature),
                    ..DstReading::default()
                },
                source,
            ),
            N2kReading::Position {
                latitude,
                longitude,
            } => {
                if !ensure_registered(boat, source, SensorClass::Gps) {
                    return false;
                }
                let fix = GpsFix {
                    latitude: Some(latitude),
                    longitude: Some(longitude),
                    ..GpsFix::default()
                };
                boat.update_gps(fix, source)
            }
            N2kReading::CogSog { cog, sog } => {
                if !ensure_registered(boat, source, SensorClass::Gps) {
                    return false;
                }
                let fix = GpsFix {
                    cog,
                    sog,
                    ..GpsFix::default()
                };
                boat.update_gps(fix, source)
            }
            N2kReading::ApparentWind { awa, aws } => boat.update_wind(awa, aws, source),
        }
    }
}

/// Register a bus sender with the prioritizer on first sight.
fn ensure_registered(boat: &mut BoatData, source: SourceId, class: SensorClass) -> bool {
    if boat.prioritizer().manager().find(class, source).is_some() {
        return true;
    }
    match boat.register_source(source, class, Transport::Can) {
        Ok(_) => {
            tracing::info!(%source, class = class.name(), "new NMEA 2000 source");
            true
        }
        Err(SourceError::TableFull(_)) => {
            let now = boat.now();
            boat.events_mut().warn(
                now,
                "sources",
                "table_full",
                format_args!("source={} class={}", source, class.name()),
            );
            false
        }
    }
}
