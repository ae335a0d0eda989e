//! # Boat Data Model
//!
//! Value types for every entity the repository stores. Each entity is a small
//! `Copy` struct carrying its numeric fields plus two common attributes:
//!
//! - `available`: false until a valid reading has arrived, and again after
//!   the entity goes stale or a decoder reports a parse failure
//! - `last_update`: monotonic milliseconds of the last write
//!
//! ## Units
//! - Angles: radians (latitude/longitude: decimal degrees)
//! - Speeds: knots (NMEA 2000 metres-per-second values are converted at ingress)
//! - Depth: metres, temperature: °C, voltage: V, current: A, power: W
//!
//! ## Memory
//! The complete model (all entities plus calibration) is a few hundred bytes
//! and lives inline inside [`crate::repository::BoatData`].

use crate::Millis;
use serde::{Deserialize, Serialize};

/// Common attributes shared by every stored entity.
pub trait Measurement: Copy {
    fn is_available(&self) -> bool;
    fn last_update(&self) -> Millis;
    /// Mark the entity valid and stamp its write time.
    fn stamp(&mut self, at: Millis);
    fn set_available(&mut self, available: bool);
}

macro_rules! measurement {
    ($($entity:ty),+ $(,)?) => {
        $(
            impl Measurement for $entity {
                fn is_available(&self) -> bool {
                    self.available
                }

                fn last_update(&self) -> Millis {
                    self.last_update
                }

                fn stamp(&mut self, at: Millis) {
                    self.available = true;
                    self.last_update = at;
                }

                fn set_available(&mut self, available: bool) {
                    self.available = available;
                }
            }
        )+
    };
}

/// Identifies an entity for availability sweeps, ingress events and logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Gps,
    Compass,
    Dst,
    Wind,
    Rudder,
    Engine,
    Saildrive,
    Battery,
    ShorePower,
    Derived,
}

impl EntityKind {
    /// Every sensor-fed entity, in sweep order. `Derived` is excluded because
    /// its availability follows its inputs.
    pub const SENSED: [EntityKind; 9] = [
        EntityKind::Gps,
        EntityKind::Compass,
        EntityKind::Dst,
        EntityKind::Wind,
        EntityKind::Rudder,
        EntityKind::Engine,
        EntityKind::Saildrive,
        EntityKind::Battery,
        EntityKind::ShorePower,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Gps => "gps",
            EntityKind::Compass => "compass",
            EntityKind::Dst => "dst",
            EntityKind::Wind => "wind",
            EntityKind::Rudder => "rudder",
            EntityKind::Engine => "engine",
            EntityKind::Saildrive => "saildrive",
            EntityKind::Battery => "battery",
            EntityKind::ShorePower => "shore_power",
            EntityKind::Derived => "derived",
        }
    }
}

/// GNSS position and motion. Variation is east positive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsData {
    pub latitude: f64,
    pub longitude: f64,
    pub cog: f64,
    pub sog: f64,
    pub variation: f64,
    pub available: bool,
    pub last_update: Millis,
}

/// Heading and attitude. Rate of turn, heel, pitch and heave come from the
/// attitude sensor; headings from the prioritized compass source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompassData {
    pub true_heading: f64,
    pub magnetic_heading: f64,
    pub rate_of_turn: f64,
    /// Roll, starboard down positive
    pub heel: f64,
    pub pitch: f64,
    /// Metres, positive up
    pub heave: f64,
    pub available: bool,
    pub last_update: Millis,
}

/// Depth, speed, temperature transducer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DstData {
    pub depth: f64,
    /// Paddlewheel speed in knots
    pub boat_speed: f64,
    pub sea_temperature: f64,
    pub available: bool,
    pub last_update: Millis,
}

/// Apparent wind; port angles are negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindData {
    pub awa: f64,
    pub aws: f64,
    pub available: bool,
    pub last_update: Millis,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RudderData {
    pub steering_angle: f64,
    pub available: bool,
    pub last_update: Millis,
}

/// Engine instance 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineData {
    pub rpm: f64,
    pub oil_temperature: f64,
    pub alternator_voltage: f64,
    pub available: bool,
    pub last_update: Millis,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaildriveData {
    pub engaged: bool,
    pub available: bool,
    pub last_update: Millis,
}

/// One battery bank as reported by its monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryBank {
    pub voltage: f64,
    /// Positive while charging
    pub amperage: f64,
    /// Percent
    pub state_of_charge: f64,
    pub shore_charger_on: bool,
    pub engine_charger_on: bool,
    pub available: bool,
}

/// Bank A is the house bank, bank B the starter bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryData {
    pub bank_a: BatteryBank,
    pub bank_b: BatteryBank,
    pub available: bool,
    pub last_update: Millis,
}

/// Selects a bank inside [`BatteryData`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bank {
    A,
    B,
}

impl BatteryData {
    pub fn bank(&self, bank: Bank) -> &BatteryBank {
        match bank {
            Bank::A => &self.bank_a,
            Bank::B => &self.bank_b,
        }
    }

    pub fn bank_mut(&mut self, bank: Bank) -> &mut BatteryBank {
        match bank {
            Bank::A => &mut self.bank_a,
            Bank::B => &mut self.bank_b,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShorePowerData {
    pub connected: bool,
    /// Watts
    pub power: f64,
    pub available: bool,
    pub last_update: Millis,
}

/// Outputs of the derivation engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedData {
    /// Measured AWA plus vane offset, (−π, π]
    pub awa_offset: f64,
    /// Heel-corrected AWA, (−π, π]
    pub awa_heel: f64,
    pub leeway: f64,
    /// Speed through water, knots
    pub stw: f64,
    pub tws: f64,
    pub twa: f64,
    /// Magnetic wind direction, [0, 2π)
    pub wind_direction: f64,
    pub vmg: f64,
    /// Speed of current, knots
    pub soc: f64,
    /// Direction of current, [0, 2π)
    pub doc: f64,
    pub available: bool,
    pub last_update: Millis,
}

measurement!(
    GpsData,
    CompassData,
    DstData,
    WindData,
    RudderData,
    EngineData,
    SaildriveData,
    BatteryData,
    ShorePowerData,
    DerivedData,
);

/// Default leeway factor K.
pub const DEFAULT_LEEWAY_K: f64 = 1.0;

/// Default wind vane alignment offset (radians).
pub const DEFAULT_WIND_ANGLE_OFFSET: f64 = 0.0;

/// Calibration scalars used by the derivation engine.
///
/// `version` increases on every accepted change so consumers can detect a
/// new calibration without comparing floats.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationParameters {
    pub leeway_k: f64,
    /// Radians, within ±2π
    pub wind_angle_offset: f64,
    pub version: u32,
}

impl CalibrationParameters {
    pub fn new(leeway_k: f64, wind_angle_offset: f64) -> Self {
        CalibrationParameters {
            leeway_k,
            wind_angle_offset,
            version: 0,
        }
    }
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        CalibrationParameters::new(DEFAULT_LEEWAY_K, DEFAULT_WIND_ANGLE_OFFSET)
    }
}
