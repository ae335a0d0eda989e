//! # Boat Data Repository
//!
//! The single authoritative store of every entity in [`crate::boat_data`].
//!
//! ## Access Patterns
//! - **Reads** (`get_*`) return entities by value. A never-written entity
//!   reads as `available = false`.
//! - **Direct writes** (`set_*`) replace an entity wholesale and stamp it.
//! - **Ingress** (`update_*`) is the path used by protocol handlers:
//!   1. validate every field present: range, then rate of change against
//!      that field's own last write
//!   2. for GPS and compass headings, record the reading with the source
//!      prioritizer and stop unless the source is the active one
//!   3. replace the entity in one assignment and stamp it
//!   4. flag the derivation engine and notify subscribers
//!
//! A rejected reading returns `false`, leaves the repository untouched and
//! counts against the source.
//!
//! ## Timestamps
//! `last_update` comes from the injected [`Clock`]. Successive writes to the
//! same entity always get strictly increasing stamps, even within one
//! millisecond.

use std::rc::Rc;

use serde::Serialize;

use crate::boat_data::{
    Bank, BatteryData, CalibrationParameters, CompassData, DerivedData, DstData, EngineData,
    EntityKind, GpsData, Measurement, RudderData, SaildriveData, ShorePowerData, WindData,
};
use crate::derivation::{self, Inputs};
use crate::events::EventLog;
use crate::hal::Clock;
use crate::sources::{
    SensorClass, SourceError, SourceHandle, SourceId, SourcePrioritizer, Transport,
};
use crate::validation::{self, Field, Verdict};
use crate::{is_fresh, Millis};

/// Position and motion fields carried by one GNSS sentence or PGN.
/// `None` fields keep their previous value.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GpsFix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub cog: Option<f64>,
    pub sog: Option<f64>,
    pub variation: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HeadingReading {
    pub true_heading: Option<f64>,
    pub magnetic_heading: Option<f64>,
}

/// Attitude sensor fields. Not prioritized: there is one attitude sensor.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AttitudeReading {
    pub rate_of_turn: Option<f64>,
    pub heel: Option<f64>,
    pub pitch: Option<f64>,
    pub heave: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DstReading {
    pub depth: Option<f64>,
    /// Knots
    pub boat_speed: Option<f64>,
    pub sea_temperature: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineReading {
    pub rpm: Option<f64>,
    pub oil_temperature: Option<f64>,
    pub alternator_voltage: Option<f64>,
}

/// One complete battery monitor page.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatteryReading {
    pub voltage: f64,
    pub amperage: f64,
    pub state_of_charge: f64,
    pub shore_charger_on: bool,
    pub engine_charger_on: bool,
}

/// Fired after every successful ingress write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IngressEvent {
    pub entity: EntityKind,
    pub source: SourceId,
    pub at: Millis,
}

/// Counters exposed on the status page and in the JSON snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub nmea0183_messages: u32,
    pub nmea2000_messages: u32,
    pub onewire_reads: u32,
    pub ingress_writes: u32,
    pub rejected_readings: u32,
    pub clamp_warnings: u32,
    pub derivation_runs: u32,
    /// Main loop iterations per second over the last sampling window
    pub loop_frequency: f64,
}

/// Every entity at one instant.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub at: Millis,
    pub gps: GpsData,
    pub compass: CompassData,
    pub dst: DstData,
    pub wind: WindData,
    pub rudder: RudderData,
    pub engine: EngineData,
    pub saildrive: SaildriveData,
    pub battery: BatteryData,
    pub shore_power: ShorePowerData,
    pub derived: DerivedData,
    pub calibration: CalibrationParameters,
    pub diagnostics: Diagnostics,
}

type Subscriber = Box<dyn FnMut(&IngressEvent)>;

/// Most field checks per ingress (attitude and GPS carry five or fewer).
const MAX_FIELDS: usize = 6;

/// Stored numeric fields that carry their own write time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Latitude,
    Longitude,
    Cog,
    Sog,
    Variation,
    TrueHeading,
    MagneticHeading,
    RateOfTurn,
    Heel,
    Pitch,
    Heave,
    Depth,
    BoatSpeed,
    SeaTemperature,
    Awa,
    Aws,
    SteeringAngle,
    EngineRpm,
    OilTemperature,
    AlternatorVoltage,
    ShorePower,
}

impl Slot {
    const COUNT: usize = Slot::ShorePower as usize + 1;

    fn field(self) -> Field {
        match self {
            Slot::Latitude => Field::Latitude,
            Slot::Longitude => Field::Longitude,
            Slot::Cog => Field::Cog,
            Slot::Sog => Field::Sog,
            Slot::Variation => Field::Variation,
            Slot::TrueHeading | Slot::MagneticHeading => Field::Heading,
            Slot::RateOfTurn => Field::RateOfTurn,
            Slot::Heel => Field::Heel,
            Slot::Pitch => Field::Pitch,
            Slot::Heave => Field::Heave,
            Slot::Depth => Field::Depth,
            Slot::BoatSpeed => Field::BoatSpeed,
            Slot::SeaTemperature => Field::SeaTemperature,
            Slot::Awa => Field::ApparentWindAngle,
            Slot::Aws => Field::ApparentWindSpeed,
            Slot::SteeringAngle => Field::Rudder,
            Slot::EngineRpm => Field::EngineRpm,
            Slot::OilTemperature => Field::OilTemperature,
            Slot::AlternatorVoltage => Field::AlternatorVoltage,
            Slot::ShorePower => Field::ShorePower,
        }
    }

    fn of(kind: EntityKind) -> &'static [Slot] {
        match kind {
            EntityKind::Gps => &[
                Slot::Latitude,
                Slot::Longitude,
                Slot::Cog,
                Slot::Sog,
                Slot::Variation,
            ],
            EntityKind::Compass => &[
                Slot::TrueHeading,
                Slot::MagneticHeading,
                Slot::RateOfTurn,
                Slot::Heel,
                Slot::Pitch,
                Slot::Heave,
            ],
            EntityKind::Dst => &[Slot::Depth, Slot::BoatSpeed, Slot::SeaTemperature],
            EntityKind::Wind => &[Slot::Awa, Slot::Aws],
            EntityKind::Rudder => &[Slot::SteeringAngle],
            EntityKind::Engine => &[
                Slot::EngineRpm,
                Slot::OilTemperature,
                Slot::AlternatorVoltage,
            ],
            EntityKind::ShorePower => &[Slot::ShorePower],
            EntityKind::Saildrive | EntityKind::Battery | EntityKind::Derived => &[],
        }
    }
}

/// Fields the derivation engine reads. Defaults stand in for the rest.
const DERIVATION_INPUTS: [Slot; 7] = [
    Slot::MagneticHeading,
    Slot::Heel,
    Slot::BoatSpeed,
    Slot::Awa,
    Slot::Aws,
    Slot::Cog,
    Slot::Sog,
];

/// Write time of every [`Slot`]. `None` until the field is first written
/// and again after its entity is marked unavailable.
#[derive(Clone, Copy, Debug, Default)]
struct FieldStamps([Option<Millis>; Slot::COUNT]);

impl FieldStamps {
    /// Last write of `slot` if it is still inside the staleness window.
    fn fresh(&self, slot: Slot, now: Millis) -> Option<Millis> {
        self.0[slot as usize].filter(|at| is_fresh(*at, now))
    }

    fn stamp(&mut self, slot: Slot, at: Millis) {
        self.0[slot as usize] = Some(at);
    }

    fn stamp_entity(&mut self, kind: EntityKind, at: Millis) {
        for slot in Slot::of(kind) {
            self.stamp(*slot, at);
        }
    }

    fn clear_entity(&mut self, kind: EntityKind) {
        for slot in Slot::of(kind) {
            self.0[*slot as usize] = None;
        }
    }
}

/// Validation pass over the fields of one ingress. Records the first
/// rejection and every warning so nothing is logged or written until the
/// whole reading is known to be acceptable.
struct Screen {
    now: Millis,
    stamps: FieldStamps,
    accepted: [Option<Slot>; MAX_FIELDS],
    accepted_count: usize,
    rejected: Option<(Field, f64, &'static str)>,
    warnings: [Option<(Field, Verdict)>; MAX_FIELDS],
    warning_count: usize,
}

impl Screen {
    fn new(now: Millis, stamps: FieldStamps) -> Self {
        Screen {
            now,
            stamps,
            accepted: [None; MAX_FIELDS],
            accepted_count: 0,
            rejected: None,
            warnings: [None; MAX_FIELDS],
            warning_count: 0,
        }
    }

    /// Range check, then rate of change against the field's own last write.
    /// A field never written, or last written outside the staleness window,
    /// has nothing to be compared with.
    fn field(&mut self, slot: Slot, value: Option<f64>, previous: f64) -> Option<f64> {
        let field = slot.field();
        let accepted = self.range(field, value)?;
        if let Some(at) = self.stamps.fresh(slot, self.now) {
            let elapsed = self.now.saturating_sub(at);
            if !validation::plausible_rate(field, previous, accepted, elapsed) {
                self.rejected = Some((field, accepted, "rate of change"));
                return None;
            }
        }
        if self.accepted_count < MAX_FIELDS {
            self.accepted[self.accepted_count] = Some(slot);
            self.accepted_count += 1;
        }
        Some(accepted)
    }

    /// Range check only.
    fn range(&mut self, field: Field, value: Option<f64>) -> Option<f64> {
        let value = value?;
        if self.rejected.is_some() {
            return None;
        }
        let verdict = validation::check(field, value);
        let Some(accepted) = verdict.value() else {
            self.rejected = Some((field, value, "out of range"));
            return None;
        };
        if verdict.warns() && self.warning_count < MAX_FIELDS {
            self.warnings[self.warning_count] = Some((field, verdict));
            self.warning_count += 1;
        }
        Some(accepted)
    }

    fn accepted(&self) -> impl Iterator<Item = Slot> + '_ {
        self.accepted.iter().flatten().copied()
    }
}

/// The boat-data repository.
pub struct BoatData {
    clock: Rc<dyn Clock>,
    gps: GpsData,
    compass: CompassData,
    dst: DstData,
    wind: WindData,
    rudder: RudderData,
    engine: EngineData,
    saildrive: SaildriveData,
    battery: BatteryData,
    shore_power: ShorePowerData,
    derived: DerivedData,
    calibration: CalibrationParameters,
    stamps: FieldStamps,
    /// Time of the last authoritative variation write
    variation_at: Option<Millis>,
    recompute_pending: bool,
    prioritizer: SourcePrioritizer,
    events: EventLog,
    diagnostics: Diagnostics,
    subscribers: Vec<Subscriber>,
}

impl BoatData {
    pub fn new(clock: Rc<dyn Clock>, events: EventLog) -> Self {
        BoatData {
            clock,
            gps: GpsData::default(),
            compass: CompassData::default(),
            dst: DstData::default(),
            wind: WindData::default(),
            rudder: RudderData::default(),
            engine: EngineData::default(),
            saildrive: SaildriveData::default(),
            battery: BatteryData::default(),
            shore_power: ShorePowerData::default(),
            derived: DerivedData::default(),
            calibration: CalibrationParameters::default(),
            stamps: FieldStamps::default(),
            variation_at: None,
            recompute_pending: false,
            prioritizer: SourcePrioritizer::new(),
            events,
            diagnostics: Diagnostics::default(),
            subscribers: Vec::new(),
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now_ms()
    }

    // -- Snapshot getters --

    pub fn get_gps(&self) -> GpsData {
        self.gps
    }

    pub fn get_compass(&self) -> CompassData {
        self.compass
    }

    pub fn get_dst(&self) -> DstData {
        self.dst
    }

    pub fn get_wind(&self) -> WindData {
        self.wind
    }

    pub fn get_rudder(&self) -> RudderData {
        self.rudder
    }

    pub fn get_engine(&self) -> EngineData {
        self.engine
    }

    pub fn get_saildrive(&self) -> SaildriveData {
        self.saildrive
    }

    pub fn get_battery(&self) -> BatteryData {
        self.battery
    }

    pub fn get_shore_power(&self) -> ShorePowerData {
        self.shore_power
    }

    pub fn get_derived(&self) -> DerivedData {
        self.derived
    }

    pub fn get_calibration(&self) -> CalibrationParameters {
        self.calibration
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            at: self.now(),
            gps: self.gps,
            compass: self.compass,
            dst: self.dst,
            wind: self.wind,
            rudder: self.rudder,
            engine: self.engine,
            saildrive: self.saildrive,
            battery: self.battery,
            shore_power: self.shore_power,
            derived: self.derived,
            calibration: self.calibration,
            diagnostics: self.diagnostics,
        }
    }

    // -- Direct setters --

    pub fn set_gps(&mut self, value: GpsData) {
        self.gps = self.stamped(value, self.gps.last_update);
        self.stamps.stamp_entity(EntityKind::Gps, self.now());
        self.recompute_pending = true;
    }

    pub fn set_compass(&mut self, value: CompassData) {
        self.compass = self.stamped(value, self.compass.last_update);
        self.stamps.stamp_entity(EntityKind::Compass, self.now());
        self.recompute_pending = true;
    }

    pub fn set_dst(&mut self, value: DstData) {
        self.dst = self.stamped(value, self.dst.last_update);
        self.stamps.stamp_entity(EntityKind::Dst, self.now());
        self.recompute_pending = true;
    }

    pub fn set_wind(&mut self, value: WindData) {
        self.wind = self.stamped(value, self.wind.last_update);
        self.stamps.stamp_entity(EntityKind::Wind, self.now());
        self.recompute_pending = true;
    }

    pub fn set_rudder(&mut self, value: RudderData) {
        self.rudder = self.stamped(value, self.rudder.last_update);
        self.stamps.stamp_entity(EntityKind::Rudder, self.now());
    }

    pub fn set_engine(&mut self, value: EngineData) {
        self.engine = self.stamped(value, self.engine.last_update);
        self.stamps.stamp_entity(EntityKind::Engine, self.now());
    }

    pub fn set_saildrive(&mut self, value: SaildriveData) {
        self.saildrive = self.stamped(value, self.saildrive.last_update);
    }

    pub fn set_battery(&mut self, value: BatteryData) {
        self.battery = self.stamped(value, self.battery.last_update);
    }

    pub fn set_shore_power(&mut self, value: ShorePowerData) {
        self.shore_power = self.stamped(value, self.shore_power.last_update);
        self.stamps.stamp_entity(EntityKind::ShorePower, self.now());
    }

    /// Written by the derivation engine; does not schedule a recompute.
    pub fn set_derived(&mut self, value: DerivedData) {
        self.derived = self.stamped(value, self.derived.last_update);
    }

    /// Adopt new calibration values and schedule a recompute.
    pub fn set_calibration(&mut self, calibration: CalibrationParameters) {
        self.calibration = calibration;
        self.recompute_pending = true;
    }

    fn stamped<M: Measurement>(&self, mut value: M, previous: Millis) -> M {
        value.stamp(self.now().max(previous + 1));
        value
    }

    // -- Sources --

    pub fn register_source(
        &mut self,
        id: SourceId,
        class: SensorClass,
        transport: Transport,
    ) -> Result<SourceHandle, SourceError> {
        self.prioritizer.register_id(id, class, transport)
    }

    pub fn prioritizer(&self) -> &SourcePrioritizer {
        &self.prioritizer
    }

    pub fn prioritizer_mut(&mut self) -> &mut SourcePrioritizer {
        &mut self.prioritizer
    }

    /// Periodic priority recomputation.
    pub fn update_priorities(&mut self) {
        let now = self.now();
        self.prioritizer.update_priorities(now);
    }

    /// Periodic stale sweep over sources and entities.
    pub fn check_stale(&mut self) {
        let now = self.now();
        let events = &mut self.events;
        self.prioritizer.check_stale(now, |source| {
            events.warn(
                now,
                "sources",
                "source_stale",
                format_args!(
                    "source={} class={} last_update={}",
                    source.id,
                    source.class.name(),
                    source.last_update
                ),
            );
        });
        self.sweep_stale_entities(now);
    }

    fn sweep_stale_entities(&mut self, now: Millis) {
        for kind in EntityKind::SENSED {
            let (available, last_update) = self.availability(kind);
            if available && !is_fresh(last_update, now) {
                self.mark_unavailable(kind);
                self.events.info(
                    now,
                    "repository",
                    "entity_stale",
                    format_args!("entity={} last_update={}", kind.name(), last_update),
                );
            }
        }
    }

    fn availability(&self, kind: EntityKind) -> (bool, Millis) {
        match kind {
            EntityKind::Gps => (self.gps.available, self.gps.last_update),
            EntityKind::Compass => (self.compass.available, self.compass.last_update),
            EntityKind::Dst => (self.dst.available, self.dst.last_update),
            EntityKind::Wind => (self.wind.available, self.wind.last_update),
            EntityKind::Rudder => (self.rudder.available, self.rudder.last_update),
            EntityKind::Engine => (self.engine.available, self.engine.last_update),
            EntityKind::Saildrive => (self.saildrive.available, self.saildrive.last_update),
            EntityKind::Battery => (self.battery.available, self.battery.last_update),
            EntityKind::ShorePower => (self.shore_power.available, self.shore_power.last_update),
            EntityKind::Derived => (self.derived.available, self.derived.last_update),
        }
    }

    /// Flip an entity to "not available" without touching its values.
    pub fn mark_unavailable(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Gps => self.gps.available = false,
            EntityKind::Compass => self.compass.available = false,
            EntityKind::Dst => self.dst.available = false,
            EntityKind::Wind => self.wind.available = false,
            EntityKind::Rudder => self.rudder.available = false,
            EntityKind::Engine => self.engine.available = false,
            EntityKind::Saildrive => self.saildrive.available = false,
            EntityKind::Battery => {
                self.battery.available = false;
                self.battery.bank_a.available = false;
                self.battery.bank_b.available = false;
            }
            EntityKind::ShorePower => self.shore_power.available = false,
            EntityKind::Derived => self.derived.available = false,
        }
        self.stamps.clear_entity(kind);
        if matches!(
            kind,
            EntityKind::Gps | EntityKind::Compass | EntityKind::Dst | EntityKind::Wind
        ) {
            self.recompute_pending = true;
        }
    }

    pub fn mark_bank_unavailable(&mut self, bank: Bank) {
        self.battery.bank_mut(bank).available = false;
        self.battery.available = self.battery.bank_a.available || self.battery.bank_b.available;
    }

    // -- Ingress --

    /// GNSS ingress (prioritized, GPS class).
    ///
    /// Variation in `fix` is ignored while an authoritative variation
    /// (PGN 127258) is fresh.
    pub fn update_gps(&mut self, mut fix: GpsFix, source: SourceId) -> bool {
        let now = self.now();
        let Some(handle) = self.resolve(SensorClass::Gps, source, now) else {
            return false;
        };
        if self.variation_at.map_or(false, |at| is_fresh(at, now)) {
            fix.variation = None;
        }

        let previous = self.gps;
        let mut screen = Screen::new(now, self.stamps);
        let latitude = screen.field(Slot::Latitude, fix.latitude, previous.latitude);
        let longitude = screen.field(Slot::Longitude, fix.longitude, previous.longitude);
        let cog = screen.field(Slot::Cog, fix.cog, previous.cog);
        let sog = screen.field(Slot::Sog, fix.sog, previous.sog);
        let variation = screen.field(Slot::Variation, fix.variation, previous.variation);
        if !self.settle(&screen, source, Some(handle)) {
            return false;
        }

        if !self.admit(handle, now) {
            return false;
        }
        let mut next = previous;
        next.latitude = latitude.unwrap_or(previous.latitude);
        next.longitude = longitude.unwrap_or(previous.longitude);
        next.cog = cog.unwrap_or(previous.cog);
        next.sog = sog.unwrap_or(previous.sog);
        next.variation = variation.unwrap_or(previous.variation);
        self.gps = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Gps, source, self.gps.last_update);
        true
    }

    /// Authoritative magnetic variation (PGN 127258). Updates the GPS entity's
    /// variation field without changing its availability or stamp.
    pub fn update_variation(&mut self, variation: f64, source: SourceId) -> bool {
        let now = self.now();
        // Rate of change does not apply to a slowly varying almanac value
        let mut screen = Screen::new(now, self.stamps);
        let Some(variation) = screen.range(Field::Variation, Some(variation)) else {
            self.settle(&screen, source, None);
            return false;
        };
        let mut next = self.gps;
        next.variation = variation;
        self.gps = next;
        self.variation_at = Some(now);
        self.stamps.stamp(Slot::Variation, now);
        self.written(EntityKind::Gps, source, now);
        true
    }

    /// Heading ingress (prioritized, compass class).
    pub fn update_heading(&mut self, reading: HeadingReading, source: SourceId) -> bool {
        let now = self.now();
        let Some(handle) = self.resolve(SensorClass::Compass, source, now) else {
            return false;
        };
        let previous = self.compass;
        let mut screen = Screen::new(now, self.stamps);
        let true_heading =
            screen.field(Slot::TrueHeading, reading.true_heading, previous.true_heading);
        let magnetic_heading =
            screen.field(Slot::MagneticHeading, reading.magnetic_heading, previous.magnetic_heading);
        if !self.settle(&screen, source, Some(handle)) {
            return false;
        }

        if !self.admit(handle, now) {
            return false;
        }
        let mut next = previous;
        next.true_heading = true_heading.unwrap_or(previous.true_heading);
        next.magnetic_heading = magnetic_heading.unwrap_or(previous.magnetic_heading);
        self.compass = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Compass, source, self.compass.last_update);
        true
    }

    /// Attitude ingress: rate of turn, heel, pitch, heave.
    pub fn update_attitude(&mut self, reading: AttitudeReading, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.compass;
        let mut screen = Screen::new(now, self.stamps);
        let rate_of_turn =
            screen.field(Slot::RateOfTurn, reading.rate_of_turn, previous.rate_of_turn);
        let heel = screen.field(Slot::Heel, reading.heel, previous.heel);
        let pitch = screen.field(Slot::Pitch, reading.pitch, previous.pitch);
        let heave = screen.field(Slot::Heave, reading.heave, previous.heave);
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.rate_of_turn = rate_of_turn.unwrap_or(previous.rate_of_turn);
        next.heel = heel.unwrap_or(previous.heel);
        next.pitch = pitch.unwrap_or(previous.pitch);
        next.heave = heave.unwrap_or(previous.heave);
        self.compass = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Compass, source, self.compass.last_update);
        true
    }

    /// Apparent wind ingress. True-wind readings never reach this point.
    pub fn update_wind(&mut self, awa: f64, aws: f64, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.wind;
        let mut screen = Screen::new(now, self.stamps);
        let awa = screen.field(Slot::Awa, Some(awa), previous.awa);
        let aws = screen.field(Slot::Aws, Some(aws), previous.aws);
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.awa = awa.unwrap_or(previous.awa);
        next.aws = aws.unwrap_or(previous.aws);
        self.wind = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Wind, source, self.wind.last_update);
        true
    }

    pub fn update_dst(&mut self, reading: DstReading, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.dst;
        let mut screen = Screen::new(now, self.stamps);
        let depth = screen.field(Slot::Depth, reading.depth, previous.depth);
        let boat_speed = screen.field(Slot::BoatSpeed, reading.boat_speed, previous.boat_speed);
        let sea_temperature = screen.field(
            Slot::SeaTemperature,
            reading.sea_temperature,
            previous.sea_temperature,
        );
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.depth = depth.unwrap_or(previous.depth);
        next.boat_speed = boat_speed.unwrap_or(previous.boat_speed);
        next.sea_temperature = sea_temperature.unwrap_or(previous.sea_temperature);
        self.dst = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Dst, source, self.dst.last_update);
        true
    }

    pub fn update_rudder(&mut self, steering_angle: f64, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.rudder;
        let mut screen = Screen::new(now, self.stamps);
        let angle = screen.field(Slot::SteeringAngle, Some(steering_angle), previous.steering_angle);
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.steering_angle = angle.unwrap_or(previous.steering_angle);
        self.rudder = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Rudder, source, self.rudder.last_update);
        true
    }

    pub fn update_engine(&mut self, reading: EngineReading, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.engine;
        let mut screen = Screen::new(now, self.stamps);
        let rpm = screen.field(Slot::EngineRpm, reading.rpm, previous.rpm);
        let oil_temperature = screen.field(
            Slot::OilTemperature,
            reading.oil_temperature,
            previous.oil_temperature,
        );
        let alternator_voltage = screen.field(
            Slot::AlternatorVoltage,
            reading.alternator_voltage,
            previous.alternator_voltage,
        );
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.rpm = rpm.unwrap_or(previous.rpm);
        next.oil_temperature = oil_temperature.unwrap_or(previous.oil_temperature);
        next.alternator_voltage = alternator_voltage.unwrap_or(previous.alternator_voltage);
        self.engine = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::Engine, source, self.engine.last_update);
        true
    }

    pub fn update_saildrive(&mut self, engaged: bool, source: SourceId) -> bool {
        let mut next = self.saildrive;
        next.engaged = engaged;
        self.saildrive = self.stamped(next, self.saildrive.last_update);
        self.written(EntityKind::Saildrive, source, self.saildrive.last_update);
        true
    }

    /// One bank's monitor page. The other bank is left as it was.
    pub fn update_battery(
        &mut self,
        bank: Bank,
        reading: BatteryReading,
        source: SourceId,
    ) -> bool {
        let now = self.now();
        let previous = self.battery;
        let current = *previous.bank(bank);
        // Battery values are not rate-checked
        let mut screen = Screen::new(now, self.stamps);
        let voltage = screen.range(Field::BatteryVoltage, Some(reading.voltage));
        let amperage = screen.range(Field::BatteryCurrent, Some(reading.amperage));
        let state_of_charge = screen.range(Field::StateOfCharge, Some(reading.state_of_charge));
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        let slot = next.bank_mut(bank);
        slot.voltage = voltage.unwrap_or(current.voltage);
        slot.amperage = amperage.unwrap_or(current.amperage);
        slot.state_of_charge = state_of_charge.unwrap_or(current.state_of_charge);
        slot.shore_charger_on = reading.shore_charger_on;
        slot.engine_charger_on = reading.engine_charger_on;
        slot.available = true;
        self.battery = self.stamped(next, previous.last_update);
        self.written(EntityKind::Battery, source, self.battery.last_update);
        true
    }

    pub fn update_shore_power(&mut self, connected: bool, power: f64, source: SourceId) -> bool {
        let now = self.now();
        let previous = self.shore_power;
        let mut screen = Screen::new(now, self.stamps);
        let power = screen.field(Slot::ShorePower, Some(power), previous.power);
        if !self.settle(&screen, source, None) {
            return false;
        }

        let mut next = previous;
        next.connected = connected;
        next.power = power.unwrap_or(previous.power);
        self.shore_power = self.stamped(next, previous.last_update);
        self.commit(&screen);
        self.written(EntityKind::ShorePower, source, self.shore_power.last_update);
        true
    }

    /// Registered handle for a prioritized source, or `None` (with a WARN)
    /// when the source never registered.
    fn resolve(
        &mut self,
        class: SensorClass,
        source: SourceId,
        now: Millis,
    ) -> Option<SourceHandle> {
        let handle = self.prioritizer.manager().find(class, source);
        if handle.is_none() {
            self.events.warn(
                now,
                "repository",
                "unknown_source",
                format_args!("source={} class={}", source, class.name()),
            );
        }
        handle
    }

    /// Timestamp the reading with the prioritizer; true if the source may write.
    fn admit(&mut self, handle: SourceHandle, now: Millis) -> bool {
        self.prioritizer.record_update(handle, now);
        self.prioritizer.is_active(handle)
    }

    /// Log the outcome of a screen. Returns false if the reading was rejected.
    fn settle(
        &mut self,
        screen: &Screen,
        source: SourceId,
        handle: Option<SourceHandle>,
    ) -> bool {
        if let Some((field, value, reason)) = screen.rejected {
            if let Some(handle) = handle {
                self.prioritizer.record_reject(handle);
            }
            self.diagnostics.rejected_readings =
                self.diagnostics.rejected_readings.saturating_add(1);
            self.events.warn(
                screen.now,
                "validation",
                "rejected",
                format_args!(
                    "source={} field={} value={:.4} reason={}",
                    source,
                    field.name(),
                    value,
                    reason
                ),
            );
            return false;
        }
        for (field, verdict) in screen.warnings.iter().flatten() {
            self.diagnostics.clamp_warnings = self.diagnostics.clamp_warnings.saturating_add(1);
            match *verdict {
                Verdict::Clamped { value, original } => self.events.warn(
                    screen.now,
                    "validation",
                    "clamped",
                    format_args!(
                        "source={} field={} value={:.4} limit={:.4}",
                        source,
                        field.name(),
                        original,
                        value
                    ),
                ),
                other => self.events.warn(
                    screen.now,
                    "validation",
                    "off_nominal",
                    format_args!(
                        "source={} field={} value={:.4}",
                        source,
                        field.name(),
                        other.value().unwrap_or(f64::NAN)
                    ),
                ),
            }
        }
        true
    }

    /// Stamp every field the screen let through.
    fn commit(&mut self, screen: &Screen) {
        for slot in screen.accepted() {
            self.stamps.stamp(slot, screen.now);
        }
    }

    fn written(&mut self, entity: EntityKind, source: SourceId, at: Millis) {
        if matches!(
            entity,
            EntityKind::Gps | EntityKind::Compass | EntityKind::Dst | EntityKind::Wind
        ) {
            self.recompute_pending = true;
        }
        self.diagnostics.ingress_writes = self.diagnostics.ingress_writes.saturating_add(1);
        let event = IngressEvent { entity, source, at };
        for subscriber in self.subscribers.iter_mut() {
            subscriber(&event);
        }
    }

    // -- Derivation --

    pub fn recompute_pending(&self) -> bool {
        self.recompute_pending
    }

    /// Run the derivation engine once if any input changed since the last
    /// run. Returns true if it ran.
    ///
    /// Every field the engine reads must have a fresh write of its own; an
    /// entity kept available by its other fields is not enough.
    pub fn run_pending_derivation(&mut self) -> bool {
        if !self.recompute_pending {
            return false;
        }
        self.recompute_pending = false;
        self.diagnostics.derivation_runs = self.diagnostics.derivation_runs.saturating_add(1);

        let now = self.now();
        let ready = DERIVATION_INPUTS
            .iter()
            .all(|slot| self.stamps.fresh(*slot, now).is_some());
        let inputs = Inputs {
            gps: self.gps,
            compass: self.compass,
            dst: self.dst,
            wind: self.wind,
        };
        let derived = if ready {
            derivation::derive(&inputs, &self.calibration)
        } else {
            None
        };
        match derived {
            Some(derived) => self.set_derived(derived),
            None => self.derived.available = false,
        }
        true
    }

    // -- Collaborator access --

    /// Register a hook fired after every successful ingress. Subscribers are
    /// expected to register at startup.
    pub fn subscribe(&mut self, hook: impl FnMut(&IngressEvent) + 'static) {
        self.subscribers.push(Box::new(hook));
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventLog {
        &mut self.events
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }
}
