//! # Sail Gateway Core Library
//!
//! Sensor fusion core of a sailboat instrument gateway. The library ingests
//! NMEA 0183 sentences from a serial port, NMEA 2000 PGN payloads from the CAN
//! bus driver and 1-Wire device pages, fuses them into one in-memory boat model
//! and derives the sailing quantities (true wind, leeway, speed through water,
//! VMG, current) from it.
//!
//! ## Design Philosophy
//!
//! ### Single-threaded and cooperative
//! Every recurring job is a short, non-blocking step driven by
//! [`gateway::Gateway::tick`]. There is no locking: the repository is the
//! only shared state and all writers run on the same thread.
//!
//! ### Fixed memory
//! - **Entities are `Copy` values**: readers get a snapshot by value and can
//!   never observe a torn write
//! - **Fixed tables**: source tables, decode buffers and the event log are
//!   sized once at startup and never grow
//! - **No allocation on the hot path**: diagnostic text goes through a fixed
//!   scratch buffer
//!
//! ### Data Flow
//! 1. **Decode**: protocol handlers turn bytes into typed readings
//! 2. **Validate**: range and rate-of-change checks clamp or reject
//! 3. **Prioritize**: only the active source of a sensor class may write
//! 4. **Write**: the repository replaces the entity and flags a recompute
//! 5. **Derive**: one coalesced recompute per loop tick
//!
//! ## Units
//! Angles are radians (latitude/longitude in decimal degrees), speeds are
//! knots, depth in metres, temperature in degrees Celsius.

// Module declarations
pub mod angles;
pub mod boat_data;
pub mod calibration;
pub mod config;
pub mod derivation;
pub mod events;
pub mod gateway;
pub mod hal;
pub mod nmea0183;
pub mod nmea2000;
pub mod onewire;
pub mod renderer;
pub mod repository;
pub mod scheduler;
pub mod serializer;
pub mod sources;
pub mod validation;

#[cfg(test)]
mod tests;

pub use boat_data::{CalibrationParameters, DerivedData, EntityKind};
pub use gateway::Gateway;
pub use repository::BoatData;

/// Monotonic time in milliseconds since process start.
pub type Millis = u64;

/// A source or entity is fresh while `now - last_update` is below this.
pub const STALE_AFTER_MS: Millis = 5_000;

/// True when a timestamp is still inside the staleness window.
///
/// A timestamp in the future (clock skew between collaborators) counts as
/// fresh.
pub fn is_fresh(last_update: Millis, now: Millis) -> bool {
    now.saturating_sub(last_update) < STALE_AFTER_MS
}
