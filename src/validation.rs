//! # Ingress Validation
//!
//! Range and plausibility gate applied to every reading before it reaches the
//! repository. The policy is expressed as data: [`RULES`] holds one row per
//! field (range, what to do below and above it, optional nominal band) and
//! [`RATE_RULES`] the maximum plausible rate of change. Adding a field is a
//! table edit.
//!
//! ## Verdicts
//! - **Accept**: value inside its range
//! - **OffNominal**: inside range but outside the nominal band (warn, keep)
//! - **Clamped**: capped to the nearest limit (warn, keep the capped value)
//! - **Reject**: the ingress must not mutate the repository
//!
//! Non-finite values are always rejected.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_3, FRAC_PI_4, FRAC_PI_6, PI, TAU};

use crate::angles::angle_difference;

/// Every validated field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Latitude,
    Longitude,
    Cog,
    Sog,
    Heading,
    Variation,
    RateOfTurn,
    Heel,
    Pitch,
    Heave,
    ApparentWindAngle,
    ApparentWindSpeed,
    BoatSpeed,
    Rudder,
    Depth,
    SeaTemperature,
    OilTemperature,
    AlternatorVoltage,
    BatteryVoltage,
    BatteryCurrent,
    StateOfCharge,
    EngineRpm,
    ShorePower,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Latitude => "latitude",
            Field::Longitude => "longitude",
            Field::Cog => "cog",
            Field::Sog => "sog",
            Field::Heading => "heading",
            Field::Variation => "variation",
            Field::RateOfTurn => "rate_of_turn",
            Field::Heel => "heel",
            Field::Pitch => "pitch",
            Field::Heave => "heave",
            Field::ApparentWindAngle => "awa",
            Field::ApparentWindSpeed => "aws",
            Field::BoatSpeed => "boat_speed",
            Field::Rudder => "rudder",
            Field::Depth => "depth",
            Field::SeaTemperature => "sea_temperature",
            Field::OilTemperature => "oil_temperature",
            Field::AlternatorVoltage => "alternator_voltage",
            Field::BatteryVoltage => "battery_voltage",
            Field::BatteryCurrent => "battery_current",
            Field::StateOfCharge => "state_of_charge",
            Field::EngineRpm => "engine_rpm",
            Field::ShorePower => "shore_power",
        }
    }
}

/// What to do with a value on one side of its range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutOfRange {
    Reject,
    Clamp,
}

/// One row of the range table.
#[derive(Clone, Copy, Debug)]
pub struct Rule {
    pub field: Field,
    pub min: f64,
    pub max: f64,
    /// Upper bound is open (`[min, max)`), used for full-circle angles
    pub max_exclusive: bool,
    pub below: OutOfRange,
    pub above: OutOfRange,
    /// Values in range but outside this band are kept with a warning
    pub nominal: Option<(f64, f64)>,
}

const fn reject(field: Field, min: f64, max: f64) -> Rule {
    Rule {
        field,
        min,
        max,
        max_exclusive: false,
        below: OutOfRange::Reject,
        above: OutOfRange::Reject,
        nominal: None,
    }
}

const fn clamp(field: Field, min: f64, max: f64) -> Rule {
    Rule {
        field,
        min,
        max,
        max_exclusive: false,
        below: OutOfRange::Clamp,
        above: OutOfRange::Clamp,
        nominal: None,
    }
}

const fn circle(field: Field) -> Rule {
    Rule {
        field,
        min: 0.0,
        max: TAU,
        max_exclusive: true,
        below: OutOfRange::Reject,
        above: OutOfRange::Reject,
        nominal: None,
    }
}

/// The range table. Angles in radians, latitude/longitude in decimal degrees.
pub const RULES: &[Rule] = &[
    reject(Field::Latitude, -90.0, 90.0),
    reject(Field::Longitude, -180.0, 180.0),
    circle(Field::Cog),
    reject(Field::Sog, 0.0, 100.0),
    circle(Field::Heading),
    reject(Field::Variation, -FRAC_PI_6, FRAC_PI_6),
    reject(Field::RateOfTurn, -PI, PI),
    reject(Field::Heel, -FRAC_PI_2, FRAC_PI_2),
    clamp(Field::Pitch, -FRAC_PI_6, FRAC_PI_6),
    clamp(Field::Heave, -5.0, 5.0),
    reject(Field::ApparentWindAngle, -PI, PI),
    reject(Field::ApparentWindSpeed, 0.0, 100.0),
    reject(Field::BoatSpeed, 0.0, 50.0),
    reject(Field::Rudder, -FRAC_PI_2, FRAC_PI_2),
    Rule {
        field: Field::Depth,
        min: 0.0,
        max: 100.0,
        max_exclusive: false,
        below: OutOfRange::Reject,
        above: OutOfRange::Clamp,
        nominal: None,
    },
    clamp(Field::SeaTemperature, -10.0, 50.0),
    Rule {
        nominal: Some((-10.0, 120.0)),
        ..clamp(Field::OilTemperature, -10.0, 150.0)
    },
    Rule {
        nominal: Some((12.0, 15.0)),
        ..clamp(Field::AlternatorVoltage, 0.0, 30.0)
    },
    Rule {
        nominal: Some((10.0, 15.0)),
        ..clamp(Field::BatteryVoltage, 0.0, 30.0)
    },
    clamp(Field::BatteryCurrent, -200.0, 200.0),
    clamp(Field::StateOfCharge, 0.0, 100.0),
    clamp(Field::EngineRpm, 0.0, 6000.0),
    clamp(Field::ShorePower, 0.0, 5000.0),
];

/// Look up the range rule for a field.
pub fn rule(field: Field) -> Option<&'static Rule> {
    RULES.iter().find(|rule| rule.field == field)
}

/// Outcome of a range check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Accept(f64),
    OffNominal(f64),
    Clamped { value: f64, original: f64 },
    Reject,
}

impl Verdict {
    /// Value to store, if any.
    pub fn value(self) -> Option<f64> {
        match self {
            Verdict::Accept(value) | Verdict::OffNominal(value) => Some(value),
            Verdict::Clamped { value, .. } => Some(value),
            Verdict::Reject => None,
        }
    }

    /// True when the verdict should produce a WARN event.
    pub fn warns(self) -> bool {
        matches!(self, Verdict::OffNominal(_) | Verdict::Clamped { .. })
    }
}

/// Check one value against its range rule.
pub fn check(field: Field, value: f64) -> Verdict {
    if !value.is_finite() {
        return Verdict::Reject;
    }
    let Some(rule) = rule(field) else {
        return Verdict::Accept(value);
    };

    if value < rule.min {
        return match rule.below {
            OutOfRange::Reject => Verdict::Reject,
            OutOfRange::Clamp => Verdict::Clamped {
                value: rule.min,
                original: value,
            },
        };
    }

    let over = if rule.max_exclusive {
        value >= rule.max
    } else {
        value > rule.max
    };
    if over {
        return match rule.above {
            OutOfRange::Reject => Verdict::Reject,
            OutOfRange::Clamp => Verdict::Clamped {
                value: rule.max,
                original: value,
            },
        };
    }

    match rule.nominal {
        Some((low, high)) if value < low || value > high => Verdict::OffNominal(value),
        _ => Verdict::Accept(value),
    }
}

// -- Rate of change --

/// Maximum plausible change per second for one field.
#[derive(Clone, Copy, Debug)]
pub struct RateRule {
    pub field: Field,
    pub max_per_second: f64,
    /// Compare with the shortest angular difference
    pub wraps: bool,
}

const fn rate(field: Field, max_per_second: f64, wraps: bool) -> RateRule {
    RateRule {
        field,
        max_per_second,
        wraps,
    }
}

pub const RATE_RULES: &[RateRule] = &[
    rate(Field::Latitude, 0.1, false),
    rate(Field::Longitude, 0.1, false),
    rate(Field::Cog, PI, true),
    rate(Field::Heading, PI, true),
    rate(Field::Sog, 10.0, false),
    rate(Field::ApparentWindAngle, TAU, true),
    rate(Field::ApparentWindSpeed, 30.0, false),
    rate(Field::Heel, FRAC_PI_4, false),
    rate(Field::BoatSpeed, 5.0, false),
    rate(Field::Rudder, FRAC_PI_3, false),
];

/// True when moving from `previous` to `current` in `elapsed_ms` is
/// physically plausible. Fields without a rate rule and a zero interval
/// always pass.
pub fn plausible_rate(field: Field, previous: f64, current: f64, elapsed_ms: u64) -> bool {
    let Some(rule) = RATE_RULES.iter().find(|rule| rule.field == field) else {
        return true;
    };
    if elapsed_ms == 0 {
        return true;
    }
    let delta = if rule.wraps {
        angle_difference(previous, current).abs()
    } else {
        (current - previous).abs()
    };
    let per_second = delta / (elapsed_ms as f64 / 1000.0);
    per_second <= rule.max_per_second
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [f64; 9] = [-1e6, -500.0, -3.5, -0.2, 0.0, 0.2, 3.5, 500.0, 1e6];

    #[test]
    fn test_every_field_has_one_rule() {
        for (i, rule) in RULES.iter().enumerate() {
            assert!(rule.min < rule.max, "{} has an empty range", rule.field.name());
            assert!(
                RULES[i + 1..].iter().all(|other| other.field != rule.field),
                "{} listed twice",
                rule.field.name()
            );
        }
    }

    #[test]
    fn test_clamp_is_idempotent() {
        for rule in RULES {
            for sample in SAMPLES {
                if let Some(first) = check(rule.field, sample).value() {
                    let second = check(rule.field, first);
                    assert_eq!(second.value(), Some(first), "field {}", rule.field.name());
                    assert!(!matches!(second, Verdict::Clamped { .. }));
                }
            }
        }
    }

    #[test]
    fn test_in_range_values_pass_unchanged() {
        for rule in RULES {
            let mid = (rule.min + rule.max) / 2.0;
            assert_eq!(check(rule.field, mid).value(), Some(mid), "{}", rule.field.name());
        }
    }

    #[test]
    fn test_reject_policies() {
        assert_eq!(check(Field::Latitude, 90.5), Verdict::Reject);
        assert_eq!(check(Field::Longitude, -180.1), Verdict::Reject);
        assert_eq!(check(Field::Heading, TAU), Verdict::Reject);
        assert_eq!(check(Field::Cog, -0.01), Verdict::Reject);
        assert_eq!(check(Field::ApparentWindSpeed, 100.5), Verdict::Reject);
        assert_eq!(check(Field::Depth, -0.5), Verdict::Reject);
        assert_eq!(check(Field::Sog, f64::NAN), Verdict::Reject);
    }

    #[test]
    fn test_clamp_policies() {
        assert_eq!(
            check(Field::Heave, 7.0),
            Verdict::Clamped {
                value: 5.0,
                original: 7.0
            }
        );
        assert_eq!(check(Field::Pitch, -1.0).value(), Some(-FRAC_PI_6));
        assert_eq!(check(Field::EngineRpm, 7200.0).value(), Some(6000.0));
        assert_eq!(check(Field::Depth, 250.0).value(), Some(100.0));
        assert!(check(Field::ShorePower, 9000.0).warns());
    }

    #[test]
    fn test_nominal_band_warns_but_keeps() {
        assert_eq!(check(Field::BatteryVoltage, 9.2), Verdict::OffNominal(9.2));
        assert!(check(Field::BatteryVoltage, 9.2).warns());
        assert_eq!(check(Field::BatteryVoltage, 12.7), Verdict::Accept(12.7));
        assert!(check(Field::OilTemperature, 125.0).warns());
    }

    #[test]
    fn test_rate_of_change() {
        // 0.05 degrees in one second is fine, 0.5 is a jump
        assert!(plausible_rate(Field::Latitude, 48.0, 48.05, 1000));
        assert!(!plausible_rate(Field::Latitude, 48.0, 48.5, 1000));
        // Heading across north is a small change
        assert!(plausible_rate(Field::Heading, 6.2, 0.05, 100));
        assert!(!plausible_rate(Field::Heading, 0.0, 3.0, 100));
        assert!(plausible_rate(Field::Depth, 1.0, 90.0, 10));
        assert!(plausible_rate(Field::Sog, 0.0, 50.0, 0));
    }
}
