//! # Angle and Unit Helpers
//!
//! Small, allocation-free conversions shared by the protocol decoders and the
//! derivation engine. All angles inside the crate are radians; degrees only
//! appear at protocol boundaries and in the status page.

use std::f64::consts::{PI, TAU};

/// Knots per metre-per-second.
pub const KNOTS_PER_MPS: f64 = 1.943_844_5;

/// Offset between Kelvin and degrees Celsius.
pub const KELVIN_OFFSET: f64 = 273.15;

/// Wrap an angle into (−π, +π].
pub fn normalize_signed(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI {
        wrapped - TAU
    } else {
        wrapped
    }
}

/// Wrap an angle into [0, 2π).
pub fn normalize_positive(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}

/// Shortest signed difference `to − from`, in (−π, +π].
pub fn angle_difference(from: f64, to: f64) -> f64 {
    normalize_signed(to - from)
}

pub fn deg_to_rad(degrees: f64) -> f64 {
    degrees.to_radians()
}

pub fn rad_to_deg(radians: f64) -> f64 {
    radians.to_degrees()
}

pub fn mps_to_knots(mps: f64) -> f64 {
    mps * KNOTS_PER_MPS
}

pub fn knots_to_mps(knots: f64) -> f64 {
    knots / KNOTS_PER_MPS
}

pub fn kelvin_to_celsius(kelvin: f64) -> f64 {
    kelvin - KELVIN_OFFSET
}

/// Convert an NMEA `DDMM.MMMM` (or `DDDMM.MMMM`) coordinate to decimal
/// degrees, applying the hemisphere letter.
///
/// Returns `None` for an unknown hemisphere or non-finite input.
pub fn ddmm_to_decimal(ddmm: f64, hemisphere: char) -> Option<f64> {
    if !ddmm.is_finite() || ddmm < 0.0 {
        return None;
    }
    let degrees = (ddmm / 100.0).trunc();
    let minutes = ddmm - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        'N' | 'E' => Some(decimal),
        'S' | 'W' => Some(-decimal),
        _ => None,
    }
}

/// `atan2` with the axis-aligned fallback used when both components vanish:
/// 0 unless the `y` component carries a negative sign, then π.
pub fn safe_atan2(y: f64, x: f64) -> f64 {
    if y == 0.0 && x == 0.0 {
        if y.is_sign_negative() {
            PI
        } else {
            0.0
        }
    } else {
        y.atan2(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_normalize_signed_range() {
        assert_abs_diff_eq!(normalize_signed(PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_signed(-PI), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_signed(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_signed(-0.25), -0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_signed(5.0 * TAU + 0.1), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_normalize_positive_range() {
        assert_abs_diff_eq!(normalize_positive(-PI / 2.0), 3.0 * PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_positive(TAU), 0.0, epsilon = 1e-12);
        assert!(normalize_positive(-1e-18) < TAU);
    }

    #[test]
    fn test_angle_difference_wraps() {
        let from = deg_to_rad(350.0);
        let to = deg_to_rad(10.0);
        assert_abs_diff_eq!(rad_to_deg(angle_difference(from, to)), 20.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rad_to_deg(angle_difference(to, from)), -20.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ddmm_conversion() {
        let lat = ddmm_to_decimal(4807.038, 'N').unwrap();
        assert_abs_diff_eq!(lat, 48.1173, epsilon = 1e-4);
        let lon = ddmm_to_decimal(1131.000, 'W').unwrap();
        assert_abs_diff_eq!(lon, -11.516_666, epsilon = 1e-5);
        assert!(ddmm_to_decimal(1131.0, 'X').is_none());
    }

    #[test]
    fn test_unit_conversions() {
        assert_abs_diff_eq!(mps_to_knots(1.0), 1.943_844_5, epsilon = 1e-9);
        assert_abs_diff_eq!(knots_to_mps(mps_to_knots(3.2)), 3.2, epsilon = 1e-12);
        assert_abs_diff_eq!(kelvin_to_celsius(293.15), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_safe_atan2_axis_fallback() {
        assert_eq!(safe_atan2(0.0, 0.0), 0.0);
        assert_eq!(safe_atan2(-0.0, 0.0), PI);
        assert_abs_diff_eq!(safe_atan2(1.0, 0.0), PI / 2.0, epsilon = 1e-12);
    }
}
