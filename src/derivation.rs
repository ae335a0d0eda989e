//! # Derivation Engine
//!
//! Turns the calibrated sensor inputs into the sailing quantities shown to
//! the crew. [`derive`] is a pure function of the four input entities and the
//! calibration; the repository calls it once per loop tick when any input
//! changed.
//!
//! ## Steps
//! 1. **Offset AWA**: measured AWA plus the wind vane offset, in (−π, π]
//! 2. **Heel-corrected AWA**: `atan(tan(AWA) / cos(heel))`, kept in the
//!    original half-plane
//! 3. **Leeway**: `K · heel / speed²`, zero when the wind is on the high side
//!    or the boat is (almost) stopped, clamped to ±45°
//! 4. **Speed through water**: `speed / cos(leeway)`
//! 5. **True wind**: vector subtraction in a bow-aligned frame
//! 6. **VMG**: `STW · cos(−TWA + leeway)`
//! 7. **Wind direction**: `heading + TWA` in [0, 2π)
//! 8. **Current**: residual of the ground vector minus the water vector
//!
//! Wherever `atan`/`atan2` would be undefined the result falls back to the
//! axis-aligned value matching the sign of the remaining component.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

use crate::angles::{normalize_positive, normalize_signed, safe_atan2};
use crate::boat_data::{
    CalibrationParameters, CompassData, DerivedData, DstData, GpsData, WindData,
};

/// Below this boat speed (knots) leeway is taken as zero.
pub const MIN_LEEWAY_SPEED: f64 = 0.1;

/// Leeway is clamped to ±45°.
pub const MAX_LEEWAY: f64 = FRAC_PI_4;

/// Tolerance for the AWA = ±90° singularity.
const SINGULARITY_EPSILON: f64 = 1e-9;

/// Repository state the engine reads.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Inputs {
    pub gps: GpsData,
    pub compass: CompassData,
    pub dst: DstData,
    pub wind: WindData,
}

impl Inputs {
    /// All four entities must hold a valid reading.
    pub fn complete(&self) -> bool {
        self.gps.available && self.compass.available && self.dst.available && self.wind.available
    }
}

/// Compute every derived quantity, or `None` if an input is unavailable.
///
/// The returned record is not stamped; the repository does that on write.
pub fn derive(inputs: &Inputs, calibration: &CalibrationParameters) -> Option<DerivedData> {
    if !inputs.complete() {
        return None;
    }
    let heel = inputs.compass.heel;
    let heading = inputs.compass.magnetic_heading;
    let boat_speed = inputs.dst.boat_speed;

    let awa_offset = offset_awa(inputs.wind.awa, calibration.wind_angle_offset);
    let awa_heel = heel_corrected_awa(awa_offset, heel);
    let leeway = leeway(awa_heel, heel, boat_speed, calibration.leeway_k);
    let stw = speed_through_water(boat_speed, leeway);
    let (tws, twa) = true_wind(inputs.wind.aws, awa_heel, stw, boat_speed, leeway);
    let (soc, doc) = current(
        heading,
        leeway,
        stw,
        inputs.gps.cog,
        inputs.gps.sog,
        inputs.gps.variation,
    );

    Some(DerivedData {
        awa_offset,
        awa_heel,
        leeway,
        stw,
        tws,
        twa,
        wind_direction: wind_direction(heading, twa),
        vmg: vmg(stw, twa, leeway),
        soc,
        doc,
        available: false,
        last_update: 0,
    })
}

/// Measured AWA corrected for the vane alignment offset.
pub fn offset_awa(awa: f64, offset: f64) -> f64 {
    normalize_signed(awa + offset)
}

/// Project the masthead AWA back onto the horizontal plane.
pub fn heel_corrected_awa(awa_offset: f64, heel: f64) -> f64 {
    if (awa_offset.abs() - FRAC_PI_2).abs() < SINGULARITY_EPSILON {
        return awa_offset;
    }
    let t = awa_offset.tan();
    let c = heel.cos();
    let mut corrected = if c == 0.0 {
        FRAC_PI_2.copysign(t)
    } else {
        (t / c).atan()
    };
    // atan folds into (−90°, 90°); put the angle back in its half-plane
    if awa_offset > FRAC_PI_2 {
        corrected += PI;
    } else if awa_offset < -FRAC_PI_2 {
        corrected -= PI;
    }
    normalize_signed(corrected)
}

/// Leeway angle from heel and boat speed.
pub fn leeway(awa_heel: f64, heel: f64, boat_speed: f64, k: f64) -> f64 {
    if boat_speed.abs() < MIN_LEEWAY_SPEED {
        return 0.0;
    }
    let same_side = (heel > 0.0 && awa_heel > 0.0) || (heel < 0.0 && awa_heel < 0.0);
    if same_side {
        return 0.0;
    }
    (k * heel / (boat_speed * boat_speed)).clamp(-MAX_LEEWAY, MAX_LEEWAY)
}

pub fn speed_through_water(boat_speed: f64, leeway: f64) -> f64 {
    boat_speed / leeway.cos()
}

/// True wind speed and angle.
///
/// The frame is compass-cartesian (0 east, π/2 north) rotated so the bow
/// points along +y; apparent wind from dead ahead sits at 3π/2.
pub fn true_wind(aws: f64, awa_heel: f64, stw: f64, boat_speed: f64, leeway: f64) -> (f64, f64) {
    let awa_cart = 3.0 * FRAC_PI_2 - awa_heel;
    let tws_x = aws * awa_cart.cos() + stw * leeway.sin();
    let tws_y = aws * awa_cart.sin() + boat_speed;
    let tws = tws_x.hypot(tws_y);
    let twa = normalize_signed(3.0 * FRAC_PI_2 - safe_atan2(tws_y, tws_x));
    (tws, twa)
}

pub fn vmg(stw: f64, twa: f64, leeway: f64) -> f64 {
    stw * (-twa + leeway).cos()
}

/// Magnetic direction the true wind blows from.
pub fn wind_direction(heading: f64, twa: f64) -> f64 {
    normalize_positive(heading + twa)
}

/// Speed and direction of the current (SOC, DOC).
pub fn current(
    heading: f64,
    leeway: f64,
    stw: f64,
    cog: f64,
    sog: f64,
    variation: f64,
) -> (f64, f64) {
    let alpha = FRAC_PI_2 - (heading + leeway);
    let gamma = FRAC_PI_2 - (cog + variation);
    let x = sog * gamma.cos() - stw * alpha.cos();
    let y = sog * gamma.sin() - stw * alpha.sin();
    let soc = x.hypot(y);
    let doc = normalize_positive(FRAC_PI_2 - safe_atan2(y, x));
    (soc, doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angles::{deg_to_rad, rad_to_deg};
    use approx::assert_abs_diff_eq;

    fn close_hauled() -> Inputs {
        let mut inputs = Inputs::default();
        inputs.wind.awa = deg_to_rad(30.0);
        inputs.wind.aws = 18.0;
        inputs.wind.available = true;
        inputs.compass.heel = deg_to_rad(20.0);
        inputs.compass.magnetic_heading = deg_to_rad(90.0);
        inputs.compass.available = true;
        inputs.dst.boat_speed = 6.0;
        inputs.dst.available = true;
        inputs.gps.cog = deg_to_rad(95.0);
        inputs.gps.sog = 6.0;
        inputs.gps.variation = 0.0;
        inputs.gps.available = true;
        inputs
    }

    #[test]
    fn test_close_hauled_moderate_heel() {
        let calibration = CalibrationParameters::new(10.0, 0.0);
        let derived = derive(&close_hauled(), &calibration).unwrap();

        assert_abs_diff_eq!(rad_to_deg(derived.awa_offset), 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rad_to_deg(derived.awa_heel), 31.567, epsilon = 0.01);
        assert_eq!(derived.leeway, 0.0);
        assert_abs_diff_eq!(derived.stw, 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(derived.tws, 13.265, epsilon = 0.01);
        assert_abs_diff_eq!(rad_to_deg(derived.twa), 45.263, epsilon = 0.01);
        assert_abs_diff_eq!(derived.vmg, 4.223, epsilon = 0.01);
        assert_abs_diff_eq!(rad_to_deg(derived.wind_direction), 135.263, epsilon = 0.01);
        assert_abs_diff_eq!(derived.soc, 0.523, epsilon = 0.01);
        assert_abs_diff_eq!(rad_to_deg(derived.doc), 182.5, epsilon = 0.1);
    }

    #[test]
    fn test_vane_offset_wraps() {
        let awa = offset_awa(deg_to_rad(179.0), deg_to_rad(5.0));
        assert_abs_diff_eq!(rad_to_deg(awa), -176.0, epsilon = 1e-9);
    }

    #[test]
    fn test_leeway_clamps_at_low_speed() {
        // Wind to starboard, heeled to port: the model applies
        let raw = leeway(deg_to_rad(20.0), deg_to_rad(-25.0), 0.5, 10.0);
        assert_abs_diff_eq!(rad_to_deg(raw), -45.0, epsilon = 1e-9);
        let raw = leeway(deg_to_rad(-20.0), deg_to_rad(25.0), 0.5, 10.0);
        assert_abs_diff_eq!(rad_to_deg(raw), 45.0, epsilon = 1e-9);
    }

    #[test]
    fn test_leeway_zero_when_heel_and_awa_share_sign() {
        assert_eq!(leeway(deg_to_rad(-20.0), deg_to_rad(-25.0), 0.5, 10.0), 0.0);
        assert_eq!(leeway(deg_to_rad(20.0), deg_to_rad(25.0), 6.0, 10.0), 0.0);
    }

    #[test]
    fn test_leeway_zero_when_stopped() {
        assert_eq!(leeway(deg_to_rad(20.0), deg_to_rad(-25.0), 0.0, 10.0), 0.0);
        assert_eq!(leeway(deg_to_rad(20.0), deg_to_rad(-25.0), 0.05, 10.0), 0.0);
    }

    #[test]
    fn test_leeway_unclamped_in_normal_sailing() {
        let value = leeway(deg_to_rad(30.0), deg_to_rad(-10.0), 6.0, 1.0);
        assert_abs_diff_eq!(value, deg_to_rad(-10.0) / 36.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            speed_through_water(6.0, value),
            6.0 / value.cos(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_heel_correction_singularity() {
        let awa = heel_corrected_awa(deg_to_rad(90.0), deg_to_rad(30.0));
        assert_abs_diff_eq!(rad_to_deg(awa), 90.0, epsilon = 1e-9);
        let awa = heel_corrected_awa(deg_to_rad(-90.0), deg_to_rad(30.0));
        assert_abs_diff_eq!(rad_to_deg(awa), -90.0, epsilon = 1e-9);
    }

    #[test]
    fn test_heel_correction_keeps_half_plane() {
        let awa = heel_corrected_awa(deg_to_rad(150.0), deg_to_rad(20.0));
        assert!(awa > FRAC_PI_2 && awa <= PI);
        let awa = heel_corrected_awa(deg_to_rad(-150.0), deg_to_rad(20.0));
        assert!(awa < -FRAC_PI_2 && awa > -PI);
        // No heel, no correction
        let awa = heel_corrected_awa(deg_to_rad(-150.0), 0.0);
        assert_abs_diff_eq!(rad_to_deg(awa), -150.0, epsilon = 1e-9);
    }

    #[test]
    fn test_true_wind_dead_ahead_at_rest() {
        let (tws, twa) = true_wind(10.0, 0.0, 0.0, 0.0, 0.0);
        assert_abs_diff_eq!(tws, 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(twa, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_true_wind_calm_uses_axis_fallback() {
        // Motoring at 5 kn into a 5 kn headwind made purely by motion
        let (tws, twa) = true_wind(5.0, 0.0, 5.0, 5.0, 0.0);
        assert_abs_diff_eq!(tws, 0.0, epsilon = 1e-9);
        assert!(twa.is_finite());
    }

    #[test]
    fn test_port_wind_stays_port() {
        let mut inputs = close_hauled();
        inputs.wind.awa = deg_to_rad(-30.0);
        inputs.compass.heel = deg_to_rad(-20.0);
        let derived = derive(&inputs, &CalibrationParameters::new(10.0, 0.0)).unwrap();
        assert!(derived.awa_heel < 0.0);
        assert_abs_diff_eq!(rad_to_deg(derived.twa), -45.263, epsilon = 0.01);
    }

    #[test]
    fn test_no_current_when_tracks_agree() {
        let (soc, doc) = current(deg_to_rad(45.0), 0.0, 6.0, deg_to_rad(45.0), 6.0, 0.0);
        assert_abs_diff_eq!(soc, 0.0, epsilon = 1e-9);
        assert!((0.0..std::f64::consts::TAU).contains(&doc));
    }

    #[test]
    fn test_derive_is_pure() {
        let calibration = CalibrationParameters::new(0.75, 0.087);
        let mut inputs = close_hauled();
        inputs.compass.heel = deg_to_rad(-12.0);
        let first = derive(&inputs, &calibration).unwrap();
        let second = derive(&inputs, &calibration).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_input_yields_none() {
        let mut inputs = close_hauled();
        inputs.dst.available = false;
        assert!(derive(&inputs, &CalibrationParameters::default()).is_none());
    }
}
