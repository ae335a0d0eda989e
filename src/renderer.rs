//! # Text Status Page
//!
//! Renders a repository [`Snapshot`] as a compact terminal page for the
//! `--stdout` development mode, standing in for the OLED display.
//!
//! Angles are shown in degrees. Any entity whose `available` flag is false
//! shows `--` in place of its values.

use std::fmt::Write;

use crate::angles::rad_to_deg;
use crate::repository::Snapshot;

/// Placeholder for unavailable values.
const NOT_AVAILABLE: &str = "--";

/// Width of the rudder gauge, excluding brackets.
const GAUGE_WIDTH: usize = 21;

/// Full-scale rudder deflection shown by the gauge, degrees.
const GAUGE_RANGE_DEG: f64 = 35.0;

/// Bearing in whole degrees, `000°`..`359°`.
fn format_bearing(radians: f64) -> String {
    let degrees = rad_to_deg(radians).round().rem_euclid(360.0);
    format!("{:03.0}°", degrees)
}

/// Signed angle in whole degrees with an explicit sign; zero has none.
fn format_signed(radians: f64) -> String {
    let degrees = rad_to_deg(radians).round();
    if degrees == 0.0 {
        "0°".to_string()
    } else {
        format!("{:+.0}°", degrees)
    }
}

/// Decimal degrees as `DD°MM.MMM'H`.
fn format_coordinate(decimal: f64, positive: char, negative: char) -> String {
    let hemisphere = if decimal < 0.0 { negative } else { positive };
    let decimal = decimal.abs();
    let degrees = decimal.trunc();
    let minutes = (decimal - degrees) * 60.0;
    format!("{:.0}°{:06.3}'{}", degrees, minutes, hemisphere)
}

/// Horizontal gauge with the centre marked `|` and the value marked `#`.
fn gauge(radians: f64) -> String {
    let half = (GAUGE_WIDTH / 2) as f64;
    let offset = (rad_to_deg(radians) / GAUGE_RANGE_DEG * half)
        .round()
        .clamp(-half, half);
    let position = (half + offset) as usize;
    let cells: String = (0..GAUGE_WIDTH)
        .map(|i| {
            if i == position {
                '#'
            } else if i == GAUGE_WIDTH / 2 {
                '|'
            } else {
                '-'
            }
        })
        .collect();
    format!("[{}]", cells)
}

/// Build the status page. Every line ends with a newline.
pub fn render_status(snapshot: &Snapshot) -> String {
    let mut page = String::new();
    // Writing to a String cannot fail
    let _ = write_status(&mut page, snapshot);
    page
}

fn write_status(out: &mut String, s: &Snapshot) -> std::fmt::Result {
    writeln!(out, "=== SAIL GATEWAY  t={:.1}s ===", s.at as f64 / 1000.0)?;

    let gps = &s.gps;
    if gps.available {
        writeln!(
            out,
            "GPS   {} {}  COG {}  SOG {:.1} kn  VAR {}",
            format_coordinate(gps.latitude, 'N', 'S'),
            format_coordinate(gps.longitude, 'E', 'W'),
            format_bearing(gps.cog),
            gps.sog,
            format_signed(gps.variation),
        )?;
    } else {
        writeln!(out, "GPS   {}", NOT_AVAILABLE)?;
    }

    let compass = &s.compass;
    if compass.available {
        writeln!(
            out,
            "HDG   {} M  {} T  HEEL {}  PITCH {}",
            format_bearing(compass.magnetic_heading),
            format_bearing(compass.true_heading),
            format_signed(compass.heel),
            format_signed(compass.pitch),
        )?;
    } else {
        writeln!(out, "HDG   {}", NOT_AVAILABLE)?;
    }

    let wind = &s.wind;
    if wind.available {
        writeln!(out, "AWA   {}  AWS {:.1} kn", format_signed(wind.awa), wind.aws)?;
    } else {
        writeln!(out, "AWA   {}", NOT_AVAILABLE)?;
    }

    let dst = &s.dst;
    if dst.available {
        writeln!(
            out,
            "DEPTH {:.1} m  SPD {:.1} kn  SEA {:.1}°C",
            dst.depth, dst.boat_speed, dst.sea_temperature
        )?;
    } else {
        writeln!(out, "DEPTH {}", NOT_AVAILABLE)?;
    }

    let derived = &s.derived;
    if derived.available {
        writeln!(
            out,
            "TRUE  TWA {}  TWS {:.1} kn  TWD {}  VMG {:.1} kn",
            format_signed(derived.twa),
            derived.tws,
            format_bearing(derived.wind_direction),
            derived.vmg,
        )?;
        writeln!(
            out,
            "      STW {:.1} kn  LEEWAY {}  SET {}  DRIFT {:.1} kn",
            derived.stw,
            format_signed(derived.leeway),
            format_bearing(derived.doc),
            derived.soc,
        )?;
    } else {
        writeln!(out, "TRUE  {}", NOT_AVAILABLE)?;
    }

    let rudder = &s.rudder;
    if rudder.available {
        writeln!(
            out,
            "RUDDER {} {}",
            gauge(rudder.steering_angle),
            format_signed(rudder.steering_angle)
        )?;
    } else {
        writeln!(out, "RUDDER {}", NOT_AVAILABLE)?;
    }

    let battery = &s.battery;
    for (label, bank) in [("BATT A", &battery.bank_a), ("BATT B", &battery.bank_b)] {
        if battery.available && bank.available {
            let charging = match (bank.shore_charger_on, bank.engine_charger_on) {
                (true, true) => " [SHORE+ENG]",
                (true, false) => " [SHORE]",
                (false, true) => " [ENG]",
                (false, false) => "",
            };
            writeln!(
                out,
                "{} {:.2} V  {:+.1} A  {:.0}%{}",
                label, bank.voltage, bank.amperage, bank.state_of_charge, charging
            )?;
        } else {
            writeln!(out, "{} {}", label, NOT_AVAILABLE)?;
        }
    }

    let engine = &s.engine;
    if engine.available {
        writeln!(
            out,
            "ENGINE {:.0} rpm  OIL {:.0}°C  ALT {:.1} V",
            engine.rpm, engine.oil_temperature, engine.alternator_voltage
        )?;
    } else {
        writeln!(out, "ENGINE {}", NOT_AVAILABLE)?;
    }

    let saildrive = if !s.saildrive.available {
        NOT_AVAILABLE
    } else if s.saildrive.engaged {
        "engaged"
    } else {
        "neutral"
    };
    let shore = if !s.shore_power.available {
        NOT_AVAILABLE.to_string()
    } else if s.shore_power.connected {
        format!("{:.0} W", s.shore_power.power)
    } else {
        "disconnected".to_string()
    };
    writeln!(out, "DRIVE  {}  SHORE {}", saildrive, shore)?;

    let d = &s.diagnostics;
    writeln!(
        out,
        "LOOP  {:.0} Hz  0183 {}  N2K {}  1W {}  REJ {}",
        d.loop_frequency, d.nmea0183_messages, d.nmea2000_messages, d.onewire_reads,
        d.rejected_readings
    )?;
    Ok(())
}

/// Print the status page to stdout.
pub fn draw_ascii(snapshot: &Snapshot) {
    print!("{}", render_status(snapshot));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angles::deg_to_rad;
    use crate::events::{EventLog, Level};
    use crate::hal::ManualClock;
    use crate::repository::BoatData;
    use crate::sources::SourceId;
    use std::rc::Rc;

    fn empty_snapshot() -> Snapshot {
        let clock = ManualClock::new(2_500);
        BoatData::new(Rc::new(clock), EventLog::new(4, Level::Info)).snapshot()
    }

    #[test]
    fn test_format_bearing() {
        assert_eq!(format_bearing(0.0), "000°");
        assert_eq!(format_bearing(deg_to_rad(95.4)), "095°");
        assert_eq!(format_bearing(deg_to_rad(359.7)), "000°");
        assert_eq!(format_bearing(deg_to_rad(-10.0)), "350°");
    }

    #[test]
    fn test_format_signed() {
        assert_eq!(format_signed(deg_to_rad(31.6)), "+32°");
        assert_eq!(format_signed(deg_to_rad(-12.2)), "-12°");
        assert_eq!(format_signed(0.0), "0°");
    }

    #[test]
    fn test_format_coordinate() {
        assert_eq!(format_coordinate(48.1173, 'N', 'S'), "48°07.038'N");
        assert_eq!(format_coordinate(-11.5, 'E', 'W'), "11°30.000'W");
    }

    #[test]
    fn test_gauge_marks_centre_and_value() {
        assert_eq!(gauge(0.0), "[----------#----------]");
        assert_eq!(gauge(deg_to_rad(35.0)), "[----------|---------#]");
        assert_eq!(gauge(deg_to_rad(-90.0)), "[#---------|----------]");
    }

    #[test]
    fn test_unavailable_entities_show_placeholder() {
        let page = render_status(&empty_snapshot());
        assert!(page.starts_with("=== SAIL GATEWAY  t=2.5s ==="));
        assert!(page.contains("GPS   --"));
        assert!(page.contains("HDG   --"));
        assert!(page.contains("TRUE  --"));
        assert!(page.contains("BATT A --"));
        assert!(page.contains("DRIVE  --  SHORE --"));
    }

    #[test]
    fn test_available_entities_render_values() {
        let clock = ManualClock::new(1_000);
        let mut boat = BoatData::new(Rc::new(clock), EventLog::new(4, Level::Info));
        let source = SourceId::new("TEST");
        boat.update_wind(deg_to_rad(-30.0), 12.34, source);
        boat.update_rudder(deg_to_rad(7.0), source);
        boat.update_shore_power(true, 1250.0, source);
        let page = render_status(&boat.snapshot());
        assert!(page.contains("AWA   -30°  AWS 12.3 kn"));
        assert!(page.contains("RUDDER [----------|-#--------] +7°"));
        assert!(page.contains("SHORE 1250 W"));
    }
}
