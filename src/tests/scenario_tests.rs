//! Worked scenarios with literal inputs, driven through the public surface.

use std::fs;
use std::rc::Rc;

use approx::assert_abs_diff_eq;
use tempfile::TempDir;

use crate::angles::{deg_to_rad, rad_to_deg};
use crate::boat_data::CalibrationParameters;
use crate::calibration::{CalibrationStore, LoadOutcome, CALIBRATION_PATH};
use crate::config::Config;
use crate::events::{EventLog, Level};
use crate::hal::{ManualClock, ReplaySerialPort, StdFileSystem};
use crate::nmea0183::checksum;
use crate::onewire::mock::MockOneWireBus;
use crate::repository::{AttitudeReading, BoatData, DstReading, GpsFix, HeadingReading};
use crate::sources::{SensorClass, SourceId, Transport};
use crate::Gateway;

fn boat_at(start: u64) -> (BoatData, ManualClock) {
    let clock = ManualClock::new(start);
    let boat = BoatData::new(Rc::new(clock.clone()), EventLog::new(64, Level::Info));
    (boat, clock)
}

/// Feed one complete set of derivation inputs.
fn close_hauled(boat: &mut BoatData, awa_deg: f64) {
    let gps = SourceId::new("GPS_A");
    let compass = SourceId::new("COMPASS_A");
    boat.register_source(gps, SensorClass::Gps, Transport::Can)
        .unwrap();
    boat.register_source(compass, SensorClass::Compass, Transport::Can)
        .unwrap();

    assert!(boat.update_gps(
        GpsFix {
            latitude: Some(43.5),
            longitude: Some(7.1),
            cog: Some(deg_to_rad(95.0)),
            sog: Some(6.0),
            variation: Some(0.0),
        },
        gps,
    ));
    assert!(boat.update_heading(
        HeadingReading {
            magnetic_heading: Some(deg_to_rad(90.0)),
            ..HeadingReading::default()
        },
        compass,
    ));
    assert!(boat.update_attitude(
        AttitudeReading {
            heel: Some(deg_to_rad(20.0)),
            ..AttitudeReading::default()
        },
        compass,
    ));
    assert!(boat.update_dst(
        DstReading {
            boat_speed: Some(6.0),
            ..DstReading::default()
        },
        SourceId::new("DST"),
    ));
    assert!(boat.update_wind(deg_to_rad(awa_deg), 18.0, SourceId::new("WIND")));
}

#[test]
fn test_close_hauled_scenario_through_repository() {
    let (mut boat, _) = boat_at(1_000);
    boat.set_calibration(CalibrationParameters::new(10.0, 0.0));
    close_hauled(&mut boat, 30.0);
    assert!(boat.run_pending_derivation());

    let derived = boat.get_derived();
    assert!(derived.available);
    assert_eq!(derived.last_update, 1_000);
    assert_abs_diff_eq!(rad_to_deg(derived.awa_offset), 30.0, epsilon = 1e-9);
    assert_abs_diff_eq!(rad_to_deg(derived.awa_heel), 31.567, epsilon = 0.01);
    assert_eq!(derived.leeway, 0.0);
    assert_abs_diff_eq!(derived.stw, 6.0, epsilon = 1e-12);
    assert_abs_diff_eq!(derived.tws, 13.265, epsilon = 0.01);
    assert_abs_diff_eq!(rad_to_deg(derived.twa), 45.263, epsilon = 0.01);
    assert_abs_diff_eq!(derived.vmg, 4.223, epsilon = 0.01);
    assert_abs_diff_eq!(rad_to_deg(derived.wind_direction), 135.263, epsilon = 0.01);
    assert_abs_diff_eq!(derived.soc, 0.523, epsilon = 0.01);
    assert_abs_diff_eq!(rad_to_deg(derived.doc), 182.5, epsilon = 0.01);
}

#[test]
fn test_vane_offset_wrap_through_repository() {
    let (mut boat, _) = boat_at(0);
    boat.set_calibration(CalibrationParameters::new(1.0, deg_to_rad(5.0)));
    close_hauled(&mut boat, 179.0);
    boat.run_pending_derivation();
    assert_abs_diff_eq!(rad_to_deg(boat.get_derived().awa_offset), -176.0, epsilon = 1e-9);
}

#[test]
fn test_leeway_clamp_at_low_speed() {
    // Heel and AWA on opposite sides: raw 10 * -25° / 0.25 is far past the limit
    let leeway = crate::derivation::leeway(deg_to_rad(20.0), deg_to_rad(-25.0), 0.5, 10.0);
    assert_abs_diff_eq!(rad_to_deg(leeway), -45.0, epsilon = 1e-9);

    // The literal pair shares a sign, so no leeway is applied
    let same_side = crate::derivation::leeway(deg_to_rad(-20.0), deg_to_rad(-25.0), 0.5, 10.0);
    assert_eq!(same_side, 0.0);
}

#[test]
fn test_heel_singularity_at_beam_reach() {
    let corrected = crate::derivation::heel_corrected_awa(deg_to_rad(90.0), deg_to_rad(30.0));
    assert_abs_diff_eq!(rad_to_deg(corrected), 90.0, epsilon = 1e-9);
}

#[test]
fn test_gps_source_failover_and_override() {
    let (mut boat, clock) = boat_at(0);
    let a = SourceId::new("GPS_A");
    let b = SourceId::new("GPS_B");
    let handle_a = boat.register_source(a, SensorClass::Gps, Transport::Can).unwrap();
    let handle_b = boat.register_source(b, SensorClass::Gps, Transport::Serial).unwrap();
    let fix = GpsFix {
        latitude: Some(43.5),
        longitude: Some(7.1),
        ..GpsFix::default()
    };

    // A at 10 Hz, B at 5 Hz
    for step in 0..10u64 {
        clock.set(step * 100);
        boat.update_gps(fix, a);
        if step % 2 == 0 {
            boat.update_gps(fix, b);
        }
    }
    boat.update_priorities();
    let manager = boat.prioritizer().manager();
    assert_eq!(manager.active(SensorClass::Gps).map(|s| s.id), Some(a));

    // A goes silent for six seconds while B keeps reporting
    for step in 0..30u64 {
        clock.set(1_000 + step * 200);
        boat.update_gps(fix, b);
    }
    clock.set(7_000);
    boat.check_stale();
    let source_a = *boat.prioritizer().source(handle_a).unwrap();
    assert!(!source_a.available);
    assert!(!source_a.active);
    assert!(!boat.get_gps().available);

    boat.update_priorities();
    assert!(boat.prioritizer().is_active(handle_b));
    assert!(boat.update_gps(fix, b));
    assert!(boat.get_gps().available);

    // A resumes; the operator pins it even though B is just as fast
    for step in 0..5u64 {
        clock.set(7_100 + step * 200);
        boat.update_gps(fix, a);
        boat.update_gps(fix, b);
    }
    let now = boat.now();
    boat.prioritizer_mut().set_manual_override(handle_a, now);
    boat.update_priorities();
    assert!(boat.prioritizer().is_active(handle_a));
    assert!(!boat.prioritizer().is_active(handle_b));
    assert_eq!(boat.prioritizer().active_count(SensorClass::Gps), 1);
}

#[test]
fn test_calibration_survives_power_cycle() {
    let dir = TempDir::new().unwrap();
    let mut store = CalibrationStore::new(StdFileSystem::new(dir.path()));
    assert_eq!(store.load(), LoadOutcome::Missing);
    assert_eq!(store.get().leeway_k, CalibrationParameters::default().leeway_k);

    store.save(0.75, 0.087).unwrap();
    drop(store);

    let mut rebooted = CalibrationStore::new(StdFileSystem::new(dir.path()));
    assert_eq!(rebooted.load(), LoadOutcome::Loaded);
    assert_eq!(rebooted.get().leeway_k, 0.75);
    assert_eq!(rebooted.get().wind_angle_offset, 0.087);

    let file = dir.path().join(CALIBRATION_PATH.trim_start_matches('/'));
    let before = fs::read(&file).unwrap();
    assert!(rebooted.save(0.0, 0.0).is_err());
    assert_eq!(fs::read(&file).unwrap(), before);
    assert_eq!(rebooted.get().leeway_k, 0.75);
    assert_eq!(rebooted.get().wind_angle_offset, 0.087);
}

#[test]
fn test_gateway_replays_capture() {
    let dir = TempDir::new().unwrap();
    let mut capture = String::new();
    for body in [
        "APHDM,90.0,M",
        "VHRMC,120000,A,4330.000,N,00706.000,E,5.5,92.0,161026,1.5,E",
        "APRSA,4.0,A,,",
    ] {
        capture.push_str(&format!("${}*{:02X}\r\n", body, checksum(body.as_bytes())));
    }
    let path = dir.path().join("harbour.nmea");
    fs::write(&path, &capture).unwrap();

    let clock = ManualClock::new(0);
    let mut gateway = Gateway::new(
        &Config::default(),
        Rc::new(clock.clone()),
        MockOneWireBus::new(),
        StdFileSystem::new(dir.path()),
    );
    let port = ReplaySerialPort::from_file(&path, Rc::new(clock.clone())).unwrap();
    gateway.attach_serial(Box::new(port), 4800).unwrap();

    for _ in 0..100 {
        clock.advance(10);
        gateway.tick();
    }

    // One second at 480 bytes/s covers the capture several times over
    let stats = gateway.nmea0183_stats();
    assert!(stats.accepted >= 6, "accepted {}", stats.accepted);
    assert_eq!(stats.checksum_errors, 0);
    let boat = gateway.boat();
    assert_abs_diff_eq!(rad_to_deg(boat.get_compass().magnetic_heading), 90.0, epsilon = 1e-9);
    assert_abs_diff_eq!(boat.get_gps().latitude, 43.5, epsilon = 1e-9);
    assert_abs_diff_eq!(rad_to_deg(boat.get_gps().variation), 1.5, epsilon = 1e-9);
    assert_abs_diff_eq!(rad_to_deg(boat.get_rudder().steering_angle), 4.0, epsilon = 1e-9);
}
