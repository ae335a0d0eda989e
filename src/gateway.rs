//! # Gateway
//!
//! Composition root: owns the repository, the three protocol front ends, the
//! calibration store and the scheduler, and advances all of them with one
//! [`Gateway::tick`] per loop iteration.
//!
//! ## One tick
//! 1. Run every task the scheduler reports due, in table order
//! 2. Service the 1-Wire queue (at most one read)
//! 3. Run the coalesced derivation if any input changed
//!
//! Nothing in a tick blocks. The serial drain stops at its time budget and
//! resumes on the next tick.

use std::io;
use std::rc::Rc;

use crate::boat_data::CalibrationParameters;
use crate::calibration::{CalibrationError, CalibrationStore, LoadOutcome};
use crate::config::Config;
use crate::events::EventLog;
use crate::hal::{Clock, FileSystem, SerialPort};
use crate::nmea0183::{Nmea0183Handler, Nmea0183Stats};
use crate::nmea2000::{CanInbox, N2kMessage, Nmea2000Handler, Nmea2000Stats};
use crate::onewire::{DeviceRole, OneWireAdapter, OneWireBus, OneWireStats};
use crate::repository::{BoatData, Snapshot};
use crate::scheduler::{LoopStats, Scheduler, Task};
use crate::serializer::HandlerStatus;
use crate::Millis;

pub struct Gateway<B: OneWireBus, F: FileSystem> {
    clock: Rc<dyn Clock>,
    boat: BoatData,
    serial: Option<Box<dyn SerialPort>>,
    nmea0183: Nmea0183Handler,
    inbox: CanInbox,
    nmea2000: Nmea2000Handler,
    onewire: OneWireAdapter<B>,
    calibration: CalibrationStore<F>,
    scheduler: Scheduler,
    loop_stats: LoopStats,
    serial_budget_ms: Millis,
}

impl<B: OneWireBus, F: FileSystem> Gateway<B, F> {
    /// Build every component, load the calibration and enumerate the
    /// 1-Wire bus. Serial input is attached separately.
    pub fn new(config: &Config, clock: Rc<dyn Clock>, bus: B, fs: F) -> Self {
        let events = EventLog::new(config.logging.event_buffer, config.logging.event_level());
        let mut boat = BoatData::new(clock.clone(), events);

        let mut nmea0183 = Nmea0183Handler::new();
        if let Err(error) = nmea0183.register(&mut boat) {
            tracing::error!(%error, "could not register serial sources");
        }

        let mut calibration = CalibrationStore::new(fs);
        if calibration.load() == LoadOutcome::Rejected {
            let now = boat.now();
            boat.events_mut().warn(
                now,
                "calibration",
                "load_failed",
                format_args!("using defaults"),
            );
        }
        boat.set_calibration(calibration.get());

        let schedule = &config.schedule;
        let mut onewire =
            OneWireAdapter::new(bus, config.onewire.addresses(), schedule.onewire_spacing_ms);
        onewire.enumerate(&mut boat);

        let now = clock.now_ms();
        Gateway {
            clock,
            boat,
            serial: None,
            nmea0183,
            inbox: CanInbox::new(),
            nmea2000: Nmea2000Handler::new(),
            onewire,
            calibration,
            scheduler: Scheduler::new(schedule, now),
            loop_stats: LoopStats::new(now),
            serial_budget_ms: schedule.serial_budget_ms,
        }
    }

    /// Open the serial port and start draining it.
    pub fn attach_serial(&mut self, mut port: Box<dyn SerialPort>, baud: u32) -> io::Result<()> {
        port.begin(baud)?;
        self.serial = Some(port);
        tracing::info!(baud, "serial input attached");
        Ok(())
    }

    /// CAN driver receive hook.
    pub fn receive_can(&mut self, message: N2kMessage) {
        self.inbox.push(message);
    }

    /// One cooperative loop iteration.
    pub fn tick(&mut self) {
        let now = self.clock.now_ms();
        self.loop_stats.record_tick();
        for task in self.scheduler.due(now).iter() {
            self.run(task, now);
        }
        self.onewire.service(&mut self.boat);
        self.boat.run_pending_derivation();
    }

    fn run(&mut self, task: Task, now: Millis) {
        match task {
            Task::Nmea0183 => {
                if let Some(port) = self.serial.as_deref_mut() {
                    self.nmea0183.poll(port, &mut self.boat, self.serial_budget_ms);
                }
            }
            Task::Nmea2000 => self.nmea2000.pump(&mut self.inbox, &mut self.boat),
            Task::Saildrive => self.onewire.request(DeviceRole::Saildrive),
            Task::Battery => {
                self.onewire.request(DeviceRole::BatteryA);
                self.onewire.request(DeviceRole::BatteryB);
            }
            Task::ShorePower => self.onewire.request(DeviceRole::ShorePower),
            Task::Priorities => self.boat.update_priorities(),
            Task::StaleSweep => self.boat.check_stale(),
            Task::LoopStats => {
                let frequency = self.loop_stats.sample(now);
                self.boat.diagnostics_mut().loop_frequency = frequency;
                tracing::debug!(frequency, "loop frequency");
            }
        }
    }

    /// Time until the next task comes due, for sleeping between ticks.
    pub fn idle_for(&self) -> Millis {
        self.scheduler.idle_for(self.clock.now_ms())
    }

    pub fn boat(&self) -> &BoatData {
        &self.boat
    }

    pub fn boat_mut(&mut self) -> &mut BoatData {
        &mut self.boat
    }

    pub fn snapshot(&self) -> Snapshot {
        self.boat.snapshot()
    }

    pub fn events_mut(&mut self) -> &mut EventLog {
        self.boat.events_mut()
    }

    // -- Calibration --

    pub fn calibration(&self) -> CalibrationParameters {
        self.calibration.get()
    }

    /// Validate and apply new calibration values without persisting them.
    pub fn set_calibration(
        &mut self,
        leeway_k: f64,
        wind_angle_offset: f64,
    ) -> Result<(), CalibrationError> {
        self.calibration.set(leeway_k, wind_angle_offset)?;
        self.boat.set_calibration(self.calibration.get());
        Ok(())
    }

    /// Validate, persist and apply new calibration values.
    pub fn save_calibration(
        &mut self,
        leeway_k: f64,
        wind_angle_offset: f64,
    ) -> Result<(), CalibrationError> {
        if let Err(error) = self.calibration.save(leeway_k, wind_angle_offset) {
            let now = self.boat.now();
            self.boat.events_mut().warn(
                now,
                "calibration",
                "save_failed",
                format_args!("{}", error),
            );
            return Err(error);
        }
        self.boat.set_calibration(self.calibration.get());
        Ok(())
    }

    // -- Statistics --

    pub fn loop_frequency(&self) -> f64 {
        self.loop_stats.frequency()
    }

    pub fn nmea0183_stats(&self) -> Nmea0183Stats {
        self.nmea0183.stats()
    }

    pub fn nmea2000_stats(&self) -> Nmea2000Stats {
        self.nmea2000.stats()
    }

    pub fn onewire_stats(&self) -> OneWireStats {
        self.onewire.stats()
    }

    pub fn status(&self) -> HandlerStatus {
        let events = self.boat.events();
        HandlerStatus {
            nmea0183: self.nmea0183.stats(),
            nmea2000: self.nmea2000.stats(),
            onewire: self.onewire.stats(),
            loop_frequency: self.loop_stats.frequency(),
            warnings: events.warnings(),
            errors: events.errors(),
        }
    }

    pub fn onewire(&self) -> &OneWireAdapter<B> {
        &self.onewire
    }

    pub fn onewire_mut(&mut self) -> &mut OneWireAdapter<B> {
        &mut self.onewire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angles::deg_to_rad;
    use crate::hal::{BufferSerialPort, ManualClock, StdFileSystem};
    use crate::nmea0183::checksum;
    use crate::nmea2000::{PGN_ATTITUDE, PGN_WIND};
    use crate::onewire::mock::MockOneWireBus;
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Serial port whose buffer stays reachable from the test.
    #[derive(Clone)]
    struct SharedPort(Rc<RefCell<BufferSerialPort>>);

    impl SerialPort for SharedPort {
        fn begin(&mut self, _baud: u32) -> io::Result<()> {
            Ok(())
        }

        fn available(&mut self) -> usize {
            self.0.borrow_mut().available()
        }

        fn read(&mut self) -> Option<u8> {
            self.0.borrow_mut().read()
        }
    }

    fn sentence(body: &str) -> String {
        format!("${}*{:02X}\r\n", body, checksum(body.as_bytes()))
    }

    struct Rig {
        gateway: Gateway<MockOneWireBus, StdFileSystem>,
        clock: ManualClock,
        port: SharedPort,
        _dir: TempDir,
    }

    fn rig() -> Rig {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let mut bus = MockOneWireBus::new();
        bus.add(MockOneWireBus::address(0x26, 1), [1, 0, 0, 0, 0, 0, 0, 0]);
        let mut gateway = Gateway::new(
            &Config::default(),
            Rc::new(clock.clone()),
            bus,
            StdFileSystem::new(dir.path()),
        );
        let port = SharedPort(Rc::new(RefCell::new(BufferSerialPort::new(4096))));
        gateway.attach_serial(Box::new(port.clone()), 4800).unwrap();
        Rig {
            gateway,
            clock,
            port,
            _dir: dir,
        }
    }

    /// Advance in 10 ms steps, ticking after each.
    fn run_for(rig: &mut Rig, millis: Millis) {
        for _ in 0..millis / 10 {
            rig.clock.advance(10);
            rig.gateway.tick();
        }
    }

    fn attitude(heel_deg: f64) -> N2kMessage {
        let mut payload = [0xFFu8; 7];
        payload[0] = 0;
        payload[3..5].copy_from_slice(&0i16.to_le_bytes());
        let raw = (deg_to_rad(heel_deg) / 1e-4).round() as i16;
        payload[5..7].copy_from_slice(&raw.to_le_bytes());
        N2kMessage::new(PGN_ATTITUDE, 10, &payload)
    }

    fn apparent_wind(knots: f64, awa_deg: f64) -> N2kMessage {
        let mut payload = [0u8; 6];
        let mps = knots / crate::angles::KNOTS_PER_MPS;
        payload[1..3].copy_from_slice(&((mps / 0.01).round() as u16).to_le_bytes());
        let angle = deg_to_rad(awa_deg).rem_euclid(std::f64::consts::TAU);
        payload[3..5].copy_from_slice(&((angle / 1e-4).round() as u16).to_le_bytes());
        payload[5] = 2;
        N2kMessage::new(PGN_WIND, 11, &payload)
    }

    #[test]
    fn test_serial_and_can_feed_derivation() {
        let mut rig = rig();
        {
            let mut port = rig.port.0.borrow_mut();
            port.push(sentence("APHDM,90.0,M").as_bytes());
            port.push(
                sentence("VHRMC,120000,A,4807.038,N,01131.000,E,6.0,95.0,161026,0.0,E")
                    .as_bytes(),
            );
        }
        rig.gateway.receive_can(attitude(20.0));
        rig.gateway.receive_can(apparent_wind(18.0, 30.0));
        rig.gateway.boat_mut().update_dst(
            crate::repository::DstReading {
                boat_speed: Some(6.0),
                depth: Some(12.0),
                ..Default::default()
            },
            crate::sources::SourceId::new("N2K-12"),
        );
        run_for(&mut rig, 20);

        let boat = rig.gateway.boat();
        assert!(boat.get_compass().available);
        assert!(boat.get_gps().available);
        let derived = boat.get_derived();
        assert!(derived.available);
        assert_abs_diff_eq!(derived.tws, 13.265, epsilon = 0.01);
        assert_eq!(rig.gateway.nmea0183_stats().accepted, 2);
        assert_eq!(rig.gateway.nmea2000_stats().handled, 2);
    }

    #[test]
    fn test_partial_sentences_then_heading() {
        let mut rig = rig();
        rig.port.0.borrow_mut().push(
            sentence("VHGGA,120000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,").as_bytes(),
        );
        rig.gateway.receive_can(attitude(20.0));
        rig.gateway.receive_can(apparent_wind(18.0, 30.0));
        rig.gateway.boat_mut().update_dst(
            crate::repository::DstReading {
                boat_speed: Some(6.0),
                ..Default::default()
            },
            crate::sources::SourceId::new("N2K-12"),
        );
        run_for(&mut rig, 200);
        assert!(rig.gateway.boat().get_compass().available);
        assert!(rig.gateway.boat().get_gps().available);
        assert!(!rig.gateway.boat().get_derived().available);

        {
            let mut port = rig.port.0.borrow_mut();
            port.push(sentence("APHDM,90.0,M").as_bytes());
            port.push(
                sentence("VHRMC,120001,A,4807.038,N,01131.000,E,6.0,95.0,161026,0.0,E")
                    .as_bytes(),
            );
        }
        run_for(&mut rig, 200);
        let boat = rig.gateway.boat();
        assert_eq!(boat.diagnostics().rejected_readings, 0);
        assert!(boat.get_derived().available);
        assert_abs_diff_eq!(boat.get_derived().tws, 13.265, epsilon = 0.01);
    }

    #[test]
    fn test_derivation_runs_once_per_tick() {
        let mut rig = rig();
        rig.gateway.tick();
        let before = rig.gateway.boat().diagnostics().derivation_runs;
        rig.clock.advance(10);
        for heel in [5.0, 6.0, 7.0] {
            rig.gateway.receive_can(attitude(heel));
        }
        rig.gateway.tick();
        assert_eq!(rig.gateway.boat().diagnostics().derivation_runs, before + 1);
    }

    #[test]
    fn test_onewire_polled_on_cadence() {
        let mut rig = rig();
        run_for(&mut rig, 990);
        assert!(!rig.gateway.boat().get_saildrive().available);
        run_for(&mut rig, 10);
        assert!(rig.gateway.boat().get_saildrive().engaged);
        assert_eq!(rig.gateway.onewire_stats().reads, 1);
    }

    #[test]
    fn test_stale_sweep_and_loop_frequency() {
        let mut rig = rig();
        rig.port.0.borrow_mut().push(sentence("APHDM,90.0,M").as_bytes());
        run_for(&mut rig, 20);
        assert!(rig.gateway.boat().get_compass().available);

        run_for(&mut rig, 6_000);
        assert!(!rig.gateway.boat().get_compass().available);
        assert_abs_diff_eq!(rig.gateway.loop_frequency(), 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            rig.gateway.snapshot().diagnostics.loop_frequency,
            100.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_calibration_save_applies_and_persists() {
        let mut rig = rig();
        rig.gateway.save_calibration(0.75, 0.087).unwrap();
        assert_eq!(rig.gateway.boat().get_calibration().leeway_k, 0.75);
        assert!(rig._dir.path().join("calibration.json").exists());

        assert!(rig.gateway.save_calibration(0.0, 0.0).is_err());
        assert_eq!(rig.gateway.calibration().leeway_k, 0.75);
        assert_eq!(rig.gateway.boat().events().iter().last().unwrap().event, "save_failed");
    }

    #[test]
    fn test_set_calibration_triggers_recompute() {
        let mut rig = rig();
        rig.gateway.tick();
        rig.gateway.set_calibration(2.0, 0.0).unwrap();
        assert!(rig.gateway.boat().recompute_pending());
        assert!(rig.gateway.set_calibration(-1.0, 0.0).is_err());
        assert_eq!(rig.gateway.calibration().leeway_k, 2.0);
    }
}
