//! # 1-Wire Sensor Adapter
//!
//! Polls the four devices on the shared 1-Wire bus: saildrive sensor,
//! battery monitors A and B, and the shore-power monitor.
//!
//! ## Lifecycle
//! 1. [`OneWireAdapter::enumerate`] searches the bus once at startup and
//!    binds each [`DeviceRole`] to an address, either the configured one or
//!    the next family-0x26 device in discovery order. A role without a
//!    device stays unavailable for the life of the process.
//! 2. The scheduler calls [`OneWireAdapter::request`] at each role's cadence.
//! 3. [`OneWireAdapter::service`] runs every tick and performs at most one
//!    read, never sooner than the configured spacing after the previous one.
//!
//! A sweep is the run of queued reads between two idle moments. The bus
//! presence pulse is checked at the start of each sweep; without it every
//! device is marked unavailable and the sweep is abandoned.
//!
//! ## Page Format
//! Each read returns an 8-byte page followed by its CRC-8. A CRC mismatch is
//! retried once; a second mismatch marks that one reading unavailable.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::boat_data::{Bank, EntityKind};
use crate::repository::{BatteryReading, BoatData};
use crate::sources::SourceId;
use crate::Millis;

/// 64-bit ROM address: family code, 48-bit serial, CRC-8.
pub type Address = [u8; 8];

/// Family code of the battery monitor chips used for all four roles.
pub const FAMILY_BATTERY_MONITOR: u8 = 0x26;

/// Data bytes per page, excluding CRC.
pub const PAGE_LEN: usize = 8;

/// Upper bound on devices visited during one search.
const MAX_SEARCH: usize = 16;

/// Transport seam. Bit timing lives behind this trait.
pub trait OneWireBus {
    /// Reset pulse. True when at least one device answered with presence.
    fn reset(&mut self) -> bool;
    fn reset_search(&mut self);
    /// Next ROM address of the current search, `None` when exhausted.
    fn search_next(&mut self) -> Option<Address>;
    /// Address one device for the following read.
    fn select(&mut self, address: &Address);
    /// Read the selected device's page and CRC into `buffer`.
    fn read_bytes(&mut self, buffer: &mut [u8]);
}

/// Dallas/Maxim CRC-8 (polynomial 0x31, reflected).
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &byte| {
        let mut byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
        crc
    })
}

/// True when the trailing byte is the CRC of the first seven.
pub fn address_valid(address: &Address) -> bool {
    crc8(&address[..7]) == address[7]
}

/// Parse a 16-digit hex address as written in the config file, family
/// code first. The CRC byte must match.
pub fn parse_address(text: &str) -> Option<Address> {
    let text = text.trim();
    if text.len() != 16 {
        return None;
    }
    let mut address = [0u8; 8];
    for (i, byte) in address.iter_mut().enumerate() {
        *byte = u8::from_str_radix(text.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    address_valid(&address).then_some(address)
}

/// What a device on the bus measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceRole {
    Saildrive,
    BatteryA,
    BatteryB,
    ShorePower,
}

impl DeviceRole {
    /// Discovery-order assignment when no addresses are configured.
    pub const ALL: [DeviceRole; 4] = [
        DeviceRole::Saildrive,
        DeviceRole::BatteryA,
        DeviceRole::BatteryB,
        DeviceRole::ShorePower,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DeviceRole::Saildrive => "saildrive",
            DeviceRole::BatteryA => "battery_a",
            DeviceRole::BatteryB => "battery_b",
            DeviceRole::ShorePower => "shore_power",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn source(self) -> SourceId {
        SourceId::new(match self {
            DeviceRole::Saildrive => "1W-SAILDRIVE",
            DeviceRole::BatteryA => "1W-BATTERY-A",
            DeviceRole::BatteryB => "1W-BATTERY-B",
            DeviceRole::ShorePower => "1W-SHORE",
        })
    }

    /// Flip the data this role feeds to unavailable.
    fn mark_unavailable(self, boat: &mut BoatData) {
        match self {
            DeviceRole::Saildrive => boat.mark_unavailable(EntityKind::Saildrive),
            DeviceRole::BatteryA => boat.mark_bank_unavailable(Bank::A),
            DeviceRole::BatteryB => boat.mark_bank_unavailable(Bank::B),
            DeviceRole::ShorePower => boat.mark_unavailable(EntityKind::ShorePower),
        }
    }
}

/// Decoded battery monitor page.
pub fn decode_battery(page: &[u8; PAGE_LEN]) -> BatteryReading {
    BatteryReading {
        shore_charger_on: page[0] & 0x01 != 0,
        engine_charger_on: page[0] & 0x02 != 0,
        voltage: u16::from_le_bytes([page[1], page[2]]) as f64 * 0.01,
        amperage: i16::from_le_bytes([page[3], page[4]]) as f64 * 0.1,
        state_of_charge: page[5] as f64 * 0.5,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneWireStats {
    pub devices_found: u32,
    pub reads: u32,
    pub crc_retries: u32,
    pub read_failures: u32,
    pub bus_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadError {
    NoPresence,
    Crc,
}

/// Paced poller over a [`OneWireBus`].
pub struct OneWireAdapter<B: OneWireBus> {
    bus: B,
    configured: [Option<Address>; 4],
    devices: [Option<Address>; 4],
    pending: [bool; 4],
    /// Next role to consider, for round-robin service
    cursor: usize,
    sweep_open: bool,
    spacing_ms: Millis,
    last_read_at: Option<Millis>,
    stats: OneWireStats,
}

impl<B: OneWireBus> OneWireAdapter<B> {
    /// `configured` holds fixed addresses indexed like [`DeviceRole::ALL`].
    pub fn new(bus: B, configured: [Option<Address>; 4], spacing_ms: Millis) -> Self {
        OneWireAdapter {
            bus,
            configured,
            devices: [None; 4],
            pending: [false; 4],
            cursor: 0,
            sweep_open: false,
            spacing_ms,
            last_read_at: None,
            stats: OneWireStats::default(),
        }
    }

    /// Search the bus and bind roles to devices.
    pub fn enumerate(&mut self, boat: &mut BoatData) {
        self.devices = [None; 4];
        let now = boat.now();
        if !self.bus.reset() {
            self.stats.bus_failures += 1;
            boat.events_mut().warn(
                now,
                "onewire",
                "bus_failure",
                format_args!("no presence pulse during enumeration"),
            );
            return;
        }

        let mut found = [[0u8; 8]; MAX_SEARCH];
        let mut count = 0;
        self.bus.reset_search();
        while count < MAX_SEARCH {
            let Some(address) = self.bus.search_next() else {
                break;
            };
            if !address_valid(&address) {
                tracing::debug!(?address, "ignoring 1-Wire device with bad address CRC");
                continue;
            }
            found[count] = address;
            count += 1;
        }
        let found = &found[..count];
        self.stats.devices_found = count as u32;

        let mut discovered = found
            .iter()
            .filter(|address| address[0] == FAMILY_BATTERY_MONITOR)
            .filter(|address| !self.configured.contains(&Some(**address)));
        for role in DeviceRole::ALL {
            let bound = match self.configured[role.index()] {
                Some(address) => found.contains(&address).then_some(address),
                None => discovered.next().copied(),
            };
            self.devices[role.index()] = bound;
            match bound {
                Some(address) => {
                    tracing::info!(role = role.name(), ?address, "1-Wire device bound")
                }
                None => boat.events_mut().warn(
                    now,
                    "onewire",
                    "device_missing",
                    format_args!("role={}", role.name()),
                ),
            }
        }
    }

    pub fn device(&self, role: DeviceRole) -> Option<Address> {
        self.devices[role.index()]
    }

    /// Queue a read of `role`. Repeated requests before service coalesce.
    pub fn request(&mut self, role: DeviceRole) {
        if self.devices[role.index()].is_some() {
            self.pending[role.index()] = true;
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.iter().filter(|&&pending| pending).count()
    }

    /// Perform at most one queued read if the spacing allows.
    pub fn service(&mut self, boat: &mut BoatData) {
        if self.pending() == 0 {
            self.sweep_open = false;
            return;
        }
        let now = boat.now();
        if let Some(last) = self.last_read_at {
            if now.saturating_sub(last) < self.spacing_ms {
                return;
            }
        }

        if !self.sweep_open {
            if !self.bus.reset() {
                self.bus_failure(boat, now);
                return;
            }
            self.sweep_open = true;
        }

        let Some(role) = self.next_pending() else {
            return;
        };
        let Some(address) = self.devices[role.index()] else {
            return;
        };
        self.last_read_at = Some(now);
        match self.read_page(&address) {
            Ok(page) => {
                self.stats.reads += 1;
                let diagnostics = boat.diagnostics_mut();
                diagnostics.onewire_reads = diagnostics.onewire_reads.saturating_add(1);
                apply(role, &page, boat);
            }
            Err(error) => {
                self.stats.read_failures += 1;
                role.mark_unavailable(boat);
                boat.events_mut().warn(
                    now,
                    "onewire",
                    "read_failure",
                    format_args!("role={} reason={:?}", role.name(), error),
                );
            }
        }
        if self.pending() == 0 {
            self.sweep_open = false;
        }
    }

    pub fn stats(&self) -> OneWireStats {
        self.stats
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn next_pending(&mut self) -> Option<DeviceRole> {
        for step in 0..DeviceRole::ALL.len() {
            let index = (self.cursor + step) % DeviceRole::ALL.len();
            if self.pending[index] {
                self.pending[index] = false;
                self.cursor = (index + 1) % DeviceRole::ALL.len();
                return Some(DeviceRole::ALL[index]);
            }
        }
        None
    }

    fn bus_failure(&mut self, boat: &mut BoatData, now: Millis) {
        self.stats.bus_failures += 1;
        self.pending = [false; 4];
        self.sweep_open = false;
        for role in DeviceRole::ALL {
            role.mark_unavailable(boat);
        }
        boat.events_mut().warn(
            now,
            "onewire",
            "bus_failure",
            format_args!("no presence pulse, sweep abandoned"),
        );
    }

    fn read_page(&mut self, address: &Address) -> Result<[u8; PAGE_LEN], ReadError> {
        let mut buffer = [0u8; PAGE_LEN + 1];
        for attempt in 0..2 {
            if !self.bus.reset() {
                return Err(ReadError::NoPresence);
            }
            self.bus.select(address);
            self.bus.read_bytes(&mut buffer);
            if crc8(&buffer[..PAGE_LEN]) == buffer[PAGE_LEN] {
                let mut page = [0u8; PAGE_LEN];
                page.copy_from_slice(&buffer[..PAGE_LEN]);
                return Ok(page);
            }
            if attempt == 0 {
                self.stats.crc_retries += 1;
            }
        }
        Err(ReadError::Crc)
    }
}

fn apply(role: DeviceRole, page: &[u8; PAGE_LEN], boat: &mut BoatData) {
    let source = role.source();
    match role {
        DeviceRole::Saildrive => {
            boat.update_saildrive(page[0] & 0x01 != 0, source);
        }
        DeviceRole::BatteryA => {
            boat.update_battery(Bank::A, decode_battery(page), source);
        }
        DeviceRole::BatteryB => {
            boat.update_battery(Bank::B, decode_battery(page), source);
        }
        DeviceRole::ShorePower => {
            let power = u16::from_le_bytes([page[1], page[2]]) as f64;
            boat.update_shore_power(page[0] & 0x01 != 0, power, source);
        }
    }
}

// -- Linux w1 subsystem --

/// Bus backed by the kernel w1 subsystem under `/sys/bus/w1/devices`.
///
/// The kernel runs the bit timing and the ROM search; device pages are read
/// from each slave's `page0` file. The kernel driver already checks the page
/// CRC, so the CRC byte is regenerated here for the adapter's own check.
#[derive(Debug)]
pub struct SysfsOneWireBus {
    root: PathBuf,
    slaves: Vec<Address>,
    search_index: usize,
    selected: Option<Address>,
}

impl SysfsOneWireBus {
    pub const DEFAULT_ROOT: &'static str = "/sys/bus/w1/devices";

    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        SysfsOneWireBus {
            root: root.as_ref().to_path_buf(),
            slaves: Vec::new(),
            search_index: 0,
            selected: None,
        }
    }

    /// `26-0000012345ab` → family byte, serial LSB first, CRC.
    fn parse_slave(name: &str) -> Option<Address> {
        let (family, serial) = name.split_once('-')?;
        if serial.len() != 12 {
            return None;
        }
        let mut address = [0u8; 8];
        address[0] = u8::from_str_radix(family, 16).ok()?;
        for i in 0..6 {
            let at = 10 - i * 2;
            address[1 + i] = u8::from_str_radix(serial.get(at..at + 2)?, 16).ok()?;
        }
        address[7] = crc8(&address[..7]);
        Some(address)
    }

    fn slave_dir(&self, address: &Address) -> PathBuf {
        let mut name = format!("{:02x}-", address[0]);
        for byte in address[1..7].iter().rev() {
            name.push_str(&format!("{:02x}", byte));
        }
        self.root.join(name)
    }
}

impl OneWireBus for SysfsOneWireBus {
    fn reset(&mut self) -> bool {
        self.root.join("w1_bus_master1").exists()
    }

    fn reset_search(&mut self) {
        self.search_index = 0;
        self.slaves = fs::read_to_string(self.root.join("w1_bus_master1/w1_master_slaves"))
            .map(|list| list.lines().filter_map(Self::parse_slave).collect())
            .unwrap_or_default();
    }

    fn search_next(&mut self) -> Option<Address> {
        let address = self.slaves.get(self.search_index).copied();
        self.search_index += 1;
        address
    }

    fn select(&mut self, address: &Address) {
        self.selected = Some(*address);
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) {
        buffer.fill(0xFF);
        let Some(address) = self.selected else {
            return;
        };
        let Ok(page) = fs::read(self.slave_dir(&address).join("page0")) else {
            return;
        };
        let len = page.len().min(PAGE_LEN).min(buffer.len());
        buffer[..len].copy_from_slice(&page[..len]);
        if len == PAGE_LEN && buffer.len() > PAGE_LEN {
            buffer[PAGE_LEN] = crc8(&buffer[..PAGE_LEN]);
        }
    }
}
