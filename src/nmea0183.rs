//! # NMEA 0183 Handler
//!
//! Consumes the 4800 baud serial stream from the autopilot and the VHF/GPS,
//! frames it into sentences, verifies checksums and feeds the decoded
//! readings into the repository.
//!
//! ## Accepted Sentences
//!
//! | Sentence | Talker | Repository ingress            | Rejected when          |
//! |----------|--------|-------------------------------|------------------------|
//! | RSA      | AP     | rudder angle                  | status ≠ `A`           |
//! | HDM      | AP     | magnetic heading              | heading missing        |
//! | GGA      | VH     | position                      | fix quality 0          |
//! | RMC      | VH     | position, COG, SOG, variation | status ≠ `A`, \|var\| > 30° |
//! | VTG      | VH     | COG, SOG, variation           | courses missing        |
//!
//! Everything else (other talkers, other sentence types, bad checksums,
//! overlong or garbled lines) is dropped silently with a DEBUG trace.
//!
//! ## Processing Budget
//! [`Nmea0183Handler::poll`] drains the port until it is empty or the budget
//! (50 ms by default) is spent. Remaining bytes wait in the port for the next
//! tick. Bytes lost to receive buffer overflow surface as a garbled line that
//! fails its checksum and is discarded.

use thiserror::Error;

use crate::angles::{ddmm_to_decimal, deg_to_rad, normalize_positive, normalize_signed};
use crate::hal::SerialPort;
use crate::repository::{BoatData, GpsFix, HeadingReading};
use crate::sources::{SensorClass, SourceError, SourceId, Transport};
use crate::Millis;

/// Longest line kept, including `$` and checksum. Standard sentences are at
/// most 82 characters with CR-LF; some devices run slightly over.
pub const MAX_LINE: usize = 96;

/// Most comma-separated fields in one sentence.
const MAX_FIELDS: usize = 24;

/// Serial line speed.
pub const BAUD_RATE: u32 = 4800;

/// Source id of the VHF/GPS talker (GPS class).
pub const GPS_SOURCE: &str = "NMEA0183-VH";

/// Source id of the autopilot talker (compass class).
pub const AUTOPILOT_SOURCE: &str = "NMEA0183-AP";

/// Reasons a line is not turned into a reading.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceError {
    #[error("line does not start with '$'")]
    NoStart,
    #[error("line has no checksum")]
    NoChecksum,
    #[error("checksum mismatch: sent {sent:02X}, computed {computed:02X}")]
    Checksum { sent: u8, computed: u8 },
    #[error("malformed sentence")]
    Malformed,
    #[error("more than {MAX_FIELDS} fields")]
    TooManyFields,
    #[error("field {0} missing or invalid")]
    Field(usize),
    #[error("rejected: {0}")]
    Rejected(&'static str),
}

// -- Framing --

/// Result of feeding one byte to the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Line still incomplete (or between lines)
    Pending,
    /// A complete line is available from [`LineFramer::line`]
    Complete,
    /// A partial line was thrown away (overlong, non-ASCII or restarted)
    Discarded,
}

/// Splits a byte stream into `$...` lines using a fixed buffer.
#[derive(Debug)]
pub struct LineFramer {
    buffer: [u8; MAX_LINE],
    len: usize,
    collecting: bool,
    complete: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        LineFramer {
            buffer: [0; MAX_LINE],
            len: 0,
            collecting: false,
            complete: false,
        }
    }

    pub fn push(&mut self, byte: u8) -> Frame {
        if self.complete {
            self.complete = false;
            self.len = 0;
        }
        match byte {
            b'$' => {
                let restarted = self.collecting && self.len > 0;
                self.collecting = true;
                self.buffer[0] = b'$';
                self.len = 1;
                if restarted {
                    Frame::Discarded
                } else {
                    Frame::Pending
                }
            }
            _ if !self.collecting => Frame::Pending,
            b'\r' => Frame::Pending,
            b'\n' => {
                self.collecting = false;
                self.complete = true;
                Frame::Complete
            }
            byte if !byte.is_ascii() || byte.is_ascii_control() || self.len == MAX_LINE => {
                self.collecting = false;
                self.len = 0;
                Frame::Discarded
            }
            byte => {
                self.buffer[self.len] = byte;
                self.len += 1;
                Frame::Pending
            }
        }
    }

    /// The completed line, without CR-LF. Empty unless the last push
    /// returned [`Frame::Complete`].
    pub fn line(&self) -> &[u8] {
        if self.complete {
            &self.buffer[..self.len]
        } else {
            &[]
        }
    }
}

// -- Parsing --

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, byte| acc ^ byte)
}

/// A checksum-verified sentence split into fields. Borrows the line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sentence<'a> {
    pub talker: &'a str,
    pub kind: &'a str,
    fields: [&'a str; MAX_FIELDS],
    count: usize,
}

impl<'a> Sentence<'a> {
    /// Data field `index` (0 is the first field after the address).
    pub fn field(&self, index: usize) -> &'a str {
        if index < self.count {
            self.fields[index]
        } else {
            ""
        }
    }

    pub fn field_count(&self) -> usize {
        self.count
    }

    fn number(&self, index: usize) -> Option<f64> {
        let text = self.field(index);
        if text.is_empty() {
            return None;
        }
        text.parse::<f64>().ok().filter(|value| value.is_finite())
    }

    fn required(&self, index: usize) -> Result<f64, SentenceError> {
        self.number(index).ok_or(SentenceError::Field(index))
    }

    fn letter(&self, index: usize) -> Option<char> {
        self.field(index).chars().next()
    }
}

/// Verify framing and checksum and split `line` into fields.
pub fn parse_sentence(line: &[u8]) -> Result<Sentence<'_>, SentenceError> {
    let text = std::str::from_utf8(line).map_err(|_| SentenceError::Malformed)?;
    let body = text.strip_prefix('$').ok_or(SentenceError::NoStart)?;
    let (body, sent) = body.rsplit_once('*').ok_or(SentenceError::NoChecksum)?;
    let sent = u8::from_str_radix(sent.trim(), 16).map_err(|_| SentenceError::NoChecksum)?;
    let computed = checksum(body.as_bytes());
    if sent != computed {
        return Err(SentenceError::Checksum { sent, computed });
    }

    let mut parts = body.split(',');
    let address = parts.next().ok_or(SentenceError::Malformed)?;
    if address.len() != 5 || !address.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
        return Err(SentenceError::Malformed);
    }
    let mut fields = [""; MAX_FIELDS];
    let mut count = 0;
    for part in parts {
        if count == MAX_FIELDS {
            return Err(SentenceError::TooManyFields);
        }
        fields[count] = part;
        count += 1;
    }
    Ok(Sentence {
        talker: &address[..2],
        kind: &address[2..],
        fields,
        count,
    })
}

// -- Decoding --

/// A decoded reading ready for repository ingress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Rudder angle, radians
    Rudder(f64),
    /// Magnetic heading, radians
    MagneticHeading(f64),
    Gps(GpsFix),
}

/// Decode an accepted sentence type. `Ok(None)` means the sentence is
/// filtered (wrong talker or unsupported type).
pub fn decode(sentence: &Sentence<'_>) -> Result<Option<Reading>, SentenceError> {
    let reading = match (sentence.talker, sentence.kind) {
        ("AP", "RSA") => decode_rsa(sentence)?,
        ("AP", "HDM") => decode_hdm(sentence)?,
        ("VH", "GGA") => decode_gga(sentence)?,
        ("VH", "RMC") => decode_rmc(sentence)?,
        ("VH", "VTG") => decode_vtg(sentence)?,
        _ => return Ok(None),
    };
    Ok(Some(reading))
}

/// `$APRSA,<stbd angle>,<status>,<port angle>,<status>`
fn decode_rsa(sentence: &Sentence<'_>) -> Result<Reading, SentenceError> {
    if sentence.letter(1) != Some('A') {
        return Err(SentenceError::Rejected("rudder status not valid"));
    }
    let degrees = sentence.required(0)?;
    Ok(Reading::Rudder(deg_to_rad(degrees)))
}

/// `$APHDM,<heading>,M`
fn decode_hdm(sentence: &Sentence<'_>) -> Result<Reading, SentenceError> {
    let degrees = sentence.required(0)?;
    Ok(Reading::MagneticHeading(normalize_positive(deg_to_rad(degrees))))
}

fn position(
    sentence: &Sentence<'_>,
    lat: usize,
    lon: usize,
) -> Result<(f64, f64), SentenceError> {
    let latitude = sentence
        .letter(lat + 1)
        .and_then(|hemisphere| ddmm_to_decimal(sentence.number(lat)?, hemisphere))
        .ok_or(SentenceError::Field(lat))?;
    let longitude = sentence
        .letter(lon + 1)
        .and_then(|hemisphere| ddmm_to_decimal(sentence.number(lon)?, hemisphere))
        .ok_or(SentenceError::Field(lon))?;
    Ok((latitude, longitude))
}

/// `$VHGGA,<time>,<lat>,<N/S>,<lon>,<E/W>,<quality>,<sats>,<hdop>,...`
fn decode_gga(sentence: &Sentence<'_>) -> Result<Reading, SentenceError> {
    let quality = sentence.required(5)?;
    if quality == 0.0 {
        return Err(SentenceError::Rejected("no fix"));
    }
    let (latitude, longitude) = position(sentence, 1, 3)?;
    Ok(Reading::Gps(GpsFix {
        latitude: Some(latitude),
        longitude: Some(longitude),
        ..GpsFix::default()
    }))
}

/// `$VHRMC,<time>,<status>,<lat>,<N/S>,<lon>,<E/W>,<sog>,<cog>,<date>,<var>,<E/W>`
fn decode_rmc(sentence: &Sentence<'_>) -> Result<Reading, SentenceError> {
    if sentence.letter(1) != Some('A') {
        return Err(SentenceError::Rejected("receiver warning"));
    }
    let (latitude, longitude) = position(sentence, 2, 4)?;
    let sog = sentence.number(6);
    let cog = sentence.number(7).map(|degrees| normalize_positive(deg_to_rad(degrees)));

    let variation = match (sentence.number(9), sentence.letter(10)) {
        (Some(degrees), Some('E')) => Some(degrees),
        (Some(degrees), Some('W')) => Some(-degrees),
        (Some(_), _) => return Err(SentenceError::Field(10)),
        (None, _) => None,
    };
    if variation.map_or(false, |degrees| degrees.abs() > 30.0) {
        return Err(SentenceError::Rejected("variation beyond 30 degrees"));
    }

    Ok(Reading::Gps(GpsFix {
        latitude: Some(latitude),
        longitude: Some(longitude),
        cog,
        sog,
        variation: variation.map(deg_to_rad),
    }))
}

/// `$VHVTG,<cog true>,T,<cog magnetic>,M,<sog kn>,N,<sog km/h>,K`
fn decode_vtg(sentence: &Sentence<'_>) -> Result<Reading, SentenceError> {
    let cog_true = sentence.required(0)?;
    let cog_magnetic = sentence.required(2)?;
    // Variation is east positive: true = magnetic + variation
    let variation = normalize_signed(deg_to_rad(cog_true - cog_magnetic));
    Ok(Reading::Gps(GpsFix {
        cog: Some(normalize_positive(deg_to_rad(cog_true))),
        sog: sentence.number(4),
        variation: Some(variation),
        ..GpsFix::default()
    }))
}

// -- Handler --

/// Per-outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Nmea0183Stats {
    pub bytes: u64,
    pub accepted: u32,
    pub checksum_errors: u32,
    pub framing_errors: u32,
    pub filtered: u32,
    pub decode_rejects: u32,
    /// Decoded but refused by validation or the prioritizer
    pub ingress_refused: u32,
    pub budget_exhausted: u32,
}

/// Drains the serial port and routes decoded sentences to the repository.
#[derive(Debug, Default)]
pub struct Nmea0183Handler {
    framer: LineFramer,
    gps_source: Option<SourceId>,
    autopilot_source: Option<SourceId>,
    stats: Nmea0183Stats,
}

impl Nmea0183Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the two serial talkers with the source prioritizer.
    pub fn register(&mut self, boat: &mut BoatData) -> Result<(), SourceError> {
        let gps = SourceId::new(GPS_SOURCE);
        let autopilot = SourceId::new(AUTOPILOT_SOURCE);
        boat.register_source(gps, SensorClass::Gps, Transport::Serial)?;
        boat.register_source(autopilot, SensorClass::Compass, Transport::Serial)?;
        self.gps_source = Some(gps);
        self.autopilot_source = Some(autopilot);
        Ok(())
    }

    pub fn stats(&self) -> Nmea0183Stats {
        self.stats
    }

    /// Read available bytes until the port is empty or `budget_ms` elapsed.
    pub fn poll(&mut self, port: &mut dyn SerialPort, boat: &mut BoatData, budget_ms: Millis) {
        let started = boat.now();
        while port.available() > 0 {
            if boat.now().saturating_sub(started) >= budget_ms {
                self.stats.budget_exhausted += 1;
                tracing::debug!(budget_ms, "serial budget spent, resuming next tick");
                break;
            }
            let Some(byte) = port.read() else {
                break;
            };
            self.stats.bytes += 1;
            match self.framer.push(byte) {
                Frame::Pending => {}
                Frame::Discarded => self.stats.framing_errors += 1,
                Frame::Complete => {
                    let mut line = [0u8; MAX_LINE];
                    let len = self.framer.line().len();
                    line[..len].copy_from_slice(self.framer.line());
                    self.handle_line(&line[..len], boat);
                }
            }
        }
    }

    /// Process one complete line (without CR-LF).
    pub fn handle_line(&mut self, line: &[u8], boat: &mut BoatData) {
        let sentence = match parse_sentence(line) {
            Ok(sentence) => sentence,
            Err(SentenceError::Checksum { sent, computed }) => {
                self.stats.checksum_errors += 1;
                tracing::debug!(sent, computed, "NMEA 0183 checksum mismatch");
                return;
            }
            Err(error) => {
                self.stats.framing_errors += 1;
                tracing::debug!(%error, "NMEA 0183 line discarded");
                return;
            }
        };

        let reading = match decode(&sentence) {
            Ok(Some(reading)) => reading,
            Ok(None) => {
                self.stats.filtered += 1;
                return;
            }
            Err(error) => {
                self.stats.decode_rejects += 1;
                tracing::debug!(
                    talker = sentence.talker,
                    kind = sentence.kind,
                    %error,
                    "NMEA 0183 sentence rejected"
                );
                return;
            }
        };

        let diagnostics = boat.diagnostics_mut();
        diagnostics.nmea0183_messages = diagnostics.nmea0183_messages.saturating_add(1);
        let gps = self.gps_source.unwrap_or_else(|| SourceId::new(GPS_SOURCE));
        let autopilot = self
            .autopilot_source
            .unwrap_or_else(|| SourceId::new(AUTOPILOT_SOURCE));
        let written = match reading {
            Reading::Rudder(angle) => boat.update_rudder(angle, autopilot),
            Reading::MagneticHeading(heading) => boat.update_heading(
                HeadingReading {
                    magnetic_heading: Some(heading),
                    ..HeadingReading::default()
                },
                autopilot,
            ),
            Reading::Gps(fix) => boat.update_gps(fix, gps),
        };
        if written {
            self.stats.accepted += 1;
        } else {
            self.stats.ingress_refused += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLog, Level};
    use crate::hal::{BufferSerialPort, ManualClock};
    use crate::angles::rad_to_deg;
    use approx::assert_abs_diff_eq;
    use std::rc::Rc;

    /// Wrap a sentence body with `$`, checksum and CR-LF.
    fn frame(body: &str) -> String {
        format!("${}*{:02X}\r\n", body, checksum(body.as_bytes()))
    }

    fn setup() -> (Nmea0183Handler, BoatData, ManualClock) {
        let clock = ManualClock::new(1_000);
        let mut boat = BoatData::new(Rc::new(clock.clone()), EventLog::new(16, Level::Debug));
        let mut handler = Nmea0183Handler::new();
        handler.register(&mut boat).unwrap();
        (handler, boat, clock)
    }

    fn feed(handler: &mut Nmea0183Handler, boat: &mut BoatData, text: &str) {
        let mut port = BufferSerialPort::new(1024);
        port.push(text.as_bytes());
        handler.poll(&mut port, boat, 50);
    }

    #[test]
    fn test_checksum_known_sentence() {
        let line = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let sentence = parse_sentence(line).unwrap();
        assert_eq!(sentence.talker, "GP");
        assert_eq!(sentence.kind, "GGA");
        assert_eq!(sentence.field(1), "4807.038");
        assert_eq!(sentence.field(40), "");
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let line = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48";
        assert!(matches!(
            parse_sentence(line),
            Err(SentenceError::Checksum { sent: 0x48, .. })
        ));
        assert_eq!(parse_sentence(b"GPGGA,1*00"), Err(SentenceError::NoStart));
        assert_eq!(parse_sentence(b"$GPGGA,1"), Err(SentenceError::NoChecksum));
    }

    #[test]
    fn test_framer_splits_lines() {
        let mut framer = LineFramer::new();
        let mut lines = Vec::new();
        for &byte in b"noise$AB\r\n$CD\r\n".iter() {
            if framer.push(byte) == Frame::Complete {
                lines.push(framer.line().to_vec());
            }
        }
        assert_eq!(lines, vec![b"$AB".to_vec(), b"$CD".to_vec()]);
    }

    #[test]
    fn test_framer_discards_overlong_line() {
        let mut framer = LineFramer::new();
        framer.push(b'$');
        let mut discarded = false;
        for _ in 0..MAX_LINE {
            discarded |= framer.push(b'A') == Frame::Discarded;
        }
        assert!(discarded);
        // The tail of the overlong line is ignored until the next '$'
        assert_eq!(framer.push(b'\n'), Frame::Pending);
        for &byte in b"$OK\n" {
            framer.push(byte);
        }
        assert_eq!(framer.line(), b"$OK");
    }

    #[test]
    fn test_framer_restart_on_dollar() {
        let mut framer = LineFramer::new();
        for &byte in b"$HALF" {
            framer.push(byte);
        }
        assert_eq!(framer.push(b'$'), Frame::Discarded);
    }

    #[test]
    fn test_rsa_updates_rudder() {
        let (mut handler, mut boat, _) = setup();
        feed(&mut handler, &mut boat, &frame("APRSA,-12.5,A,,V"));
        assert_abs_diff_eq!(rad_to_deg(boat.get_rudder().steering_angle), -12.5, epsilon = 1e-9);
        assert_eq!(handler.stats().accepted, 1);
    }

    #[test]
    fn test_rsa_invalid_status_rejected() {
        let (mut handler, mut boat, _) = setup();
        feed(&mut handler, &mut boat, &frame("APRSA,10.0,V,,V"));
        assert!(!boat.get_rudder().available);
        assert_eq!(handler.stats().decode_rejects, 1);
    }

    #[test]
    fn test_hdm_updates_magnetic_heading() {
        let (mut handler, mut boat, _) = setup();
        feed(&mut handler, &mut boat, &frame("APHDM,271.5,M"));
        let compass = boat.get_compass();
        assert!(compass.available);
        assert_abs_diff_eq!(rad_to_deg(compass.magnetic_heading), 271.5, epsilon = 1e-9);
    }

    #[test]
    fn test_gga_position_and_quality_filter() {
        let (mut handler, mut boat, _) = setup();
        feed(
            &mut handler,
            &mut boat,
            &frame("VHGGA,123519,4807.038,N,01131.000,W,0,08,0.9,545.4,M,46.9,M,,"),
        );
        assert!(!boat.get_gps().available);

        feed(
            &mut handler,
            &mut boat,
            &frame("VHGGA,123519,4807.038,N,01131.000,W,1,08,0.9,545.4,M,46.9,M,,"),
        );
        let gps = boat.get_gps();
        assert_abs_diff_eq!(gps.latitude, 48.1173, epsilon = 1e-4);
        assert_abs_diff_eq!(gps.longitude, -11.516_666, epsilon = 1e-5);
    }

    #[test]
    fn test_gga_then_rmc_fills_motion() {
        let (mut handler, mut boat, clock) = setup();
        for second in 0..10 {
            feed(
                &mut handler,
                &mut boat,
                &frame(&format!(
                    "VHGGA,1235{:02},4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,",
                    second
                )),
            );
            clock.advance(100);
            feed(
                &mut handler,
                &mut boat,
                &frame(&format!(
                    "VHRMC,1235{:02},A,4807.038,N,01131.000,E,6.2,95.0,230394,3.1,W",
                    second
                )),
            );
            clock.advance(900);
            let gps = boat.get_gps();
            assert_abs_diff_eq!(gps.sog, 6.2, epsilon = 1e-9);
            assert_abs_diff_eq!(rad_to_deg(gps.cog), 95.0, epsilon = 1e-9);
        }
        assert_eq!(boat.diagnostics().rejected_readings, 0);
        assert_eq!(handler.stats().decode_rejects, 0);
    }

    #[test]
    fn test_rmc_variation_sign_and_limit() {
        let (mut handler, mut boat, clock) = setup();
        feed(
            &mut handler,
            &mut boat,
            &frame("VHRMC,123519,A,4807.038,N,01131.000,E,6.2,95.0,230394,3.1,W"),
        );
        let gps = boat.get_gps();
        assert_abs_diff_eq!(gps.sog, 6.2, epsilon = 1e-9);
        assert_abs_diff_eq!(rad_to_deg(gps.cog), 95.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rad_to_deg(gps.variation), -3.1, epsilon = 1e-9);

        clock.advance(1000);
        feed(
            &mut handler,
            &mut boat,
            &frame("VHRMC,123520,A,4807.038,N,01131.000,E,6.2,95.0,230394,31.0,E"),
        );
        assert_abs_diff_eq!(rad_to_deg(boat.get_gps().variation), -3.1, epsilon = 1e-9);
        assert_eq!(handler.stats().decode_rejects, 1);
    }

    #[test]
    fn test_rmc_void_status_rejected() {
        let (mut handler, mut boat, _) = setup();
        feed(
            &mut handler,
            &mut boat,
            &frame("VHRMC,123519,V,4807.038,N,01131.000,E,6.2,95.0,230394,3.1,W"),
        );
        assert!(!boat.get_gps().available);
    }

    #[test]
    fn test_vtg_derives_variation() {
        let (mut handler, mut boat, _) = setup();
        feed(&mut handler, &mut boat, &frame("VHVTG,2.0,T,358.0,M,5.5,N,10.2,K"));
        let gps = boat.get_gps();
        assert_abs_diff_eq!(rad_to_deg(gps.variation), 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rad_to_deg(gps.cog), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(gps.sog, 5.5, epsilon = 1e-9);
    }

    #[test]
    fn test_wrong_talker_filtered() {
        let (mut handler, mut boat, _) = setup();
        feed(&mut handler, &mut boat, &frame("GPHDM,100.0,M"));
        feed(&mut handler, &mut boat, &frame("APGGA,123519,4807.038,N,01131.000,W,1,08,,,,,,,"));
        feed(&mut handler, &mut boat, &frame("VHXTE,A,A,0.67,L,N"));
        assert_eq!(handler.stats().filtered, 3);
        assert!(!boat.get_compass().available);
        assert!(!boat.get_gps().available);
    }

    #[test]
    fn test_garbled_input_is_survived() {
        let (mut handler, mut boat, _) = setup();
        let mut text = String::from("$VHGGA,12");
        text.push_str(&frame("APHDM,10.0,M"));
        text.push_str("$APHDM,11.0,M*00\r\n");
        feed(&mut handler, &mut boat, &text);
        let stats = handler.stats();
        assert_eq!(stats.framing_errors, 1);
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.accepted, 1);
        assert_abs_diff_eq!(rad_to_deg(boat.get_compass().magnetic_heading), 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_budget_leaves_bytes_for_next_tick() {
        struct SlowPort {
            inner: BufferSerialPort,
            clock: ManualClock,
        }
        impl SerialPort for SlowPort {
            fn begin(&mut self, _baud: u32) -> std::io::Result<()> {
                Ok(())
            }
            fn available(&mut self) -> usize {
                self.inner.available()
            }
            fn read(&mut self) -> Option<u8> {
                // Every byte costs one millisecond
                self.clock.advance(1);
                self.inner.read()
            }
        }

        let (mut handler, mut boat, clock) = setup();
        let mut port = SlowPort {
            inner: BufferSerialPort::new(1024),
            clock: clock.clone(),
        };
        let text = frame("APHDM,10.0,M").repeat(10);
        port.inner.push(text.as_bytes());
        handler.poll(&mut port, &mut boat, 50);
        assert_eq!(handler.stats().bytes, 50);
        assert_eq!(handler.stats().budget_exhausted, 1);
        assert!(port.available() > 0);
    }
}
