//! NMEA 0183 sentence codec
//!
//! Frames `$...*HH\r\n` sentences out of an append-only byte buffer, validates
//! the XOR checksum and decodes the GGA position report and the RMC navigation
//! report. Sentence types outside the active [`FilterSet`] are classified by
//! their address field and discarded without splitting their fields.

use crate::core::{
    FilterSet, FixQuality, PositionFix, SentenceType, CHECKSUM_DELIMITER, KNOTS_TO_KMH,
    SENTENCE_START,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Buffered bytes tolerated without a line terminator before trimming
pub const MAX_SENTENCE_BUFFER: usize = 1024;

const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Errors that cause a single sentence to be discarded
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SentenceError {
    #[error("missing checksum delimiter")]
    MissingChecksum,
    #[error("checksum mismatch: computed {computed:02X}, transmitted {transmitted:02X}")]
    ChecksumMismatch { computed: u8, transmitted: u8 },
    #[error("invalid {field} field: '{value}'")]
    InvalidField { field: &'static str, value: String },
    #[error("{sentence} sentence has {available} fields, need {required}")]
    TooFewFields {
        sentence: SentenceType,
        required: usize,
        available: usize,
    },
    #[error("sentence payload is not ASCII text")]
    NotText,
}

impl SentenceError {
    fn invalid(field: &'static str, value: &str) -> Self {
        SentenceError::InvalidField {
            field,
            value: value.to_string(),
        }
    }
}

/// Decoded RMC navigation report
#[derive(Debug, Clone, PartialEq)]
pub struct NavigationReport {
    /// UTC instant when both date and time were present
    pub timestamp: Option<DateTime<Utc>>,
    /// Status flag `A`; speed and course are only trusted when set
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: f64,
    pub course_deg: f64,
}

/// Result of decoding one framed sentence
#[derive(Debug, Clone, PartialEq)]
pub enum SentenceOutcome {
    /// GGA merged with the latest trusted speed/course, ready to publish
    PositionReport(PositionFix),
    NavigationReport(NavigationReport),
    /// Valid sentence of a type that is unsupported or filtered out
    Ignored,
    /// Bad checksum or unparseable fields
    Malformed(SentenceError),
}

/// Running decode statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SentenceCounters {
    pub position_reports: u64,
    pub navigation_reports: u64,
    pub ignored: u64,
    pub checksum_errors: u64,
    pub malformed: u64,
    /// Bytes skipped while looking for a start marker
    pub bytes_discarded: u64,
}

impl SentenceCounters {
    /// Checksum failures plus field-level decode failures
    pub fn decode_errors(&self) -> u64 {
        self.checksum_errors + self.malformed
    }
}

/// XOR of all payload bytes
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Render a payload as a complete sentence including checksum and terminator
pub fn encode_sentence(payload: &str) -> String {
    format!("${}*{:02X}\r\n", payload, checksum(payload.as_bytes()))
}

/// Split a framed sentence (without terminator) into payload and transmitted checksum.
///
/// The checksum is verified; a mismatch is reported as an error.
pub fn split_sentence(line: &[u8]) -> Result<(&[u8], u8), SentenceError> {
    let body = match line.first() {
        Some(&SENTENCE_START) => &line[1..],
        _ => line,
    };
    let star = body
        .iter()
        .rposition(|&b| b == CHECKSUM_DELIMITER)
        .ok_or(SentenceError::MissingChecksum)?;
    let (payload, trailer) = (&body[..star], &body[star + 1..]);

    let transmitted = parse_hex_byte(trailer).ok_or_else(|| SentenceError::InvalidField {
        field: "checksum",
        value: String::from_utf8_lossy(trailer).into_owned(),
    })?;
    let computed = checksum(payload);
    if computed != transmitted {
        return Err(SentenceError::ChecksumMismatch {
            computed,
            transmitted,
        });
    }
    Ok((payload, transmitted))
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(text, 16).ok()
}

/// Encode a fix as a GGA sentence, e.g. for upload to a correction caster.
///
/// The altitude is written as MSL height with a zero geoid separation so the
/// ellipsoidal value round-trips.
pub fn encode_gga(fix: &PositionFix) -> String {
    let time = fix
        .timestamp
        .map(|ts| {
            format!(
                "{:02}{:02}{:02}.{:02}",
                ts.hour(),
                ts.minute(),
                ts.second(),
                ts.timestamp_subsec_millis() / 10
            )
        })
        .unwrap_or_default();

    let (lat, ns, lon, ew, alt) = if fix.is_valid() {
        (
            format_coordinate(fix.latitude, 2),
            if fix.latitude < 0.0 { "S" } else { "N" },
            format_coordinate(fix.longitude, 3),
            if fix.longitude < 0.0 { "W" } else { "E" },
            format!("{:.3}", fix.altitude),
        )
    } else {
        (String::new(), "", String::new(), "", String::new())
    };

    let age = fix.differential_age.map(|a| format!("{:.1}", a)).unwrap_or_default();
    let station = fix
        .reference_station_id
        .map(|s| format!("{:04}", s))
        .unwrap_or_default();

    let payload = format!(
        "GPGGA,{},{},{},{},{},{},{:02},{:.1},{},M,0.0,M,{},{}",
        time,
        lat,
        ns,
        lon,
        ew,
        fix.fix_quality.gga_code(),
        fix.satellites_used,
        fix.hdop,
        alt,
        age,
        station
    );
    encode_sentence(&payload)
}

fn format_coordinate(value: f64, degree_digits: usize) -> String {
    const UNITS_PER_MINUTE: u64 = 10_000_000;
    let total = (value.abs() * 60.0 * UNITS_PER_MINUTE as f64).round() as u64;
    let degrees = total / (60 * UNITS_PER_MINUTE);
    let minute_units = total % (60 * UNITS_PER_MINUTE);
    format!(
        "{:0width$}{:02}.{:07}",
        degrees,
        minute_units / UNITS_PER_MINUTE,
        minute_units % UNITS_PER_MINUTE,
        width = degree_digits
    )
}

/// Parse a `DDMM.MMMM` / `DDDMM.MMMM` coordinate with its hemisphere letter.
///
/// Returns `Ok(None)` when both fields are empty.
pub fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    positive: char,
    negative: char,
    max_degrees: u16,
) -> Result<Option<f64>, SentenceError> {
    if value.is_empty() && hemisphere.is_empty() {
        return Ok(None);
    }
    if !value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return Err(SentenceError::invalid("coordinate", value));
    }
    let dot = value.find('.').unwrap_or(value.len());
    if dot < 3 {
        return Err(SentenceError::invalid("coordinate", value));
    }

    let degrees: u16 = value[..dot - 2]
        .parse()
        .map_err(|_| SentenceError::invalid("coordinate", value))?;
    let minutes: f64 = value[dot - 2..]
        .parse()
        .map_err(|_| SentenceError::invalid("coordinate", value))?;
    if minutes >= 60.0 || degrees > max_degrees {
        return Err(SentenceError::invalid("coordinate", value));
    }

    let magnitude = degrees as f64 + minutes / 60.0;
    if magnitude > max_degrees as f64 {
        return Err(SentenceError::invalid("coordinate", value));
    }
    match hemisphere.chars().next() {
        Some(c) if c == positive && hemisphere.len() == 1 => Ok(Some(magnitude)),
        Some(c) if c == negative && hemisphere.len() == 1 => Ok(Some(-magnitude)),
        _ => Err(SentenceError::invalid("hemisphere", hemisphere)),
    }
}

fn parse_optional<T: FromStr>(field: &'static str, value: &str) -> Result<Option<T>, SentenceError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| SentenceError::invalid(field, value))
}

/// Real-valued field; `NaN` and infinities are rejected
fn parse_real(field: &'static str, value: &str) -> Result<Option<f64>, SentenceError> {
    match parse_optional::<f64>(field, value)? {
        Some(v) if !v.is_finite() => Err(SentenceError::invalid(field, value)),
        other => Ok(other),
    }
}

fn parse_time(value: &str) -> Result<Option<NaiveTime>, SentenceError> {
    if value.is_empty() {
        return Ok(None);
    }
    let bytes = value.as_bytes();
    if bytes.len() < 6 || !bytes[..6].iter().all(u8::is_ascii_digit) {
        return Err(SentenceError::invalid("time", value));
    }
    let hour: u32 = value[0..2].parse().map_err(|_| SentenceError::invalid("time", value))?;
    let minute: u32 = value[2..4].parse().map_err(|_| SentenceError::invalid("time", value))?;
    let seconds: f64 = value[4..].parse().map_err(|_| SentenceError::invalid("time", value))?;
    if !(0.0..60.0).contains(&seconds) {
        return Err(SentenceError::invalid("time", value));
    }
    let whole = seconds.trunc() as u32;
    let nanos = ((seconds - seconds.trunc()) * 1e9).round().min(999_999_999.0) as u32;
    NaiveTime::from_hms_nano_opt(hour, minute, whole, nanos)
        .map(Some)
        .ok_or_else(|| SentenceError::invalid("time", value))
}

fn parse_date(value: &str) -> Result<Option<NaiveDate>, SentenceError> {
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SentenceError::invalid("date", value));
    }
    let day: u32 = value[0..2].parse().map_err(|_| SentenceError::invalid("date", value))?;
    let month: u32 = value[2..4].parse().map_err(|_| SentenceError::invalid("date", value))?;
    let year: i32 = value[4..6].parse().map_err(|_| SentenceError::invalid("date", value))?;
    NaiveDate::from_ymd_opt(2000 + year, month, day)
        .map(Some)
        .ok_or_else(|| SentenceError::invalid("date", value))
}

fn require_fields(sentence: SentenceType, fields: &[&str], required: usize) -> Result<(), SentenceError> {
    if fields.len() < required {
        return Err(SentenceError::TooFewFields {
            sentence,
            required,
            available: fields.len(),
        });
    }
    Ok(())
}

/// Streaming NMEA decoder
///
/// Holds the partially received bytes plus the navigation context (last date,
/// last trusted speed/course) that GGA reports are merged with.
#[derive(Debug, Default)]
pub struct SentenceDecoder {
    buffer: Vec<u8>,
    last_date: Option<NaiveDate>,
    last_instant: Option<DateTime<Utc>>,
    motion: Option<(f64, f64)>,
    counters: SentenceCounters,
}

impl SentenceDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes to the framing buffer
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn counters(&self) -> SentenceCounters {
        self.counters
    }

    /// Extract and decode the next complete sentence.
    ///
    /// Returns `None` once the buffer holds no further complete sentence. The
    /// filter is consulted exactly once per sentence.
    pub fn next_outcome(&mut self, filter: &FilterSet) -> Option<SentenceOutcome> {
        loop {
            let start = match self.buffer.iter().position(|&b| b == SENTENCE_START) {
                Some(pos) => pos,
                None => {
                    self.counters.bytes_discarded += self.buffer.len() as u64;
                    self.buffer.clear();
                    return None;
                }
            };
            if start > 0 {
                self.buffer.drain(..start);
                self.counters.bytes_discarded += start as u64;
            }

            let end = match self
                .buffer
                .windows(LINE_TERMINATOR.len())
                .position(|w| w == LINE_TERMINATOR)
            {
                Some(end) => end,
                None => {
                    self.trim_unterminated();
                    return None;
                }
            };

            let framed: Vec<u8> = self.buffer.drain(..end + LINE_TERMINATOR.len()).collect();
            let mut line = &framed[..end];

            // A truncated sentence followed by a fresh one: keep the latest start marker.
            if let Some(restart) = line.iter().rposition(|&b| b == SENTENCE_START) {
                if restart > 0 {
                    self.counters.bytes_discarded += restart as u64;
                    line = &line[restart..];
                }
            }
            if line.len() <= 1 {
                continue;
            }

            let outcome = self.decode_line(line, filter);
            self.record(&outcome);
            return Some(outcome);
        }
    }

    /// Drain every complete sentence currently buffered
    pub fn drain_outcomes(&mut self, filter: &FilterSet) -> Vec<SentenceOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next_outcome(filter) {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn trim_unterminated(&mut self) {
        if self.buffer.len() <= MAX_SENTENCE_BUFFER {
            return;
        }
        let keep_from = self
            .buffer
            .iter()
            .rposition(|&b| b == SENTENCE_START)
            .filter(|&pos| pos > 0)
            .unwrap_or(self.buffer.len());
        self.buffer.drain(..keep_from);
        self.counters.bytes_discarded += keep_from as u64;
        tracing::debug!(discarded = keep_from, "Trimmed unterminated NMEA data");
    }

    fn record(&mut self, outcome: &SentenceOutcome) {
        match outcome {
            SentenceOutcome::PositionReport(_) => self.counters.position_reports += 1,
            SentenceOutcome::NavigationReport(_) => self.counters.navigation_reports += 1,
            SentenceOutcome::Ignored => self.counters.ignored += 1,
            SentenceOutcome::Malformed(SentenceError::ChecksumMismatch { .. }) => {
                self.counters.checksum_errors += 1
            }
            SentenceOutcome::Malformed(_) => self.counters.malformed += 1,
        }
    }

    fn decode_line(&mut self, line: &[u8], filter: &FilterSet) -> SentenceOutcome {
        let payload = match split_sentence(line) {
            Ok((payload, _)) => payload,
            Err(e) => {
                tracing::debug!(error = %e, sentence = %String::from_utf8_lossy(line), "Dropping NMEA sentence");
                return SentenceOutcome::Malformed(e);
            }
        };

        let address_end = payload.iter().position(|&b| b == b',').unwrap_or(payload.len());
        let sentence_type = match SentenceType::from_address(&payload[..address_end]) {
            Some(t) if filter.contains(t) => t,
            _ => return SentenceOutcome::Ignored,
        };

        let text = match std::str::from_utf8(payload) {
            Ok(text) if text.is_ascii() => text,
            _ => return SentenceOutcome::Malformed(SentenceError::NotText),
        };
        let fields: Vec<&str> = text.split(',').collect();

        let result = match sentence_type {
            SentenceType::Gga => self.decode_gga(&fields).map(SentenceOutcome::PositionReport),
            SentenceType::Rmc => self.decode_rmc(&fields).map(SentenceOutcome::NavigationReport),
        };
        result.unwrap_or_else(|e| {
            tracing::debug!(error = %e, sentence = text, "Malformed NMEA sentence");
            SentenceOutcome::Malformed(e)
        })
    }

    fn decode_gga(&self, fields: &[&str]) -> Result<PositionFix, SentenceError> {
        // $--GGA,time,lat,N,lon,E,quality,sats,hdop,alt,M,sep,M,age,station
        require_fields(SentenceType::Gga, fields, 10)?;

        let time = parse_time(fields[1])?;
        let latitude = parse_coordinate(fields[2], fields[3], 'N', 'S', 90)?;
        let longitude = parse_coordinate(fields[4], fields[5], 'E', 'W', 180)?;

        let code: u8 = fields[6]
            .parse()
            .map_err(|_| SentenceError::invalid("fix quality", fields[6]))?;
        let fix_quality =
            FixQuality::from_gga_code(code).ok_or_else(|| SentenceError::invalid("fix quality", fields[6]))?;

        let satellites_used = parse_optional::<u8>("satellites", fields[7])?.unwrap_or(0);
        let hdop = parse_real("hdop", fields[8])?.unwrap_or(0.0);
        if hdop < 0.0 {
            return Err(SentenceError::invalid("hdop", fields[8]));
        }
        let msl_altitude = parse_real("altitude", fields[9])?;
        let separation = parse_real("geoid separation", fields.get(11).copied().unwrap_or(""))?;
        let differential_age = parse_real("differential age", fields.get(13).copied().unwrap_or(""))?;
        let reference_station_id = parse_optional::<u16>("station id", fields.get(14).copied().unwrap_or(""))?;

        let (speed_kmh, course_deg) = self.motion.unwrap_or((0.0, 0.0));
        let timestamp = self.timestamp_for(time);

        if !fix_quality.is_valid() {
            return Ok(PositionFix {
                fix_quality,
                satellites_used,
                hdop,
                timestamp,
                ..PositionFix::invalid()
            });
        }

        let latitude = latitude.ok_or_else(|| SentenceError::invalid("latitude", fields[2]))?;
        let longitude = longitude.ok_or_else(|| SentenceError::invalid("longitude", fields[4]))?;

        Ok(PositionFix {
            latitude,
            longitude,
            altitude: msl_altitude.unwrap_or(0.0) + separation.unwrap_or(0.0),
            fix_quality,
            satellites_used,
            hdop,
            timestamp,
            speed_kmh,
            course_deg,
            differential_age,
            reference_station_id,
        })
    }

    fn decode_rmc(&mut self, fields: &[&str]) -> Result<NavigationReport, SentenceError> {
        // $--RMC,time,status,lat,N,lon,E,speed,course,date,magvar,E[,mode]
        require_fields(SentenceType::Rmc, fields, 10)?;

        let time = parse_time(fields[1])?;
        let valid = match fields[2] {
            "A" => true,
            "V" => false,
            other => return Err(SentenceError::invalid("status", other)),
        };
        let latitude = parse_coordinate(fields[3], fields[4], 'N', 'S', 90)?;
        let longitude = parse_coordinate(fields[5], fields[6], 'E', 'W', 180)?;

        let speed_knots = parse_real("speed", fields[7])?.unwrap_or(0.0);
        if speed_knots < 0.0 {
            return Err(SentenceError::invalid("speed", fields[7]));
        }
        let course = parse_real("course", fields[8])?.unwrap_or(0.0);
        if !(0.0..=360.0).contains(&course) {
            return Err(SentenceError::invalid("course", fields[8]));
        }
        let date = parse_date(fields[9])?;

        let timestamp = match (date, time) {
            (Some(date), Some(time)) => Some(Utc.from_utc_datetime(&date.and_time(time))),
            _ => None,
        };

        let report = NavigationReport {
            timestamp,
            valid,
            latitude,
            longitude,
            speed_kmh: speed_knots * KNOTS_TO_KMH,
            course_deg: course.rem_euclid(360.0),
        };

        if date.is_some() {
            self.last_date = date;
        }
        if timestamp.is_some() {
            self.last_instant = timestamp;
        }
        self.motion = valid.then_some((report.speed_kmh, report.course_deg));

        Ok(report)
    }

    /// Combine a GGA time-of-day with the last RMC date, advancing the date when
    /// the time has wrapped past midnight since that report.
    fn timestamp_for(&self, time: Option<NaiveTime>) -> Option<DateTime<Utc>> {
        let time = time?;
        let date = self.last_date?;
        let mut candidate = Utc.from_utc_datetime(&date.and_time(time));
        if let Some(last) = self.last_instant {
            if candidate < last - Duration::hours(12) {
                candidate += Duration::days(1);
            }
        }
        Some(candidate)
    }
}
