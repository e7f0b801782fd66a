//! Advisory RTCM3 message decoding
//!
//! Station-coordinate messages (1005/1006) and the common header of MSM
//! observation messages (1071-1137) are decoded for status reporting only.
//! Relay never depends on the outcome.

use crate::core::{EARTH_FLATTENING_WGS84, EARTH_RADIUS_WGS84, ECCENTRICITY_SQUARED_WGS84};
use crate::processing::frame::BinaryFrame;
use nalgebra::Vector3;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// ECEF coordinate resolution in meters per unit
const ECEF_RESOLUTION: f64 = 0.0001;

/// Errors decoding a correction message body
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RtcmError {
    #[error("message {message_type} needs {required} bits, payload has {available}")]
    Truncated {
        message_type: u16,
        required: usize,
        available: usize,
    },
    #[error("payload too short to carry a message type")]
    MissingType,
    #[error("MSM message {message_type} has {cells} cells, more than 64")]
    TooManyCells { message_type: u16, cells: u32 },
}

/// MSB-first bit reader over a payload
struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn available(&self) -> usize {
        self.data.len() * 8
    }

    fn unsigned(&mut self, length: usize) -> u64 {
        let mut value = 0u64;
        for _ in 0..length {
            let byte = self.data[self.position / 8];
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.position += 1;
        }
        value
    }

    fn signed(&mut self, length: usize) -> i64 {
        let raw = self.unsigned(length);
        if raw & (1 << (length - 1)) != 0 {
            raw as i64 - (1i64 << length)
        } else {
            raw as i64
        }
    }

    fn skip(&mut self, length: usize) {
        self.position += length;
    }
}

/// GNSS constellation of an MSM message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Constellation {
    Gps,
    Glonass,
    Galileo,
    Sbas,
    Qzss,
    Beidou,
    Navic,
}

impl Constellation {
    fn from_message_type(message_type: u16) -> Option<Self> {
        match message_type {
            1071..=1077 => Some(Constellation::Gps),
            1081..=1087 => Some(Constellation::Glonass),
            1091..=1097 => Some(Constellation::Galileo),
            1101..=1107 => Some(Constellation::Sbas),
            1111..=1117 => Some(Constellation::Qzss),
            1121..=1127 => Some(Constellation::Beidou),
            1131..=1137 => Some(Constellation::Navic),
            _ => None,
        }
    }
}

/// Geodetic position on the WGS84 ellipsoid
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Geodetic {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Convert ECEF coordinates to WGS84 latitude/longitude/height (Bowring)
pub fn ecef_to_geodetic(ecef: &Vector3<f64>) -> Geodetic {
    let a = EARTH_RADIUS_WGS84;
    let b = a * (1.0 - EARTH_FLATTENING_WGS84);
    let e2 = ECCENTRICITY_SQUARED_WGS84;
    let ep2 = e2 / (1.0 - e2);

    let p = ecef.x.hypot(ecef.y);
    let theta = (ecef.z * a).atan2(p * b);
    let lat = (ecef.z + ep2 * b * theta.sin().powi(3)).atan2(p - e2 * a * theta.cos().powi(3));
    let lon = ecef.y.atan2(ecef.x);

    let n = a / (1.0 - e2 * lat.sin().powi(2)).sqrt();
    let altitude = if lat.cos().abs() > 1e-10 {
        p / lat.cos() - n
    } else {
        ecef.z.abs() - b
    };

    Geodetic {
        latitude: lat.to_degrees(),
        longitude: lon.to_degrees(),
        altitude,
    }
}

/// Convert WGS84 latitude/longitude/height to ECEF coordinates
pub fn geodetic_to_ecef(position: &Geodetic) -> Vector3<f64> {
    let lat = position.latitude.to_radians();
    let lon = position.longitude.to_radians();
    let n = EARTH_RADIUS_WGS84 / (1.0 - ECCENTRICITY_SQUARED_WGS84 * lat.sin().powi(2)).sqrt();
    Vector3::new(
        (n + position.altitude) * lat.cos() * lon.cos(),
        (n + position.altitude) * lat.cos() * lon.sin(),
        (n * (1.0 - ECCENTRICITY_SQUARED_WGS84) + position.altitude) * lat.sin(),
    )
}

/// Antenna reference point of the correction base station
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StationPosition {
    pub station_id: u16,
    /// ECEF antenna reference point in meters
    pub ecef: [f64; 3],
    /// Antenna height above the marker, 1006 only
    pub antenna_height: Option<f64>,
    pub geodetic: Geodetic,
}

/// Common header of an MSM observation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MsmHeader {
    pub message_type: u16,
    pub constellation: Constellation,
    /// MSM level 1-7
    pub level: u8,
    pub station_id: u16,
    /// Constellation-specific epoch time field
    pub epoch_time: u32,
    /// More MSM messages follow for the same epoch
    pub multiple_message: bool,
    pub satellites: u32,
    pub signals: u32,
    pub cells: u32,
}

/// Decoded content of one correction frame
#[derive(Debug, Clone, PartialEq)]
pub enum CorrectionMessage {
    StationCoordinates(StationPosition),
    Observations(MsmHeader),
    /// Valid frame of a type this decoder does not interpret
    Other(u16),
}

/// Decode a frame payload.
pub fn decode_message(payload: &[u8]) -> Result<CorrectionMessage, RtcmError> {
    if payload.len() < 2 {
        return Err(RtcmError::MissingType);
    }
    let mut reader = BitReader::new(payload);
    let message_type = reader.unsigned(12) as u16;

    match message_type {
        1005 | 1006 => decode_station(message_type, &mut reader).map(CorrectionMessage::StationCoordinates),
        t if Constellation::from_message_type(t).is_some() => {
            decode_msm_header(message_type, &mut reader).map(CorrectionMessage::Observations)
        }
        other => Ok(CorrectionMessage::Other(other)),
    }
}

fn require(reader: &BitReader<'_>, message_type: u16, required: usize) -> Result<(), RtcmError> {
    if reader.available() < required {
        return Err(RtcmError::Truncated {
            message_type,
            required,
            available: reader.available(),
        });
    }
    Ok(())
}

fn decode_station(message_type: u16, reader: &mut BitReader<'_>) -> Result<StationPosition, RtcmError> {
    let required = if message_type == 1006 { 168 } else { 152 };
    require(reader, message_type, required)?;

    let station_id = reader.unsigned(12) as u16;
    // ITRF year, constellation indicators, reference-station indicator
    reader.skip(10);
    let x = reader.signed(38) as f64 * ECEF_RESOLUTION;
    // single receiver oscillator, reserved
    reader.skip(2);
    let y = reader.signed(38) as f64 * ECEF_RESOLUTION;
    // quarter cycle indicator
    reader.skip(2);
    let z = reader.signed(38) as f64 * ECEF_RESOLUTION;
    let antenna_height = (message_type == 1006).then(|| reader.unsigned(16) as f64 * ECEF_RESOLUTION);

    let ecef = Vector3::new(x, y, z);
    Ok(StationPosition {
        station_id,
        ecef: [x, y, z],
        antenna_height,
        geodetic: ecef_to_geodetic(&ecef),
    })
}

fn decode_msm_header(message_type: u16, reader: &mut BitReader<'_>) -> Result<MsmHeader, RtcmError> {
    const MASKS_END: usize = 169;
    require(reader, message_type, MASKS_END)?;

    let station_id = reader.unsigned(12) as u16;
    let epoch_time = reader.unsigned(30) as u32;
    let multiple_message = reader.unsigned(1) == 1;
    // IODS, reserved, clock steering, external clock, smoothing
    reader.skip(3 + 7 + 2 + 2 + 1 + 3);
    let satellites = reader.unsigned(64).count_ones();
    let signals = reader.unsigned(32).count_ones();

    let cells = satellites * signals;
    if cells > 64 {
        return Err(RtcmError::TooManyCells { message_type, cells });
    }
    require(reader, message_type, MASKS_END + cells as usize)?;
    let cells = reader.unsigned(cells as usize).count_ones();

    Ok(MsmHeader {
        message_type,
        constellation: Constellation::from_message_type(message_type).unwrap_or(Constellation::Gps),
        level: (message_type % 10) as u8,
        station_id,
        epoch_time,
        multiple_message,
        satellites,
        signals,
        cells,
    })
}

/// Accounting of correction traffic by message type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionStats {
    pub message_counts: BTreeMap<u16, u64>,
    /// Frames too short to carry a message type
    pub untyped_frames: u64,
    pub decode_errors: u64,
    pub last_station: Option<StationPosition>,
    pub last_observation: Option<MsmHeader>,
}

impl CorrectionStats {
    /// Account one validated frame and decode it when the type is known
    pub fn record(&mut self, frame: &BinaryFrame) {
        let message_type = match frame.message_type() {
            Some(t) => t,
            None => {
                self.untyped_frames += 1;
                return;
            }
        };
        *self.message_counts.entry(message_type).or_insert(0) += 1;

        match decode_message(frame.payload()) {
            Ok(CorrectionMessage::StationCoordinates(station)) => {
                if self.last_station.map(|s| s.ecef) != Some(station.ecef) {
                    tracing::info!(
                        station_id = station.station_id,
                        latitude = station.geodetic.latitude,
                        longitude = station.geodetic.longitude,
                        altitude = station.geodetic.altitude,
                        "Reference station position updated"
                    );
                }
                self.last_station = Some(station);
            }
            Ok(CorrectionMessage::Observations(header)) => {
                self.last_observation = Some(header);
            }
            Ok(CorrectionMessage::Other(_)) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Could not decode correction message");
                self.decode_errors += 1;
            }
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.message_counts.values().sum::<u64>() + self.untyped_frames
    }
}
