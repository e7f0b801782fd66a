//! Protocol and geodetic constants

/// Knots to kilometres per hour
pub const KNOTS_TO_KMH: f64 = 1.852;

/// NMEA sentence start marker
pub const SENTENCE_START: u8 = b'$';

/// NMEA checksum delimiter
pub const CHECKSUM_DELIMITER: u8 = b'*';

/// RTCM3 frame preamble
pub const RTCM_PREAMBLE: u8 = 0xD3;

/// Largest payload representable by the 10-bit RTCM3 length field
pub const RTCM_MAX_PAYLOAD: usize = 1023;

/// Preamble plus the two-byte length header
pub const RTCM_HEADER_LEN: usize = 3;

/// CRC-24Q trailer length
pub const RTCM_CRC_LEN: usize = 3;

/// Earth semi-major axis in meters (WGS84)
pub const EARTH_RADIUS_WGS84: f64 = 6378137.0;

/// Earth flattening factor (WGS84)
pub const EARTH_FLATTENING_WGS84: f64 = 1.0 / 298.257223563;

/// Eccentricity squared (WGS84)
pub const ECCENTRICITY_SQUARED_WGS84: f64 = 2.0 * EARTH_FLATTENING_WGS84 - EARTH_FLATTENING_WGS84 * EARTH_FLATTENING_WGS84;
