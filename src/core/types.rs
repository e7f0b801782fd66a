//! Core data types for the positioning pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Positioning method reported by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FixQuality {
    /// No fix; positional fields carry no meaning
    #[default]
    Invalid,
    /// Autonomous GNSS fix
    Standard,
    /// Code-differential fix (DGPS/SBAS)
    Differential,
    /// RTK with integer ambiguities resolved
    RtkFixed,
    /// RTK with float ambiguities
    RtkFloat,
    /// Dead-reckoning estimate
    DeadReckoning,
}

impl FixQuality {
    /// Map a GGA quality indicator to a fix quality.
    ///
    /// Codes outside the supported set (PPS, manual input, simulation) yield `None`.
    pub fn from_gga_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FixQuality::Invalid),
            1 => Some(FixQuality::Standard),
            2 => Some(FixQuality::Differential),
            4 => Some(FixQuality::RtkFixed),
            5 => Some(FixQuality::RtkFloat),
            6 => Some(FixQuality::DeadReckoning),
            _ => None,
        }
    }

    /// GGA quality indicator for this fix quality
    pub fn gga_code(&self) -> u8 {
        match self {
            FixQuality::Invalid => 0,
            FixQuality::Standard => 1,
            FixQuality::Differential => 2,
            FixQuality::RtkFixed => 4,
            FixQuality::RtkFloat => 5,
            FixQuality::DeadReckoning => 6,
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, FixQuality::Invalid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FixQuality::Invalid => "invalid",
            FixQuality::Standard => "standard",
            FixQuality::Differential => "differential",
            FixQuality::RtkFixed => "rtk-fixed",
            FixQuality::RtkFloat => "rtk-float",
            FixQuality::DeadReckoning => "dead-reckoning",
        }
    }
}

impl fmt::Display for FixQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the latest known position fix
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionFix {
    /// Latitude in decimal degrees, positive north
    pub latitude: f64,
    /// Longitude in decimal degrees, positive east
    pub longitude: f64,
    /// Height above the WGS84 ellipsoid in meters
    pub altitude: f64,
    pub fix_quality: FixQuality,
    pub satellites_used: u8,
    /// Horizontal dilution of precision
    pub hdop: f64,
    /// UTC instant of the fix; absent until a date has been observed
    pub timestamp: Option<DateTime<Utc>>,
    /// Ground speed in km/h
    pub speed_kmh: f64,
    /// Course over ground in degrees from true north
    pub course_deg: f64,
    /// Age of the differential corrections in seconds
    pub differential_age: Option<f64>,
    /// Reference station supplying the corrections
    pub reference_station_id: Option<u16>,
}

impl PositionFix {
    /// The initial snapshot: invalid quality, zeroed fields, no timestamp
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.fix_quality.is_valid()
    }

    /// Serialize the fix as a JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// NMEA sentence types the codec can decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SentenceType {
    /// GGA position report
    Gga,
    /// RMC navigation report
    Rmc,
}

impl SentenceType {
    /// All decodable sentence types
    pub const ALL: [SentenceType; 2] = [SentenceType::Gga, SentenceType::Rmc];

    /// Three-letter sentence tag
    pub fn tag(&self) -> &'static str {
        match self {
            SentenceType::Gga => "GGA",
            SentenceType::Rmc => "RMC",
        }
    }

    /// Classify a sentence by its address field (talker + type).
    ///
    /// Only standard five-character addresses are classified; proprietary
    /// sentences and unknown types return `None`.
    pub fn from_address(address: &[u8]) -> Option<Self> {
        if address.len() != 5 {
            return None;
        }
        match &address[2..] {
            b"GGA" => Some(SentenceType::Gga),
            b"RMC" => Some(SentenceType::Rmc),
            _ => None,
        }
    }
}

impl fmt::Display for SentenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SentenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GGA" => Ok(SentenceType::Gga),
            "RMC" => Ok(SentenceType::Rmc),
            other => Err(format!("unsupported sentence type '{}'", other)),
        }
    }
}

/// Set of sentence types enabled for decoding
///
/// An empty set is legal: every sentence is classified and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterSet(BTreeSet<SentenceType>);

impl FilterSet {
    pub fn new<I: IntoIterator<Item = SentenceType>>(types: I) -> Self {
        Self(types.into_iter().collect())
    }

    /// Every supported sentence type
    pub fn all() -> Self {
        Self::new(SentenceType::ALL)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, sentence_type: SentenceType) -> bool {
        self.0.contains(&sentence_type)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = SentenceType> + '_ {
        self.0.iter().copied()
    }

    /// Parse a list of three-letter tags, rejecting unknown ones
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Result<Self, String> {
        tags.iter()
            .map(|tag| tag.as_ref().parse::<SentenceType>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<SentenceType> for FilterSet {
    fn from_iter<I: IntoIterator<Item = SentenceType>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_fix_is_invalid() {
        let fix = PositionFix::invalid();
        assert_eq!(fix.fix_quality, FixQuality::Invalid);
        assert_eq!(fix.latitude, 0.0);
        assert_eq!(fix.longitude, 0.0);
        assert!(fix.timestamp.is_none());
        assert!(!fix.is_valid());
    }

    #[test]
    fn test_zero_valid_fix_distinguishable_from_invalid() {
        let zero_valid = PositionFix {
            fix_quality: FixQuality::Standard,
            ..PositionFix::invalid()
        };
        assert_ne!(zero_valid, PositionFix::invalid());
        assert!(zero_valid.is_valid());
    }

    #[test]
    fn test_quality_codes() {
        for code in [0u8, 1, 2, 4, 5, 6] {
            let quality = FixQuality::from_gga_code(code).unwrap();
            assert_eq!(quality.gga_code(), code);
        }
        assert!(FixQuality::from_gga_code(3).is_none());
        assert!(FixQuality::from_gga_code(8).is_none());
    }

    #[test]
    fn test_sentence_type_classification() {
        assert_eq!(SentenceType::from_address(b"GPGGA"), Some(SentenceType::Gga));
        assert_eq!(SentenceType::from_address(b"GNRMC"), Some(SentenceType::Rmc));
        assert_eq!(SentenceType::from_address(b"GPGSV"), None);
        assert_eq!(SentenceType::from_address(b"PUBX"), None);
        assert_eq!("rmc".parse::<SentenceType>(), Ok(SentenceType::Rmc));
        assert!("GLL".parse::<SentenceType>().is_err());
    }

    #[test]
    fn test_filter_set_from_tags() {
        let filter = FilterSet::from_tags(&["GGA", "rmc"]).unwrap();
        assert_eq!(filter, FilterSet::all());
        assert!(FilterSet::from_tags(&["GGA", "VTG"]).is_err());
        assert!(FilterSet::empty().is_empty());
        assert!(!FilterSet::new([SentenceType::Gga]).contains(SentenceType::Rmc));
    }

    #[test]
    fn test_fix_json_export() {
        let fix = PositionFix {
            latitude: 48.1173,
            fix_quality: FixQuality::RtkFixed,
            ..PositionFix::invalid()
        };
        let json = fix.to_json().unwrap();
        assert!(json.contains("\"fix_quality\":\"RtkFixed\""));
        assert!(json.contains("\"timestamp\":null"));
    }
}
