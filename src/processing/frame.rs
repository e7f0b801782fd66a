//! RTCM3 binary frame codec
//!
//! Frame layout: preamble `0xD3`, 6 reserved bits, 10-bit payload length,
//! payload, 24-bit CRC-24Q over everything before it.

use crate::core::{RTCM_CRC_LEN, RTCM_HEADER_LEN, RTCM_MAX_PAYLOAD, RTCM_PREAMBLE};
use serde::Serialize;
use thiserror::Error;

const CRC24Q_POLY: u32 = 0x0186_4CFB;

/// Errors that occur while building or validating frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("payload of {length} bytes exceeds the {max} byte frame limit")]
    PayloadTooLong { length: usize, max: usize },
    #[error("{length} bytes cannot hold a frame header and CRC")]
    Truncated { length: usize },
    #[error("frame starts with 0x{found:02X}, not the 0xD3 preamble")]
    MissingPreamble { found: u8 },
    #[error("header declares a {expected} byte frame, got {actual} bytes")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("CRC mismatch: computed {computed:06X}, transmitted {transmitted:06X}")]
    CrcMismatch { computed: u32, transmitted: u32 },
}

/// CRC-24Q as used by RTCM3 (initial value zero, no reflection)
pub fn crc24q(data: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24Q_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

/// One validated RTCM3 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    bytes: Vec<u8>,
}

impl BinaryFrame {
    /// Complete frame bytes including preamble and CRC
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        let end = self.bytes.len().saturating_sub(RTCM_CRC_LEN);
        self.bytes.get(RTCM_HEADER_LEN..end).unwrap_or(&[])
    }

    /// First 12 bits of the payload, when at least two payload bytes exist
    pub fn message_type(&self) -> Option<u16> {
        match self.payload() {
            [first, second, ..] => Some(((*first as u16) << 4) | ((*second as u16) >> 4)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Build a complete frame around a payload
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > RTCM_MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLong {
            length: payload.len(),
            max: RTCM_MAX_PAYLOAD,
        });
    }
    let mut frame = Vec::with_capacity(RTCM_HEADER_LEN + payload.len() + RTCM_CRC_LEN);
    frame.push(RTCM_PREAMBLE);
    frame.push(((payload.len() >> 8) & 0x03) as u8);
    frame.push((payload.len() & 0xFF) as u8);
    frame.extend_from_slice(payload);
    let crc = crc24q(&frame);
    frame.extend_from_slice(&[(crc >> 16) as u8, (crc >> 8) as u8, crc as u8]);
    Ok(frame)
}

fn declared_length(header: &[u8]) -> usize {
    (((header[1] & 0x03) as usize) << 8) | header[2] as usize
}

/// Validate one complete frame held in `bytes`: preamble, declared length and CRC
pub fn verify_frame(bytes: &[u8]) -> Result<BinaryFrame, FrameError> {
    if bytes.len() < RTCM_HEADER_LEN + RTCM_CRC_LEN {
        return Err(FrameError::Truncated { length: bytes.len() });
    }
    if bytes[0] != RTCM_PREAMBLE {
        return Err(FrameError::MissingPreamble { found: bytes[0] });
    }
    let expected = RTCM_HEADER_LEN + declared_length(bytes) + RTCM_CRC_LEN;
    if expected != bytes.len() {
        return Err(FrameError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let body_end = bytes.len() - RTCM_CRC_LEN;
    let computed = crc24q(&bytes[..body_end]);
    let transmitted = bytes[body_end..]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    if computed != transmitted {
        return Err(FrameError::CrcMismatch {
            computed,
            transmitted,
        });
    }
    Ok(BinaryFrame {
        bytes: bytes.to_vec(),
    })
}

/// Frame accounting counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameCounters {
    pub frames_decoded: u64,
    pub crc_failures: u64,
    /// Bytes dropped while hunting for a preamble
    pub bytes_skipped: u64,
}

/// Streaming RTCM3 frame extractor
///
/// Partial frames stay buffered until the remaining bytes arrive. A CRC
/// failure drops exactly one byte so a preamble hidden inside the rejected
/// span is still found.
#[derive(Debug, Default)]
pub struct BinaryFrameDecoder {
    buffer: Vec<u8>,
    counters: FrameCounters,
}

impl BinaryFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next valid frame, or `None` when more bytes are needed
    pub fn next_frame(&mut self) -> Option<BinaryFrame> {
        loop {
            match self.buffer.iter().position(|&b| b == RTCM_PREAMBLE) {
                Some(0) => {}
                Some(pos) => {
                    self.skip(pos);
                }
                None => {
                    let skipped = self.buffer.len();
                    self.skip(skipped);
                    return None;
                }
            }

            if self.buffer.len() < RTCM_HEADER_LEN {
                return None;
            }
            let length = declared_length(&self.buffer);
            let total = RTCM_HEADER_LEN + length + RTCM_CRC_LEN;
            if self.buffer.len() < total {
                return None;
            }

            match verify_frame(&self.buffer[..total]) {
                Ok(frame) => {
                    self.buffer.drain(..total);
                    self.counters.frames_decoded += 1;
                    return Some(frame);
                }
                Err(e) => {
                    tracing::debug!(error = %e, length, "Dropping byte after RTCM CRC failure");
                    self.counters.crc_failures += 1;
                    self.skip(1);
                }
            }
        }
    }

    /// Drain every complete frame currently buffered
    pub fn drain_frames(&mut self) -> Vec<BinaryFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    fn skip(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.counters.bytes_skipped += count as u64;
    }
}
