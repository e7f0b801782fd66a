//! Stream framing and decoding for receiver and correction data

pub mod frame;
pub mod rtcm;
pub mod sentence;

pub use frame::{BinaryFrame, BinaryFrameDecoder, FrameCounters, FrameError};
pub use rtcm::{CorrectionMessage, CorrectionStats, RtcmError, StationPosition};
pub use sentence::{SentenceCounters, SentenceDecoder, SentenceError, SentenceOutcome};
