//! RTK Positioning Pipeline
//!
//! Bridges a GNSS receiver and an NTRIP correction caster: decodes the
//! receiver's NMEA position sentences into a shared fix, relays RTCM3
//! correction bytes back to the receiver and uploads GGA reports to the caster.

pub mod core;
pub mod processing;
pub mod network;
pub mod hardware;
pub mod api;
pub mod utils;

// Re-export commonly used types
pub use core::{FilterSet, FixQuality, PositionFix, SentenceType};
pub use processing::{BinaryFrame, BinaryFrameDecoder, SentenceDecoder, SentenceOutcome};
pub use network::{BackoffPolicy, CorrectionConfig, NtripClient, NtripError, NtripVersion};
pub use hardware::{CommError, CommResult, MockChannel, ReceiverChannel, ReceiverConfig, SerialChannel};
pub use api::{ApiError, ApiResult, Pipeline, PipelineState, SessionStatus};
pub use utils::{init_logging, ConfigError, PipelineConfig};
