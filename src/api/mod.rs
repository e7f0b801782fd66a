//! Public pipeline API
//!
//! The [`Pipeline`] owns the receiver and correction loops; the shared
//! position snapshot and sentence filter it hands out are defined alongside.

pub mod filter;
pub mod pipeline;
pub mod state;
pub mod types;

pub use filter::MessageFilter;
pub use pipeline::Pipeline;
pub use state::PositionState;
pub use types::{
    ApiError, ApiResult, CorrectionStatus, LoopHealth, PipelineState, ReceiverStatus, SessionStatus,
};
