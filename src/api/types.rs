//! Common API types and data structures

use crate::core::SentenceType;
use crate::hardware::CommError;
use crate::network::{ClientState, NtripError};
use crate::processing::{CorrectionStats, FrameCounters, SentenceCounters};
use crate::utils::ConfigError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// Receiver channel error
    #[error("receiver error: {error}")]
    HardwareError {
        #[from]
        error: CommError,
    },
    /// Correction-service error
    #[error("correction service error: {error}")]
    CorrectionError {
        #[from]
        error: NtripError,
    },
    /// Invalid configuration
    #[error("configuration error: {error}")]
    ConfigurationError {
        #[from]
        error: ConfigError,
    },
    /// A component must be configured before the operation
    #[error("{component} is not configured")]
    NotConfigured { component: String },
    /// Operation not allowed in the current pipeline state
    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        operation: String,
        state: PipelineState,
    },
    /// Tag that names no supported sentence type
    #[error("unsupported sentence type '{tag}'")]
    UnknownSentenceType { tag: String },
    /// Session stopped after a fatal fault
    #[error("session failed: {reason}")]
    SessionFailed { reason: String },
    /// Worker thread could not be started
    #[error("internal error: {details}")]
    Internal { details: String },
}

/// Pipeline lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PipelineState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    /// A fatal receiver fault ended the session
    Failed,
}

impl PipelineState {
    /// Whether configuration and start are allowed
    pub fn is_stopped(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Failed)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Health of one worker loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LoopHealth {
    #[default]
    Idle,
    Running,
    /// Waiting out a backoff delay before reconnecting
    Reconnecting,
    Failed,
}

/// Receiver loop status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReceiverStatus {
    pub health: LoopHealth,
    pub channel: Option<String>,
    pub bytes_read: u64,
    /// Correction bytes written to the receiver
    pub bytes_relayed: u64,
    pub sentences: SentenceCounters,
    pub position_updates: u64,
}

/// Correction loop status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionStatus {
    pub client_state: ClientState,
    pub health: LoopHealth,
    /// Reconnect attempts scheduled over the whole session
    pub reconnects: u64,
    /// Consecutive retries since the last successful connection
    pub current_attempt: u32,
    pub bytes_received: u64,
    pub chunks_relayed: u64,
    /// Chunks discarded because the relay queue was full
    pub chunks_dropped: u64,
    pub bytes_dropped: u64,
    pub frames: FrameCounters,
    pub messages: CorrectionStats,
    pub last_error: Option<String>,
}

/// Aggregated session status
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: PipelineState,
    pub receiver: ReceiverStatus,
    /// Absent when no correction service is configured
    pub correction: Option<CorrectionStatus>,
    pub enabled_sentences: Vec<SentenceType>,
    /// Detail of the fault that failed the session
    pub last_error: Option<String>,
}

impl SessionStatus {
    /// Serialize the status as a JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let comm = CommError::ConnectionLost {
            channel: "COM3".to_string(),
        };
        let api: ApiError = comm.clone().into();
        assert_eq!(api, ApiError::HardwareError { error: comm });
        assert_eq!(api.to_string(), "receiver error: connection lost to receiver COM3");

        let api: ApiError = NtripError::ConnectionClosed.into();
        assert!(matches!(api, ApiError::CorrectionError { .. }));
    }

    #[test]
    fn test_state_display() {
        let err = ApiError::InvalidState {
            operation: "configure receiver".to_string(),
            state: PipelineState::Running,
        };
        assert_eq!(err.to_string(), "cannot configure receiver while pipeline is running");
        assert!(PipelineState::Failed.is_stopped());
        assert!(!PipelineState::Stopping.is_stopped());
    }

    #[test]
    fn test_status_json() {
        let status = SessionStatus::default();
        let json = status.to_json().unwrap();
        assert!(json.contains("\"state\":\"Idle\""));
        assert!(json.contains("\"correction\":null"));
    }
}
