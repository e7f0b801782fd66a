//! Correction-service networking

pub mod backoff;
pub mod ntrip;

pub use backoff::{Backoff, BackoffPolicy};
pub use ntrip::{
    ClientState, CorrectionConfig, CorrectionSink, NtripClient, NtripError, NtripSession, NtripVersion,
};
