//! Hardware abstraction layer for the GNSS receiver link
//!
//! The receiver is reached through the [`ReceiverChannel`] trait: a serial
//! port in production, an in-memory mock in tests.

pub mod error;
pub mod link;
pub mod mock;
pub mod serial;

pub use error::{CommError, CommResult};
pub use link::{ReceiverChannel, ReceiverConfig, ReceiverLink};
pub use mock::{MockChannel, MockHandle};
pub use serial::SerialChannel;
