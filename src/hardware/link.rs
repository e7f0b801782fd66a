//! Receiver channel trait, configuration and the relay write path

use crate::hardware::{CommError, CommResult};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Receiver;

/// Duplex byte channel to a GNSS receiver
pub trait ReceiverChannel: Send {
    /// Read available bytes into `buf`.
    ///
    /// Returns `Ok(0)` when the read timeout elapsed without data.
    fn read_bytes(&mut self, buf: &mut [u8]) -> CommResult<usize>;

    /// Write a prefix of `data` to the receiver.
    ///
    /// Returns the number of bytes accepted; `Ok(0)` when the receiver took
    /// nothing before the timeout elapsed.
    fn write_bytes(&mut self, data: &[u8]) -> CommResult<usize>;

    /// Human-readable channel name for logs and status
    fn name(&self) -> &str;
}

/// Serial receiver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Bound on a single blocking read; also the stop-flag polling interval
    pub read_timeout_ms: u64,
}

impl ReceiverConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> CommResult<()> {
        if self.port.trim().is_empty() {
            return Err(CommError::ConfigurationError {
                parameter: "port".to_string(),
                value: self.port.clone(),
            });
        }
        if self.baud_rate == 0 {
            return Err(CommError::ConfigurationError {
                parameter: "baud_rate".to_string(),
                value: self.baud_rate.to_string(),
            });
        }
        if self.read_timeout_ms == 0 || self.read_timeout_ms > 5_000 {
            return Err(CommError::ConfigurationError {
                parameter: "read_timeout_ms".to_string(),
                value: self.read_timeout_ms.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            read_timeout_ms: 100,
        }
    }
}

/// Relay bytes written per [`ReceiverLink::flush_relay`] call by default
pub const DEFAULT_WRITE_SLICE: usize = 256;

/// Receiver side of the pipeline: the channel plus the relay queue consumer
pub struct ReceiverLink {
    channel: Box<dyn ReceiverChannel>,
    relay: Receiver<Vec<u8>>,
    /// Unwritten tail of the chunk currently being relayed
    pending: Vec<u8>,
    write_slice: usize,
    bytes_read: u64,
    bytes_relayed: u64,
}

impl ReceiverLink {
    pub fn new(channel: Box<dyn ReceiverChannel>, relay: Receiver<Vec<u8>>) -> Self {
        Self {
            channel,
            relay,
            pending: Vec::new(),
            write_slice: DEFAULT_WRITE_SLICE,
            bytes_read: 0,
            bytes_relayed: 0,
        }
    }

    /// Bound the relay bytes written between two reads
    pub fn with_write_slice(mut self, write_slice: usize) -> Self {
        self.write_slice = write_slice.max(1);
        self
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Read one chunk from the receiver; `Ok(0)` on timeout
    pub fn read(&mut self, buf: &mut [u8]) -> CommResult<usize> {
        let n = self.channel.read_bytes(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }

    /// Write up to one slice of queued correction bytes, in arrival order.
    ///
    /// Returns the number of bytes written. A receiver that accepts nothing
    /// leaves the bytes queued; the bounded relay queue then fills and the
    /// correction side drops new chunks. A disconnected queue is not an error.
    pub fn flush_relay(&mut self) -> CommResult<usize> {
        let mut written = 0;
        while written < self.write_slice {
            if self.pending.is_empty() {
                match self.relay.try_recv() {
                    Ok(chunk) => self.pending = chunk,
                    Err(_) => break,
                }
                if self.pending.is_empty() {
                    continue;
                }
            }
            let end = self.pending.len().min(self.write_slice - written);
            let accepted = self.channel.write_bytes(&self.pending[..end])?;
            if accepted == 0 {
                break;
            }
            self.pending.drain(..accepted);
            written += accepted;
        }
        self.bytes_relayed += written as u64;
        Ok(written)
    }

    /// Relay bytes taken off the queue but not yet accepted by the receiver
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed
    }
}
