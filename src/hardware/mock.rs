//! In-memory receiver channel for testing and development

use crate::hardware::{CommError, CommResult, ReceiverChannel};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    write_calls: usize,
    closed: bool,
    read_fault: Option<String>,
    write_fault: Option<String>,
    writes_stalled: bool,
}

/// Mock receiver channel
///
/// Bytes fed through a [`MockHandle`] are returned by `read_bytes` one chunk
/// at a time; an idle read sleeps for the configured timeout and returns 0.
pub struct MockChannel {
    name: String,
    state: Arc<Mutex<MockState>>,
    read_timeout: Duration,
}

/// Test-side handle onto a [`MockChannel`] that stays usable after the
/// channel has moved into a worker thread
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
            read_timeout: Duration::from_millis(5),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl MockHandle {
    /// Queue bytes for the next read
    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.state).inbound.push_back(bytes.to_vec());
    }

    /// Everything written to the channel so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn write_calls(&self) -> usize {
        lock(&self.state).write_calls
    }

    /// Chunks fed but not yet read
    pub fn pending_chunks(&self) -> usize {
        lock(&self.state).inbound.len()
    }

    /// Simulate the device disappearing once queued input is consumed
    pub fn close(&self) {
        lock(&self.state).closed = true;
    }

    /// Fail the next read with an I/O error
    pub fn fail_reads(&self, details: &str) {
        lock(&self.state).read_fault = Some(details.to_string());
    }

    /// Make writes accept nothing, as a receiver that stopped draining its input
    pub fn stall_writes(&self, stalled: bool) {
        lock(&self.state).writes_stalled = stalled;
    }

    /// Fail every write with an I/O error
    pub fn fail_writes(&self, details: &str) {
        lock(&self.state).write_fault = Some(details.to_string());
    }
}

impl ReceiverChannel for MockChannel {
    fn read_bytes(&mut self, buf: &mut [u8]) -> CommResult<usize> {
        {
            let mut state = lock(&self.state);
            if let Some(details) = state.read_fault.take() {
                return Err(CommError::Io {
                    operation: "read".to_string(),
                    details,
                });
            }
            if let Some(mut chunk) = state.inbound.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    state.inbound.push_front(chunk.split_off(n));
                }
                return Ok(n);
            }
            if state.closed {
                return Err(CommError::ConnectionLost {
                    channel: self.name.clone(),
                });
            }
        }
        std::thread::sleep(self.read_timeout);
        Ok(0)
    }

    fn write_bytes(&mut self, data: &[u8]) -> CommResult<usize> {
        let mut state = lock(&self.state);
        if let Some(details) = &state.write_fault {
            return Err(CommError::Io {
                operation: "write".to_string(),
                details: details.clone(),
            });
        }
        state.write_calls += 1;
        if state.writes_stalled {
            return Ok(0);
        }
        state.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
