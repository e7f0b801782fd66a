//! Reconnect backoff policy

use crate::network::NtripError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Granularity at which sleeps observe the stop flag
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn validate(&self) -> Result<(), NtripError> {
        if self.initial_ms == 0 {
            return Err(NtripError::configuration("backoff.initial_ms", self.initial_ms));
        }
        if self.max_ms < self.initial_ms {
            return Err(NtripError::configuration("backoff.max_ms", self.max_ms));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(NtripError::configuration("backoff.multiplier", self.multiplier));
        }
        Ok(())
    }
}

/// Backoff state for one reconnect sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    next_ms: u64,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        let next_ms = policy.initial_ms;
        Self {
            policy,
            next_ms,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; grows the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_ms;
        let grown = (self.next_ms as f64 * self.policy.multiplier).round() as u64;
        self.next_ms = grown.clamp(self.policy.initial_ms, self.policy.max_ms);
        self.attempts += 1;
        Duration::from_millis(delay)
    }

    /// Back to the initial delay after a successful session
    pub fn reset(&mut self) {
        self.next_ms = self.policy.initial_ms;
        self.attempts = 0;
    }

    /// Retries scheduled since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Sleep for `duration` in short slices; returns `false` if `stop` was raised.
pub fn sleep_interruptible(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
