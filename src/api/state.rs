//! Shared position snapshot

use crate::core::PositionFix;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Latest position fix, written by the receiver loop and copied out by readers
#[derive(Debug, Default)]
pub struct PositionState {
    fix: RwLock<PositionFix>,
    updates: AtomicU64,
}

impl PositionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new snapshot, replacing the previous one wholesale
    pub fn replace(&self, fix: PositionFix) {
        let mut guard = self.fix.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = fix;
        self.updates.fetch_add(1, Ordering::Release);
    }

    /// Copy of the current snapshot
    pub fn read(&self) -> PositionFix {
        *self.fix.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshots published since creation
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}
