// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall-clock source for result record timestamps.
//!
//! Deadlines are measured with tokio's monotonic clock; this trait only
//! supplies the epoch timestamps written into a `ResultRecord`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in epoch milliseconds
pub trait Clock: Clone + Send + Sync + 'static {
    fn epoch_ms(&self) -> u64;
}

/// Real system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_ms(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }
}

/// Controllable clock for tests.
///
/// Reads can optionally step the clock by a fixed amount, which lets tests
/// observe distinct start and stop timestamps without sleeping. Setting the
/// value backwards simulates a wall-clock adjustment mid-dispatch.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockState>>,
}

struct FakeClockState {
    epoch_ms: u64,
    step_ms: u64,
}

impl FakeClock {
    pub fn new(epoch_ms: u64) -> Self {
        Self { inner: Arc::new(Mutex::new(FakeClockState { epoch_ms, step_ms: 0 })) }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        self.inner.lock().epoch_ms += duration.as_millis() as u64;
    }

    /// Set the current epoch milliseconds (may move backwards)
    pub fn set_epoch_ms(&self, ms: u64) {
        self.inner.lock().epoch_ms = ms;
    }

    /// Advance by `step` after every read
    pub fn step_on_read(&self, step: Duration) {
        self.inner.lock().step_ms = step.as_millis() as u64;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

impl Clock for FakeClock {
    fn epoch_ms(&self) -> u64 {
        let mut state = self.inner.lock();
        let now = state.epoch_ms;
        state.epoch_ms += state.step_ms;
        now
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
