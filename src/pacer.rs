//! Global bid pacer: a sliding-window slot reservation limiter.
//!
//! Capacity is the fleet-wide bids-per-minute budget. Callers reserve a
//! slot before any bid-dependent I/O, consume it when a bid is accepted,
//! and release it on every other exit path. Slots are unique ids in a
//! map rather than positions in a ring: two reservations in the same
//! millisecond must not alias, and releasing one must not release another.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rand::Rng;

use crate::shutdown::Shutdown;

/// Sliding window length.
const WINDOW_MS: i64 = 60_000;

pub struct BidPacer {
    capacity: usize,
    window_ms: i64,
    start: Instant,
    state: Mutex<PacerState>,
    shutdown: Shutdown,
}

#[derive(Default)]
struct PacerState {
    /// slot id -> reservation timestamp (ms since pacer start).
    slots: HashMap<u64, i64>,
    /// Monotonic id source; slot 0 is never handed out.
    next_id: u64,
}

impl BidPacer {
    pub fn new(capacity: usize, shutdown: Shutdown) -> Self {
        Self::with_window_ms(capacity, WINDOW_MS, shutdown)
    }

    pub(crate) fn with_window_ms(capacity: usize, window_ms: i64, shutdown: Shutdown) -> Self {
        Self {
            capacity: capacity.max(1),
            window_ms,
            start: Instant::now(),
            state: Mutex::new(PacerState::default()),
            shutdown,
        }
    }

    fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots reserved within the current window. Diagnostic only.
    pub fn used(&self) -> usize {
        let now = self.now_ms();
        let state = self.state.lock();
        state
            .slots
            .values()
            .filter(|ts| now - **ts < self.window_ms)
            .count()
    }

    /// Block until a slot is free, then reserve it.
    ///
    /// Returns a unique positive slot id. Fails only on shutdown; the
    /// retry sleep happens without holding the state lock.
    pub async fn reserve_slot(&self) -> Result<u64> {
        loop {
            if self.shutdown.is_triggered() {
                bail!("pacer shutting down");
            }

            let wait_ms = {
                let mut state = self.state.lock();
                let now = self.now_ms();
                let window = self.window_ms;
                state.slots.retain(|_, ts| now - *ts < window);

                if state.slots.len() < self.capacity {
                    state.next_id += 1;
                    let id = state.next_id;
                    state.slots.insert(id, now);
                    return Ok(id);
                }

                let oldest = state.slots.values().copied().min().unwrap_or(now);
                (oldest + window - now).max(1)
            };

            let jitter = rand::thread_rng().gen_range(5..25);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis((wait_ms + jitter) as u64)) => {}
                _ = self.shutdown.wait() => bail!("pacer shutting down"),
            }
        }
    }

    /// Remove a slot immediately. Unknown ids (including 0) are a no-op.
    pub fn release_slot(&self, slot_id: u64) {
        self.state.lock().slots.remove(&slot_id);
    }
}
