//! Atomic counters surfaced through `/api/stats`.
//!
//! Counters never affect behavior; handlers bump them and move on.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bid-side statistics.
#[derive(Debug, Default)]
pub struct BidStats {
    pub bids_placed: AtomicU64,
    pub counter_bids_placed: AtomicU64,
    pub bids_cancelled: AtomicU64,
    pub skipped_already_top: AtomicU64,
    pub skipped_wallet_exhausted: AtomicU64,
    pub skipped_recent_bid: AtomicU64,
    pub safety_gate_rejections: AtomicU64,
    pub items_won: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidStatsSnapshot {
    pub bids_placed: u64,
    pub counter_bids_placed: u64,
    pub bids_cancelled: u64,
    pub skipped_already_top: u64,
    pub skipped_wallet_exhausted: u64,
    pub skipped_recent_bid: u64,
    pub safety_gate_rejections: u64,
    pub items_won: u64,
    pub errors: u64,
}

impl BidStats {
    pub fn snapshot(&self) -> BidStatsSnapshot {
        BidStatsSnapshot {
            bids_placed: self.bids_placed.load(Ordering::Relaxed),
            counter_bids_placed: self.counter_bids_placed.load(Ordering::Relaxed),
            bids_cancelled: self.bids_cancelled.load(Ordering::Relaxed),
            skipped_already_top: self.skipped_already_top.load(Ordering::Relaxed),
            skipped_wallet_exhausted: self.skipped_wallet_exhausted.load(Ordering::Relaxed),
            skipped_recent_bid: self.skipped_recent_bid.load(Ordering::Relaxed),
            safety_gate_rejections: self.safety_gate_rejections.load(Ordering::Relaxed),
            items_won: self.items_won.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Event-pipeline statistics (intake filters and queue policy).
#[derive(Debug, Default)]
pub struct EventStats {
    pub received: AtomicU64,
    pub invalid_frames: AtomicU64,
    pub startup_discarded: AtomicU64,
    pub unknown_kind: AtomicU64,
    pub unknown_collection: AtomicU64,
    pub own_wallet_skipped: AtomicU64,
    pub deduplicated: AtomicU64,
    pub superseded: AtomicU64,
    pub overflow_dropped: AtomicU64,
    pub processed: AtomicU64,
    pub handler_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStatsSnapshot {
    pub received: u64,
    pub invalid_frames: u64,
    pub startup_discarded: u64,
    pub unknown_kind: u64,
    pub unknown_collection: u64,
    pub own_wallet_skipped: u64,
    pub deduplicated: u64,
    pub superseded: u64,
    pub overflow_dropped: u64,
    pub processed: u64,
    pub handler_errors: u64,
}

impl EventStats {
    pub fn snapshot(&self) -> EventStatsSnapshot {
        EventStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            startup_discarded: self.startup_discarded.load(Ordering::Relaxed),
            unknown_kind: self.unknown_kind.load(Ordering::Relaxed),
            unknown_collection: self.unknown_collection.load(Ordering::Relaxed),
            own_wallet_skipped: self.own_wallet_skipped.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            overflow_dropped: self.overflow_dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
