//! Bid state store: what we have bid, where we are top, and what the
//! market looked like last fetch.
//!
//! The store exclusively owns the per-collection records; schedulers and
//! the counter-bid handler go through it and never touch the maps
//! directly. Mutations mark the store dirty and debounce a snapshot to
//! disk; shutdown forces a final synchronous write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::models::{BidRecord, CollectionBidRecord, Listing, OfferType, OurCollectionOffer};
use crate::shutdown::Shutdown;

/// Hard cap on tracked bids per collection.
pub const MAX_BIDS_PER_COLLECTION: usize = 500;

/// Bids expired longer ago than this are purged by cleanup.
pub const BID_HISTORY_MAX_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Debounce window between a mutation and the snapshot write.
pub const DEBOUNCE_MS: u64 = 15_000;

pub struct BidHistoryStore {
    path: PathBuf,
    debounce: Duration,
    records: Mutex<HashMap<String, CollectionBidRecord>>,
    dirty: AtomicBool,
    write_pending: Notify,
}

impl BidHistoryStore {
    /// Load the snapshot at `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with_debounce(path, Duration::from_millis(DEBOUNCE_MS))
    }

    pub(crate) fn load_with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self> {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt bid history {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self {
            path,
            debounce,
            records: Mutex::new(records),
            dirty: AtomicBool::new(false),
            write_pending: Notify::new(),
        })
    }

    /// Create the record for a collection if absent. Never overwrites:
    /// quantity, bids and top flags survive re-initialization.
    pub fn init(&self, collection_symbol: &str, offer_type: OfferType) {
        let mut records = self.records.lock();
        records
            .entry(collection_symbol.to_string())
            .or_insert_with(|| CollectionBidRecord::new(offer_type));
    }

    pub fn offer_type(&self, collection_symbol: &str) -> Option<OfferType> {
        self.records
            .lock()
            .get(collection_symbol)
            .map(|r| r.offer_type)
    }

    pub fn our_bids(&self, collection_symbol: &str) -> HashMap<String, BidRecord> {
        self.records
            .lock()
            .get(collection_symbol)
            .map(|r| r.our_bids.clone())
            .unwrap_or_default()
    }

    pub fn our_bid(&self, collection_symbol: &str, token_id: &str) -> Option<BidRecord> {
        self.records
            .lock()
            .get(collection_symbol)
            .and_then(|r| r.our_bids.get(token_id).cloned())
    }

    pub fn set_our_bid(&self, collection_symbol: &str, token_id: &str, bid: BidRecord) {
        {
            let mut records = self.records.lock();
            let record = records
                .entry(collection_symbol.to_string())
                .or_insert_with(|| CollectionBidRecord::new(OfferType::Item));
            record.our_bids.insert(token_id.to_string(), bid);
        }
        self.schedule_write();
    }

    /// Remove a bid and its top flag together so `top_bids` never points
    /// at a bid we no longer track.
    pub fn remove_our_bid(&self, collection_symbol: &str, token_id: &str) {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(collection_symbol) {
                record.our_bids.remove(token_id);
                record.top_bids.remove(token_id);
            }
        }
        self.schedule_write();
    }

    /// Flag a token as confirmed-top. Ignored when we have no bid there.
    pub fn mark_top(&self, collection_symbol: &str, token_id: &str) {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(collection_symbol) {
                if record.our_bids.contains_key(token_id) {
                    record.top_bids.insert(token_id.to_string());
                }
            }
        }
        self.schedule_write();
    }

    pub fn clear_top(&self, collection_symbol: &str, token_id: &str) {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(collection_symbol) {
                record.top_bids.remove(token_id);
            }
        }
        self.schedule_write();
    }

    pub fn is_top(&self, collection_symbol: &str, token_id: &str) -> bool {
        self.records
            .lock()
            .get(collection_symbol)
            .map(|r| r.top_bids.contains(token_id))
            .unwrap_or(false)
    }

    /// Atomic swap of the cheapest-listings snapshot.
    pub fn set_bottom_listings(&self, collection_symbol: &str, listings: Vec<Listing>) {
        {
            let mut records = self.records.lock();
            let record = records
                .entry(collection_symbol.to_string())
                .or_insert_with(|| CollectionBidRecord::new(OfferType::Item));
            record.bottom_listings = listings;
        }
        self.schedule_write();
    }

    pub fn bottom_listings(&self, collection_symbol: &str) -> Vec<Listing> {
        self.records
            .lock()
            .get(collection_symbol)
            .map(|r| r.bottom_listings.clone())
            .unwrap_or_default()
    }

    pub fn touch_activity(&self, collection_symbol: &str) {
        let now = Utc::now().timestamp_millis();
        {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(collection_symbol) else {
                return;
            };
            record.last_seen_activity = Some(now);
        }
        self.schedule_write();
    }

    pub fn quantity(&self, collection_symbol: &str) -> u64 {
        self.records
            .lock()
            .get(collection_symbol)
            .map(|r| r.quantity)
            .unwrap_or(0)
    }

    /// Bump the items-won counter. Callers hold the collection's
    /// quantity lock; the store only applies the increment.
    pub fn increment_quantity(&self, collection_symbol: &str) -> u64 {
        let value = {
            let mut records = self.records.lock();
            let record = records
                .entry(collection_symbol.to_string())
                .or_insert_with(|| CollectionBidRecord::new(OfferType::Item));
            record.quantity += 1;
            record.quantity
        };
        self.schedule_write();
        value
    }

    pub fn collection_offer(&self, collection_symbol: &str) -> Option<OurCollectionOffer> {
        self.records
            .lock()
            .get(collection_symbol)
            .and_then(|r| r.highest_collection_offer.clone())
    }

    pub fn set_collection_offer(&self, collection_symbol: &str, offer: OurCollectionOffer) {
        {
            let mut records = self.records.lock();
            let record = records
                .entry(collection_symbol.to_string())
                .or_insert_with(|| CollectionBidRecord::new(OfferType::Collection));
            record.highest_collection_offer = Some(offer);
        }
        self.schedule_write();
    }

    pub fn clear_collection_offer(&self, collection_symbol: &str) {
        {
            let mut records = self.records.lock();
            if let Some(record) = records.get_mut(collection_symbol) {
                record.highest_collection_offer = None;
            }
        }
        self.schedule_write();
    }

    /// Full clone for the status endpoint.
    pub fn snapshot(&self) -> HashMap<String, CollectionBidRecord> {
        self.records.lock().clone()
    }

    pub fn active_bid_count(&self) -> usize {
        self.records.lock().values().map(|r| r.our_bids.len()).sum()
    }

    /// One maintenance pass: purge long-expired bids, trim oversized
    /// collections to the newest expirations, drop records that hold
    /// nothing worth remembering. Returns (expired, trimmed).
    pub fn cleanup(&self) -> (usize, usize) {
        let now = Utc::now().timestamp_millis();
        let mut expired = 0usize;
        let mut trimmed = 0usize;

        {
            let mut records = self.records.lock();
            for record in records.values_mut() {
                let cutoff = now - BID_HISTORY_MAX_AGE_MS;
                let stale: Vec<String> = record
                    .our_bids
                    .iter()
                    .filter(|(_, bid)| bid.expiration < cutoff)
                    .map(|(token, _)| token.clone())
                    .collect();
                for token in stale {
                    record.our_bids.remove(&token);
                    record.top_bids.remove(&token);
                    expired += 1;
                }

                if record.our_bids.len() > MAX_BIDS_PER_COLLECTION {
                    let mut by_expiration: Vec<(String, i64)> = record
                        .our_bids
                        .iter()
                        .map(|(token, bid)| (token.clone(), bid.expiration))
                        .collect();
                    // Keep the entries expiring latest.
                    by_expiration.sort_by(|a, b| b.1.cmp(&a.1));
                    for (token, _) in by_expiration.split_off(MAX_BIDS_PER_COLLECTION) {
                        record.our_bids.remove(&token);
                        record.top_bids.remove(&token);
                        trimmed += 1;
                    }
                }
            }

            records.retain(|_, r| {
                !r.our_bids.is_empty()
                    || r.quantity > 0
                    || r.highest_collection_offer.is_some()
                    || !r.bottom_listings.is_empty()
            });
        }

        if expired > 0 || trimmed > 0 {
            debug!(expired, trimmed, "bid history cleanup pass");
            self.schedule_write();
        }
        (expired, trimmed)
    }

    /// Mark dirty and nudge the debounced writer.
    pub fn schedule_write(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.write_pending.notify_one();
    }

    /// Flush synchronously, bypassing the debounce. Used at shutdown.
    pub fn force_write(&self) -> Result<()> {
        self.dirty.store(false, Ordering::SeqCst);
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> Result<()> {
        let json = {
            let records = self.records.lock();
            serde_json::to_vec_pretty(&*records).context("failed to serialize bid history")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // Write-then-rename so a crash mid-write never corrupts the
        // last good snapshot.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move snapshot into {}", self.path.display()))?;
        Ok(())
    }

    /// Debounced persistence loop. Runs until shutdown; the final flush
    /// is the caller's `force_write`.
    pub async fn run_writer(self: Arc<Self>, shutdown: Shutdown) {
        info!(path = %self.path.display(), "bid history writer started");
        loop {
            tokio::select! {
                _ = self.write_pending.notified() => {}
                _ = shutdown.wait() => return,
            }

            // Coalesce: wait out the debounce window before writing so a
            // burst of mutations becomes one snapshot.
            tokio::select! {
                _ = tokio::time::sleep(self.debounce) => {}
                _ = shutdown.wait() => return,
            }

            if self.dirty.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.write_snapshot() {
                    warn!(error = %e, "bid history write failed");
                    self.dirty.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
