//! Scheduled bidding cycles, one independent loop per collection.
//!
//! A ticker per collection submits cycle work into the shared queue;
//! the `ScheduledRunning` set keeps the same collection from
//! overlapping itself while different collections proceed in parallel.
//! Scheduled bids always reserve a pacer slot before any decision I/O
//! and release it on every path that does not place a bid.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::BidContext;
use crate::events::EventManager;
use crate::marketplace::{ItemOfferRequest, PlaceOutcome};
use crate::models::{BidRecord, CollectionConfig, OfferType, OurCollectionOffer};
use crate::pricing::{self, PriceLimits};
use crate::shutdown::Shutdown;
use crate::stats::inc;

/// Do not re-bid a token this soon after our last bid on it.
pub const RECENT_BID_COOLDOWN_MS: i64 = 30_000;

/// Size cap for the recent-bids cache.
pub const MAX_RECENT_BIDS_SIZE: usize = 1_000;

/// How many cheapest listings one cycle works with.
const LISTINGS_FETCH_LIMIT: usize = 20;

/// Insertion-ordered, size-capped set of recently bid tokens.
pub struct RecentBids {
    cap: usize,
    order: VecDeque<String>,
    seen: HashMap<String, i64>,
}

impl RecentBids {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            seen: HashMap::new(),
        }
    }

    pub fn insert(&mut self, token_id: &str, now_ms: i64) {
        if self.seen.insert(token_id.to_string(), now_ms).is_some() {
            self.order.retain(|t| t != token_id);
        }
        self.order.push_back(token_id.to_string());

        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
    }

    pub fn contains_within(&self, token_id: &str, now_ms: i64, cooldown_ms: i64) -> bool {
        self.seen
            .get(token_id)
            .map(|at| now_ms - *at < cooldown_ms)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Collections with a cycle currently executing. A set of symbols, not
/// a global flag: collections never block each other.
#[derive(Default)]
pub struct ScheduledRunning(Mutex<HashSet<String>>);

impl ScheduledRunning {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the caller took the cycle; false when one is running.
    pub fn try_enter(&self, collection_symbol: &str) -> bool {
        self.0.lock().insert(collection_symbol.to_string())
    }

    pub fn leave(&self, collection_symbol: &str) {
        self.0.lock().remove(collection_symbol);
    }

    pub fn contains(&self, collection_symbol: &str) -> bool {
        self.0.lock().contains(collection_symbol)
    }
}

pub struct CollectionScheduler {
    cfg: CollectionConfig,
    ctx: BidContext,
    running: Arc<ScheduledRunning>,
    recent_bids: Mutex<RecentBids>,
}

/// Outcome summary of one cycle, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub successful_bids: usize,
    pub skipped_wallet_exhausted: usize,
    pub skipped_recent: usize,
    pub wallet_exhausted: bool,
}

impl CollectionScheduler {
    pub fn new(cfg: CollectionConfig, ctx: BidContext, running: Arc<ScheduledRunning>) -> Self {
        Self {
            cfg,
            ctx,
            running,
            recent_bids: Mutex::new(RecentBids::new(MAX_RECENT_BIDS_SIZE)),
        }
    }

    pub fn collection_symbol(&self) -> &str {
        &self.cfg.collection_symbol
    }

    /// Execute one cycle. Skips immediately when this collection is
    /// already mid-cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let symbol = self.cfg.collection_symbol.clone();
        if !self.running.try_enter(&symbol) {
            debug!(symbol = %symbol, "cycle already running, skipping");
            return Ok(CycleReport::default());
        }

        let result = self.cycle_inner(&symbol).await;
        self.running.leave(&symbol);

        match &result {
            Ok(report) => {
                debug!(
                    symbol = %symbol,
                    bids = report.successful_bids,
                    skipped_exhausted = report.skipped_wallet_exhausted,
                    "cycle complete"
                );
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "cycle failed"),
        }
        result
    }

    async fn cycle_inner(&self, symbol: &str) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        // Collections that hit their items-won cap stop bidding.
        let won = self.ctx.history.quantity(symbol);
        if won >= self.cfg.quantity {
            debug!(symbol, won, cap = self.cfg.quantity, "quantity cap reached");
            return Ok(report);
        }

        let floor = self
            .ctx
            .marketplace
            .floor_price(symbol)
            .await
            .context("floor price fetch failed")?;
        let limits = PriceLimits::for_collection(&self.cfg, floor);

        match self.cfg.offer_type {
            OfferType::Item => {
                let fetch = LISTINGS_FETCH_LIMIT.max(self.cfg.bid_count);
                let mut listings = self
                    .ctx
                    .marketplace
                    .cheapest_listings(symbol, fetch)
                    .await
                    .context("listings fetch failed")?;
                listings.sort_by_key(|l| l.price);
                self.ctx.history.set_bottom_listings(symbol, listings.clone());

                for listing in &listings {
                    if report.successful_bids >= self.cfg.bid_count {
                        break;
                    }
                    if self.ctx.shutdown.is_triggered() {
                        break;
                    }
                    if report.wallet_exhausted {
                        report.skipped_wallet_exhausted += 1;
                        inc(&self.ctx.bid_stats.skipped_wallet_exhausted);
                        continue;
                    }

                    let now = Utc::now().timestamp_millis();
                    if self.recent_bids.lock().contains_within(
                        &listing.id,
                        now,
                        RECENT_BID_COOLDOWN_MS,
                    ) {
                        report.skipped_recent += 1;
                        inc(&self.ctx.bid_stats.skipped_recent_bid);
                        continue;
                    }

                    self.bid_on_token(symbol, &listing.id, floor, &limits, &mut report)
                        .await;
                }
            }
            OfferType::Collection => {
                self.bid_on_collection(symbol, floor, &limits, &mut report)
                    .await;
            }
        }

        Ok(report)
    }

    /// One token: reserve slot, lock token, decide, bid or release.
    async fn bid_on_token(
        &self,
        symbol: &str,
        token_id: &str,
        floor: u64,
        limits: &PriceLimits,
        report: &mut CycleReport,
    ) {
        // Reserve before any decision I/O; consumption is explicit.
        let slot_id = match self.ctx.pacer.reserve_slot().await {
            Ok(id) => id,
            Err(_) => return, // shutdown
        };
        let mut slot_consumed = false;

        if !self.ctx.token_locks.acquire(token_id).await {
            self.ctx.pacer.release_slot(slot_id);
            return;
        }

        self.evaluate_and_bid(symbol, token_id, floor, limits, report, &mut slot_consumed)
            .await;

        self.ctx.token_locks.release(token_id);
        if !slot_consumed && slot_id > 0 {
            self.ctx.pacer.release_slot(slot_id);
        }
    }

    async fn evaluate_and_bid(
        &self,
        symbol: &str,
        token_id: &str,
        floor: u64,
        limits: &PriceLimits,
        report: &mut CycleReport,
        slot_consumed: &mut bool,
    ) {
        let best = match self.ctx.marketplace.best_token_offer(token_id).await {
            Ok(best) => best,
            Err(e) => {
                inc(&self.ctx.bid_stats.errors);
                warn!(token_id, error = %e, "best offer fetch failed");
                return;
            }
        };

        let bid_price = match &best {
            Some(offer) if self.ctx.wallets.owns_address(&offer.buyer_payment_address) => {
                // We already top this token.
                self.ctx.history.mark_top(symbol, token_id);
                inc(&self.ctx.bid_stats.skipped_already_top);
                return;
            }
            Some(offer) => pricing::outbid_price(offer.price, &self.cfg).max(limits.min_offer),
            None => limits.min_offer,
        };

        if let Err(rejection) = pricing::check_bid(&self.cfg, bid_price, floor, limits) {
            inc(&self.ctx.bid_stats.safety_gate_rejections);
            warn!(token_id, %rejection, "bid rejected by safety gate");
            return;
        }

        let pool = self.ctx.wallets.pool_for(symbol);
        let Some(wallet) = pool.acquire() else {
            self.note_wallet_exhausted(symbol, report);
            return;
        };

        let request = ItemOfferRequest {
            token_id: token_id.to_string(),
            collection_symbol: symbol.to_string(),
            price: bid_price,
            expiration_ms: BidContext::expiration_ms(self.cfg.duration),
            receive_address: self.ctx.receive_policy.receive_address(&wallet),
            wallet,
            fee_sats_per_vbyte: self.cfg.fee_sats_per_vbyte,
        };

        match self.ctx.marketplace.place_item_offer(&request).await {
            Ok(PlaceOutcome::Placed(offer)) => {
                *slot_consumed = true;
                self.ctx.history.set_our_bid(
                    symbol,
                    token_id,
                    BidRecord {
                        price: offer.price,
                        expiration: offer.expiration_ms,
                        payment_address: offer.payment_address,
                    },
                );
                self.recent_bids
                    .lock()
                    .insert(token_id, Utc::now().timestamp_millis());
                report.successful_bids += 1;
                inc(&self.ctx.bid_stats.bids_placed);
            }
            Ok(PlaceOutcome::WalletExhausted) => {
                self.ctx
                    .wallets
                    .disable_for_window(&request.wallet.payment_address);
                self.note_wallet_exhausted(symbol, report);
            }
            Err(e) => {
                self.ctx
                    .wallets
                    .decrement_bid_count(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.errors);
                warn!(token_id, error = %e, "item offer failed");
            }
        }
    }

    async fn bid_on_collection(
        &self,
        symbol: &str,
        floor: u64,
        limits: &PriceLimits,
        report: &mut CycleReport,
    ) {
        let slot_id = match self.ctx.pacer.reserve_slot().await {
            Ok(id) => id,
            Err(_) => return,
        };
        let mut slot_consumed = false;

        self.evaluate_collection_offer(symbol, floor, limits, report, &mut slot_consumed)
            .await;

        if !slot_consumed && slot_id > 0 {
            self.ctx.pacer.release_slot(slot_id);
        }
    }

    async fn evaluate_collection_offer(
        &self,
        symbol: &str,
        floor: u64,
        limits: &PriceLimits,
        report: &mut CycleReport,
        slot_consumed: &mut bool,
    ) {
        let best = match self.ctx.marketplace.best_collection_offer(symbol).await {
            Ok(best) => best,
            Err(e) => {
                inc(&self.ctx.bid_stats.errors);
                warn!(symbol, error = %e, "collection offer fetch failed");
                return;
            }
        };

        let bid_price = match &best {
            Some(offer)
                if offer
                    .buyer_payment_address
                    .as_deref()
                    .map(|a| self.ctx.wallets.owns_address(a))
                    .unwrap_or(false) =>
            {
                inc(&self.ctx.bid_stats.skipped_already_top);
                return;
            }
            Some(offer) => pricing::outbid_price(offer.price, &self.cfg).max(limits.min_offer),
            None => limits.min_offer,
        };

        // An equal-or-better standing offer of ours needs no refresh.
        if let Some(current) = self.ctx.history.collection_offer(symbol) {
            if current.price >= bid_price {
                return;
            }
        }

        if let Err(rejection) = pricing::check_bid(&self.cfg, bid_price, floor, limits) {
            inc(&self.ctx.bid_stats.safety_gate_rejections);
            warn!(symbol, %rejection, "collection bid rejected by safety gate");
            return;
        }

        let pool = self.ctx.wallets.pool_for(symbol);
        let Some(wallet) = pool.acquire() else {
            self.note_wallet_exhausted(symbol, report);
            return;
        };

        let request = crate::marketplace::CollectionOfferRequest {
            collection_symbol: symbol.to_string(),
            price: bid_price,
            expiration_ms: BidContext::expiration_ms(self.cfg.duration),
            receive_address: self.ctx.receive_policy.receive_address(&wallet),
            wallet,
            fee_sats_per_vbyte: self.cfg.fee_sats_per_vbyte,
            existing_offer_id: self
                .ctx
                .history
                .collection_offer(symbol)
                .and_then(|o| o.offer_id),
        };

        match self.ctx.marketplace.place_collection_offer(&request).await {
            Ok(PlaceOutcome::Placed(offer)) => {
                *slot_consumed = true;
                self.ctx.history.set_collection_offer(
                    symbol,
                    OurCollectionOffer {
                        price: offer.price,
                        expiration: offer.expiration_ms,
                        payment_address: offer.payment_address,
                        offer_id: offer.offer_id,
                    },
                );
                report.successful_bids += 1;
                inc(&self.ctx.bid_stats.bids_placed);
            }
            Ok(PlaceOutcome::WalletExhausted) => {
                self.ctx
                    .wallets
                    .disable_for_window(&request.wallet.payment_address);
                self.note_wallet_exhausted(symbol, report);
            }
            Err(e) => {
                self.ctx
                    .wallets
                    .decrement_bid_count(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.errors);
                warn!(symbol, error = %e, "collection offer failed");
            }
        }
    }

    /// Flip the cycle's exhaustion flag, logging only on the transition.
    fn note_wallet_exhausted(&self, symbol: &str, report: &mut CycleReport) {
        if !report.wallet_exhausted {
            warn!(symbol, "wallet pool exhausted for this cycle");
            report.wallet_exhausted = true;
        }
    }
}

/// Registry of per-collection schedulers, keyed by symbol, used by the
/// dispatch workers to execute queued cycles.
pub struct SchedulerSet {
    schedulers: HashMap<String, Arc<CollectionScheduler>>,
}

impl SchedulerSet {
    pub fn new(configs: Vec<CollectionConfig>, ctx: BidContext) -> Self {
        let running = Arc::new(ScheduledRunning::new());
        let schedulers = configs
            .into_iter()
            .map(|cfg| {
                let symbol = cfg.collection_symbol.clone();
                let scheduler =
                    Arc::new(CollectionScheduler::new(cfg, ctx.clone(), running.clone()));
                (symbol, scheduler)
            })
            .collect();
        Self { schedulers }
    }

    pub async fn run_cycle(&self, collection_symbol: &str) -> Result<()> {
        if let Some(scheduler) = self.schedulers.get(collection_symbol) {
            scheduler.run_cycle().await?;
        }
        Ok(())
    }

    pub fn get(&self, collection_symbol: &str) -> Option<&Arc<CollectionScheduler>> {
        self.schedulers.get(collection_symbol)
    }
}

/// Per-collection ticker: submits a cycle now and then every
/// `scheduled_loop` seconds until shutdown.
pub fn spawn_ticker(
    collection_symbol: String,
    scheduled_loop_secs: u64,
    events: Arc<EventManager>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            symbol = %collection_symbol,
            interval_secs = scheduled_loop_secs,
            "scheduled loop started"
        );
        loop {
            events.submit_cycle(&collection_symbol);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(scheduled_loop_secs)) => {}
                _ = shutdown.wait() => {
                    debug!(symbol = %collection_symbol, "scheduled loop stopped");
                    return;
                }
            }
        }
    })
}
