//! Event intake and dispatch.
//!
//! Every push-stream frame passes a fixed filter ladder before it may
//! occupy queue space: ready gate, watched kind, known collection, own
//! wallet, per-key dedup cooldown, in-queue supersession. The queue is
//! bounded; overflow evicts non-purchase work first so settlement
//! events survive load. Workers pop by priority: counter-bid events
//! before scheduled cycles, FIFO within a priority.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{EventKind, MarketEvent, RawEvent};
use crate::shutdown::Shutdown;
use crate::stats::{inc, EventStats};
use crate::wallets::WalletSelector;

/// Bounded queue size.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Per-key cooldown between events for the same subject.
pub const DEDUP_COOLDOWN_MS: i64 = 5_000;

/// Log an overflow warning once per this many drops.
pub const DROP_LOG_INTERVAL: u64 = 50;

/// Upper bound on dispatch workers.
pub const MAX_WORKERS: usize = 20;

/// Workers per wallet before the cap.
pub const WORKERS_PER_WALLET: usize = 4;

/// A unit of work drawn from the queue.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Marketplace activity to counter or settle. Elevated priority.
    Event(MarketEvent),
    /// One scheduled bidding cycle for a collection. Normal priority.
    ScheduledCycle(String),
}

impl WorkItem {
    fn priority(&self) -> u8 {
        match self {
            WorkItem::Event(_) => 1,
            WorkItem::ScheduledCycle(_) => 0,
        }
    }

    fn is_purchase(&self) -> bool {
        matches!(self, WorkItem::Event(e) if e.kind.is_purchase())
    }

    fn dedup_key(&self) -> Option<String> {
        match self {
            WorkItem::Event(e) => e.dedup_key(),
            WorkItem::ScheduledCycle(_) => None,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<WorkItem>,
    /// token id -> last admission (ms). Spans offer_placed and
    /// offer_cancelled for the same token.
    item_seen: HashMap<String, i64>,
    /// collection symbol -> last admission (ms). Spans the three
    /// collection-offer kinds.
    coll_seen: HashMap<String, i64>,
    drops_since_log: u64,
}

pub struct EventManager {
    max_queue: usize,
    dedup_cooldown_ms: i64,
    epoch: Instant,
    ready: AtomicBool,
    state: Mutex<QueueState>,
    notify: Notify,
    stats: Arc<EventStats>,
    active_collections: HashSet<String>,
    wallets: Arc<WalletSelector>,
}

impl EventManager {
    pub fn new(
        active_collections: HashSet<String>,
        wallets: Arc<WalletSelector>,
        stats: Arc<EventStats>,
    ) -> Self {
        Self::with_limits(
            active_collections,
            wallets,
            stats,
            MAX_QUEUE_SIZE,
            DEDUP_COOLDOWN_MS,
        )
    }

    /// Constructor with explicit queue bounds, used by tests and tools.
    pub fn with_limits(
        active_collections: HashSet<String>,
        wallets: Arc<WalletSelector>,
        stats: Arc<EventStats>,
        max_queue: usize,
        dedup_cooldown_ms: i64,
    ) -> Self {
        Self {
            max_queue: max_queue.max(1),
            dedup_cooldown_ms,
            epoch: Instant::now(),
            ready: AtomicBool::new(false),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stats,
            active_collections,
            wallets,
        }
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Open the gate. Anything staged before this point was decided
    /// against pre-boot state and is discarded rather than trusted.
    pub fn set_ready(&self) {
        let discarded = {
            let mut state = self.state.lock();
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        for _ in 0..discarded {
            inc(&self.stats.startup_discarded);
        }
        self.ready.store(true, Ordering::SeqCst);
        info!(discarded, "event intake ready");
    }

    /// Intake for decoded push-stream frames. Applies the full filter
    /// ladder; surviving events are queued as counter-bid work.
    pub fn submit_raw(&self, raw: RawEvent) {
        inc(&self.stats.received);

        if !self.is_ready() {
            inc(&self.stats.startup_discarded);
            return;
        }

        let Some(kind) = EventKind::from_wire(&raw.kind) else {
            inc(&self.stats.unknown_kind);
            return;
        };

        if !self.active_collections.contains(&raw.collection_symbol) {
            inc(&self.stats.unknown_collection);
            return;
        }

        let event = MarketEvent::from_raw(kind, raw);

        // Our own bids echo back on the stream; reacting to them would
        // have us outbidding ourselves.
        let ours = [
            event.buyer_payment_address.as_deref(),
            event.new_owner.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|addr| self.wallets.owns_address(addr));
        if ours && !event.kind.is_purchase() {
            inc(&self.stats.own_wallet_skipped);
            return;
        }

        if !self.passes_dedup(&event) {
            inc(&self.stats.deduplicated);
            return;
        }

        self.enqueue(WorkItem::Event(event));
    }

    /// Queue one scheduled cycle. A cycle already waiting for the same
    /// collection is not duplicated.
    pub fn submit_cycle(&self, collection_symbol: &str) {
        if !self.is_ready() {
            return;
        }
        {
            let state = self.state.lock();
            let waiting = state.queue.iter().any(|item| {
                matches!(item, WorkItem::ScheduledCycle(sym) if sym == collection_symbol)
            });
            if waiting {
                return;
            }
        }
        self.enqueue(WorkItem::ScheduledCycle(collection_symbol.to_string()));
    }

    /// Dedup cooldown check; records the admission timestamp on pass.
    fn passes_dedup(&self, event: &MarketEvent) -> bool {
        if event.kind.is_purchase() {
            return true;
        }
        let now = self.now_ms();
        let cooldown = self.dedup_cooldown_ms;
        let mut state = self.state.lock();

        let (seen, key) = if event.kind.is_item_offer() {
            match event.token_id.clone() {
                Some(token) => (&mut state.item_seen, token),
                None => return true,
            }
        } else {
            (&mut state.coll_seen, event.collection_symbol.clone())
        };

        if let Some(last) = seen.get(&key) {
            if now - *last < cooldown {
                return false;
            }
        }
        seen.insert(key, now);

        // Keep the maps from growing without bound.
        if seen.len() > 10 * self.max_queue {
            seen.retain(|_, ts| now - *ts < cooldown);
        }
        true
    }

    fn enqueue(&self, item: WorkItem) {
        {
            let mut state = self.state.lock();

            // In-queue supersession: the new event carries strictly
            // newer information for the same subject.
            if let Some(key) = item.dedup_key() {
                let before = state.queue.len();
                state
                    .queue
                    .retain(|queued| queued.dedup_key().as_deref() != Some(key.as_str()));
                for _ in 0..(before - state.queue.len()) {
                    inc(&self.stats.superseded);
                }
            }

            if state.queue.len() >= self.max_queue {
                self.drop_for_overflow(&mut state);
            }

            state.queue.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Make room: evict the first non-purchase element; if the queue is
    /// purchases end to end, the oldest one goes.
    fn drop_for_overflow(&self, state: &mut QueueState) {
        let victim = state
            .queue
            .iter()
            .position(|item| !item.is_purchase())
            .unwrap_or(0);
        state.queue.remove(victim);
        inc(&self.stats.overflow_dropped);

        state.drops_since_log += 1;
        if state.drops_since_log >= DROP_LOG_INTERVAL {
            warn!(
                dropped = state.drops_since_log,
                queue = state.queue.len(),
                "event queue overflowing"
            );
            state.drops_since_log = 0;
        }
    }

    fn try_pop(&self) -> Option<WorkItem> {
        let mut state = self.state.lock();
        // Elevated priority first; arrival order within a priority.
        let index = state
            .queue
            .iter()
            .position(|item| item.priority() > 0)
            .unwrap_or(0);
        state.queue.remove(index)
    }

    /// Wait for the next work item; `None` means shutdown.
    pub async fn next(&self, shutdown: &Shutdown) -> Option<WorkItem> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    /// Worker concurrency for a fleet of `total_wallets`.
    pub fn worker_count(total_wallets: usize) -> usize {
        (total_wallets.max(1) * WORKERS_PER_WALLET).min(MAX_WORKERS)
    }
}

/// Spawn the dispatch workers. A handler error is counted and logged;
/// the worker returns to the queue either way.
pub fn spawn_workers<H, Fut>(
    manager: Arc<EventManager>,
    shutdown: Shutdown,
    count: usize,
    handler: H,
) -> Vec<JoinHandle<()>>
where
    H: Fn(WorkItem) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    info!(workers = count, "starting dispatch workers");
    (0..count)
        .map(|worker_id| {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(item) = manager.next(&shutdown).await {
                    match handler(item).await {
                        Ok(()) => inc(&manager.stats.processed),
                        Err(e) => {
                            inc(&manager.stats.handler_errors);
                            warn!(worker_id, error = %e, "work item failed");
                        }
                    }
                }
                debug!(worker_id, "dispatch worker stopped");
            })
        })
        .collect()
}
