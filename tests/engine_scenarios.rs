//! End-to-end engine scenarios against a mock marketplace.
//!
//! These cover the interplay the unit tests cannot: tie-breaks through
//! the counter-bid handler, pacer slot consumption across a scheduled
//! cycle, queue supersession and overflow, and wallet exhaustion
//! short-circuiting.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use ordbot_backend::context::{BidContext, ReceivePolicy};
use ordbot_backend::counterbid::CounterBidHandler;
use ordbot_backend::events::{EventManager, WorkItem};
use ordbot_backend::history::BidHistoryStore;
use ordbot_backend::locks::{QuantityLockMap, TokenLockMap};
use ordbot_backend::marketplace::{
    CollectionOfferRequest, CollectionOfferView, ItemOfferRequest, Marketplace, PlaceOutcome,
    PlacedOffer, TokenOffer,
};
use ordbot_backend::models::{
    BidRecord, CollectionConfig, EventKind, Listing, MarketEvent, OfferType, RawEvent,
};
use ordbot_backend::pacer::BidPacer;
use ordbot_backend::scheduler::{CollectionScheduler, ScheduledRunning};
use ordbot_backend::shutdown::Shutdown;
use ordbot_backend::stats::{BidStats, EventStats};
use ordbot_backend::wallets::file::WalletsFile;
use ordbot_backend::wallets::WalletSelector;

const OUR_PAYMENT: &str = "bc1q-ours-0";

#[derive(Debug, Clone)]
struct PlacedRecord {
    token_id: Option<String>,
    price: u64,
}

/// Scriptable marketplace double.
#[derive(Default)]
struct MockMarketplace {
    floor: AtomicU64,
    listings: Mutex<Vec<Listing>>,
    /// token id -> current top offer returned by `best_token_offer`.
    top_offers: Mutex<HashMap<String, TokenOffer>>,
    best_collection: Mutex<HashMap<String, CollectionOfferView>>,
    placed: Mutex<Vec<PlacedRecord>>,
    cancelled: Mutex<Vec<String>>,
    offer_lookups: AtomicU64,
}

impl MockMarketplace {
    fn new(floor: u64) -> Self {
        let mock = Self::default();
        mock.floor.store(floor, Ordering::SeqCst);
        mock
    }

    fn set_listings(&self, listings: Vec<(&str, u64)>) {
        *self.listings.lock() = listings
            .into_iter()
            .map(|(id, price)| Listing {
                id: id.to_string(),
                price,
            })
            .collect();
    }

    fn set_top_offer(&self, token_id: &str, price: u64, buyer: &str) {
        self.top_offers.lock().insert(
            token_id.to_string(),
            TokenOffer {
                id: Some(format!("offer-{}", token_id)),
                price,
                buyer_payment_address: buyer.to_string(),
                expiration_date: None,
            },
        );
    }

    fn placements(&self) -> Vec<PlacedRecord> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    async fn floor_price(&self, _collection_symbol: &str) -> Result<u64> {
        Ok(self.floor.load(Ordering::SeqCst))
    }

    async fn cheapest_listings(
        &self,
        _collection_symbol: &str,
        limit: usize,
    ) -> Result<Vec<Listing>> {
        let mut listings = self.listings.lock().clone();
        listings.truncate(limit);
        Ok(listings)
    }

    async fn best_token_offer(&self, token_id: &str) -> Result<Option<TokenOffer>> {
        self.offer_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.top_offers.lock().get(token_id).cloned())
    }

    async fn best_collection_offer(
        &self,
        collection_symbol: &str,
    ) -> Result<Option<CollectionOfferView>> {
        Ok(self.best_collection.lock().get(collection_symbol).cloned())
    }

    async fn place_item_offer(&self, request: &ItemOfferRequest) -> Result<PlaceOutcome> {
        self.placed.lock().push(PlacedRecord {
            token_id: Some(request.token_id.clone()),
            price: request.price,
        });
        Ok(PlaceOutcome::Placed(PlacedOffer {
            offer_id: Some(format!("placed-{}", request.token_id)),
            price: request.price,
            expiration_ms: request.expiration_ms,
            payment_address: request.wallet.payment_address.clone(),
            dry_run: false,
        }))
    }

    async fn place_collection_offer(
        &self,
        request: &CollectionOfferRequest,
    ) -> Result<PlaceOutcome> {
        self.placed.lock().push(PlacedRecord {
            token_id: None,
            price: request.price,
        });
        Ok(PlaceOutcome::Placed(PlacedOffer {
            offer_id: Some("placed-coll".to_string()),
            price: request.price,
            expiration_ms: request.expiration_ms,
            payment_address: request.wallet.payment_address.clone(),
            dry_run: false,
        }))
    }

    async fn cancel_offer(&self, offer_id: &str, _wif: &str) -> Result<()> {
        self.cancelled.lock().push(offer_id.to_string());
        Ok(())
    }
}

fn wallet_selector(wallet_count: usize, bids_per_minute: u32, shutdown: Shutdown) -> Arc<WalletSelector> {
    let wallets: Vec<serde_json::Value> = (0..wallet_count)
        .map(|i| {
            serde_json::json!({
                "label": format!("w{}", i),
                "wif": format!("wif-{}", i),
                "paymentAddress": format!("bc1q-ours-{}", i),
                "receiveAddress": format!("bc1p-ours-{}", i),
            })
        })
        .collect();
    let file: WalletsFile =
        serde_json::from_value(serde_json::json!({ "wallets": wallets })).unwrap();
    Arc::new(WalletSelector::from_file(file, bids_per_minute, shutdown).unwrap())
}

fn collection_cfg(symbol: &str) -> CollectionConfig {
    serde_json::from_value(serde_json::json!({
        "collectionSymbol": symbol,
        "minBid": 0.0001,
        "maxBid": 0.001,
        "bidCount": 20,
        "duration": 30,
        "scheduledLoop": 600,
        "enableCounterBidding": true,
        "outBidMargin": 0.000001,
        "offerType": "ITEM",
        "quantity": 10,
    }))
    .unwrap()
}

struct Harness {
    _dir: tempfile::TempDir,
    ctx: BidContext,
}

fn harness(mock: Arc<MockMarketplace>, wallet_count: usize, bids_per_minute: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();
    let wallets = wallet_selector(wallet_count, bids_per_minute, shutdown.clone());
    let history =
        Arc::new(BidHistoryStore::load(dir.path().join("bidHistory.json")).unwrap());
    history.init("frogs", OfferType::Item);

    let ctx = BidContext {
        marketplace: mock,
        pacer: Arc::new(BidPacer::new(
            wallets.capacity_per_minute(),
            shutdown.clone(),
        )),
        wallets,
        history,
        token_locks: Arc::new(TokenLockMap::new()),
        quantity_locks: Arc::new(QuantityLockMap::new()),
        bid_stats: Arc::new(BidStats::default()),
        receive_policy: ReceivePolicy::WalletOwn,
        shutdown,
    };
    Harness { _dir: dir, ctx }
}

fn offer_placed_event(token_id: &str, price: u64, buyer: &str) -> MarketEvent {
    MarketEvent {
        kind: EventKind::OfferPlaced,
        collection_symbol: "frogs".to_string(),
        token_id: Some(token_id.to_string()),
        listed_price: Some(price),
        buyer_payment_address: Some(buyer.to_string()),
        new_owner: None,
        created_at: None,
    }
}

/// Scenario: equal-price tie where the marketplace confirms we rank
/// first. No bid goes out; the token is flagged top.
#[tokio::test]
async fn tie_break_when_we_are_top() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_bottom_listings(
        "frogs",
        vec![Listing {
            id: "t1".to_string(),
            price: 120_000,
        }],
    );
    h.ctx.history.set_our_bid(
        "frogs",
        "t1",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );
    mock.set_top_offer("t1", 50_000, OUR_PAYMENT);

    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(offer_placed_event("t1", 50_000, "bc1q-competitor"))
        .await
        .unwrap();

    assert!(mock.placements().is_empty(), "no bid expected");
    assert!(h.ctx.history.is_top("frogs", "t1"));
}

/// Scenario: equal-price tie where a competitor actually ranks first.
/// One counter lands at top + margin (50_000 + 100 sats).
#[tokio::test]
async fn tie_break_when_we_are_not_top() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_bottom_listings(
        "frogs",
        vec![Listing {
            id: "t1".to_string(),
            price: 120_000,
        }],
    );
    h.ctx.history.set_our_bid(
        "frogs",
        "t1",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );
    mock.set_top_offer("t1", 50_000, "bc1q-competitor");

    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(offer_placed_event("t1", 50_000, "bc1q-competitor"))
        .await
        .unwrap();

    let placements = mock.placements();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].price, 50_100);
    assert_eq!(h.ctx.history.our_bid("frogs", "t1").unwrap().price, 50_100);
    assert_eq!(h.ctx.bid_stats.snapshot().counter_bids_placed, 1);
}

/// A strictly higher competitor bid is countered off the incoming price
/// without an extra top-offer lookup.
#[tokio::test]
async fn higher_bid_is_countered() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_bottom_listings(
        "frogs",
        vec![Listing {
            id: "t1".to_string(),
            price: 120_000,
        }],
    );
    h.ctx.history.set_our_bid(
        "frogs",
        "t1",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );

    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(offer_placed_event("t1", 60_000, "bc1q-competitor"))
        .await
        .unwrap();

    let placements = mock.placements();
    assert_eq!(placements.len(), 1);
    assert_eq!(placements[0].price, 60_100);
}

/// A counter that would exceed maxOffer is rejected by the gate.
#[tokio::test]
async fn counter_above_max_offer_is_rejected() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_bottom_listings(
        "frogs",
        vec![Listing {
            id: "t1".to_string(),
            price: 120_000,
        }],
    );
    h.ctx.history.set_our_bid(
        "frogs",
        "t1",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );

    // maxOffer = min(0.001 BTC, 100% floor) = 100_000; countering
    // 100_000 would land above it.
    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(offer_placed_event("t1", 100_000, "bc1q-competitor"))
        .await
        .unwrap();

    assert!(mock.placements().is_empty());
    assert_eq!(h.ctx.bid_stats.snapshot().safety_gate_rejections, 1);
}

/// Scenario: pacer saturation and release. Capacity one, first task
/// declines to bid and releases; the second reserves the same capacity.
#[tokio::test]
async fn pacer_slot_release_frees_capacity() {
    let shutdown = Shutdown::new();
    let pacer = BidPacer::new(1, shutdown);

    let slot_a = pacer.reserve_slot().await.unwrap();
    // Decided not to bid.
    pacer.release_slot(slot_a);

    let slot_b = pacer.reserve_slot().await.unwrap();
    assert_ne!(slot_a, slot_b);
    pacer.release_slot(slot_b);
    assert_eq!(pacer.used(), 0);
}

/// Scenario: in-queue supersession. Two offers for the same token admit
/// as one queue element carrying the newer price.
#[tokio::test]
async fn queue_supersession_keeps_newest_event() {
    let shutdown = Shutdown::new();
    let wallets = wallet_selector(1, 10, shutdown);
    let collections: HashSet<String> = ["frogs".to_string()].into_iter().collect();
    let events = EventManager::with_limits(
        collections,
        wallets,
        Arc::new(EventStats::default()),
        10,
        0, // cooldown disabled so both pass dedup
    );
    events.set_ready();

    for price in [100u64, 200] {
        events.submit_raw(RawEvent {
            kind: "offer_placed".to_string(),
            collection_symbol: "frogs".to_string(),
            token_id: Some("t1".to_string()),
            listed_price: Some(price),
            buyer_payment_address: Some("bc1q-competitor".to_string()),
            new_owner: None,
            created_at: None,
        });
    }

    assert_eq!(events.queue_len(), 1);
    assert_eq!(events.stats().snapshot().superseded, 1);
}

/// Scenario: overflow with purchase protection. A full queue of offers
/// admits a purchase by evicting an offer, never the purchase.
#[tokio::test]
async fn overflow_preserves_purchase_events() {
    let shutdown = Shutdown::new();
    let wallets = wallet_selector(1, 10, shutdown.clone());
    let collections: HashSet<String> = ["frogs".to_string()].into_iter().collect();
    let events = Arc::new(EventManager::with_limits(
        collections,
        wallets,
        Arc::new(EventStats::default()),
        5,
        0,
    ));
    events.set_ready();

    for i in 0..5 {
        events.submit_raw(RawEvent {
            kind: "offer_placed".to_string(),
            collection_symbol: "frogs".to_string(),
            token_id: Some(format!("t{}", i)),
            listed_price: Some(100),
            buyer_payment_address: Some("bc1q-competitor".to_string()),
            new_owner: None,
            created_at: None,
        });
    }
    events.submit_raw(RawEvent {
        kind: "buying_broadcasted".to_string(),
        collection_symbol: "frogs".to_string(),
        token_id: Some("t100".to_string()),
        listed_price: Some(100),
        buyer_payment_address: Some("bc1q-competitor".to_string()),
        new_owner: None,
        created_at: None,
    });

    assert_eq!(events.queue_len(), 5);
    assert_eq!(events.stats().snapshot().overflow_dropped, 1);

    let mut saw_purchase = false;
    while let Some(item) = events.next(&Shutdown::new()).await {
        if let WorkItem::Event(e) = item {
            if e.kind == EventKind::BuyingBroadcasted {
                saw_purchase = true;
            }
        }
        if events.queue_len() == 0 {
            break;
        }
    }
    assert!(saw_purchase, "purchase event must survive overflow");
}

/// Scenario: scheduled cycle with wallet exhaustion. Ten candidates,
/// budget for two bids: two land, seven are skipped without reserving
/// slots, and the pacer holds exactly the two consumed slots.
#[tokio::test]
async fn scheduled_cycle_short_circuits_on_wallet_exhaustion() {
    let mock = Arc::new(MockMarketplace::new(500_000));
    // One wallet, two bids per window.
    let h = harness(mock.clone(), 1, 2);

    let listings: Vec<(String, u64)> = (0..10)
        .map(|i| (format!("t{}", i), 100_000 + i as u64))
        .collect();
    mock.set_listings(listings.iter().map(|(id, p)| (id.as_str(), *p)).collect());

    let scheduler = CollectionScheduler::new(
        collection_cfg("frogs"),
        h.ctx.clone(),
        Arc::new(ScheduledRunning::new()),
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.successful_bids, 2);
    assert_eq!(report.skipped_wallet_exhausted, 7);
    assert!(report.wallet_exhausted);
    assert_eq!(mock.placements().len(), 2);
    // Two consumed slots remain in the window; the exhausted attempt
    // released its reservation.
    assert_eq!(h.ctx.pacer.used(), 2);
    // Skipped candidates never queried the marketplace: lookups ran for
    // the two successes plus the attempt that found no wallet.
    assert_eq!(mock.offer_lookups.load(Ordering::SeqCst), 3);
    assert_eq!(h.ctx.bid_stats.snapshot().skipped_wallet_exhausted, 7);
}

/// With every wallet saturated up front the cycle returns promptly and
/// only the first candidate touches the marketplace.
#[tokio::test]
async fn exhausted_pool_skips_remaining_candidates() {
    let mock = Arc::new(MockMarketplace::new(500_000));
    let h = harness(mock.clone(), 1, 1);

    // Burn the single wallet's budget.
    let pool = h.ctx.wallets.pool_for("frogs");
    assert!(pool.acquire().is_some());

    mock.set_listings(vec![
        ("t0", 100_000),
        ("t1", 100_001),
        ("t2", 100_002),
    ]);

    let scheduler = CollectionScheduler::new(
        collection_cfg("frogs"),
        h.ctx.clone(),
        Arc::new(ScheduledRunning::new()),
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.successful_bids, 0);
    assert_eq!(report.skipped_wallet_exhausted, 2);
    assert_eq!(mock.offer_lookups.load(Ordering::SeqCst), 1);
    assert_eq!(h.ctx.pacer.used(), 0, "no slot stays consumed");
}

/// A remote 429 disables the wallet for its window and flags the cycle.
#[tokio::test]
async fn remote_rate_limit_marks_wallet_exhausted() {
    struct RateLimitedMarketplace(MockMarketplace);

    #[async_trait]
    impl Marketplace for RateLimitedMarketplace {
        async fn floor_price(&self, s: &str) -> Result<u64> {
            self.0.floor_price(s).await
        }
        async fn cheapest_listings(&self, s: &str, l: usize) -> Result<Vec<Listing>> {
            self.0.cheapest_listings(s, l).await
        }
        async fn best_token_offer(&self, t: &str) -> Result<Option<TokenOffer>> {
            self.0.best_token_offer(t).await
        }
        async fn best_collection_offer(&self, s: &str) -> Result<Option<CollectionOfferView>> {
            self.0.best_collection_offer(s).await
        }
        async fn place_item_offer(&self, _request: &ItemOfferRequest) -> Result<PlaceOutcome> {
            Ok(PlaceOutcome::WalletExhausted)
        }
        async fn place_collection_offer(
            &self,
            _request: &CollectionOfferRequest,
        ) -> Result<PlaceOutcome> {
            Ok(PlaceOutcome::WalletExhausted)
        }
        async fn cancel_offer(&self, o: &str, w: &str) -> Result<()> {
            self.0.cancel_offer(o, w).await
        }
    }

    let inner = MockMarketplace::new(500_000);
    inner.set_listings(vec![("t0", 100_000), ("t1", 100_001)]);
    let mock = Arc::new(RateLimitedMarketplace(inner));

    let dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();
    let wallets = wallet_selector(1, 5, shutdown.clone());
    let history =
        Arc::new(BidHistoryStore::load(dir.path().join("bidHistory.json")).unwrap());
    history.init("frogs", OfferType::Item);

    let ctx = BidContext {
        marketplace: mock,
        pacer: Arc::new(BidPacer::new(5, shutdown.clone())),
        wallets: wallets.clone(),
        history,
        token_locks: Arc::new(TokenLockMap::new()),
        quantity_locks: Arc::new(QuantityLockMap::new()),
        bid_stats: Arc::new(BidStats::default()),
        receive_policy: ReceivePolicy::WalletOwn,
        shutdown,
    };

    let scheduler = CollectionScheduler::new(
        collection_cfg("frogs"),
        ctx.clone(),
        Arc::new(ScheduledRunning::new()),
    );
    let report = scheduler.run_cycle().await.unwrap();

    assert!(report.wallet_exhausted);
    assert_eq!(report.successful_bids, 0);
    // The 429 saturated the wallet for the rest of its window.
    assert!(wallets.pool_for("frogs").acquire().is_none());
}

/// Our own broadcasted purchase advances the quantity counter under the
/// lock and retires the outstanding bid on the token.
#[tokio::test]
async fn purchase_settles_quantity_and_retires_bid() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_our_bid(
        "frogs",
        "t1",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );

    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(MarketEvent {
            kind: EventKind::BuyingBroadcasted,
            collection_symbol: "frogs".to_string(),
            token_id: Some("t1".to_string()),
            listed_price: None,
            buyer_payment_address: Some(OUR_PAYMENT.to_string()),
            new_owner: None,
            created_at: None,
        })
        .await
        .unwrap();

    assert_eq!(h.ctx.history.quantity("frogs"), 1);
    assert!(h.ctx.history.our_bid("frogs", "t1").is_none());
    assert_eq!(h.ctx.bid_stats.snapshot().items_won, 1);
}

/// Events for tokens outside the bottom listings are not counter-bid.
#[tokio::test]
async fn non_target_tokens_are_ignored() {
    let mock = Arc::new(MockMarketplace::new(100_000));
    let h = harness(mock.clone(), 1, 10);

    h.ctx.history.set_bottom_listings(
        "frogs",
        vec![Listing {
            id: "t1".to_string(),
            price: 120_000,
        }],
    );
    h.ctx.history.set_our_bid(
        "frogs",
        "t-elsewhere",
        BidRecord {
            price: 50_000,
            expiration: i64::MAX,
            payment_address: OUR_PAYMENT.to_string(),
        },
    );

    let handler = CounterBidHandler::new(h.ctx.clone(), vec![collection_cfg("frogs")]);
    handler
        .handle(offer_placed_event("t-elsewhere", 60_000, "bc1q-competitor"))
        .await
        .unwrap();

    assert!(mock.placements().is_empty());
}
