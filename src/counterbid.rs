//! Event-driven counter-bidding.
//!
//! Handles each surviving marketplace event: stay put when we are still
//! ahead, outbid when beaten, settle quantity on wins. Counter-bids
//! bypass the global pacer; they are rare, time-critical, and already
//! bounded by the per-wallet buckets.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::context::BidContext;
use crate::marketplace::{CollectionOfferRequest, ItemOfferRequest, PlaceOutcome};
use crate::models::{
    BidRecord, CollectionConfig, EventKind, MarketEvent, OfferType, OurCollectionOffer,
};
use crate::pricing::{self, PriceLimits};
use crate::stats::inc;

pub struct CounterBidHandler {
    ctx: BidContext,
    configs: HashMap<String, CollectionConfig>,
}

impl CounterBidHandler {
    pub fn new(ctx: BidContext, configs: Vec<CollectionConfig>) -> Self {
        let configs = configs
            .into_iter()
            .map(|cfg| (cfg.collection_symbol.clone(), cfg))
            .collect();
        Self { ctx, configs }
    }

    pub async fn handle(&self, event: MarketEvent) -> Result<()> {
        let symbol = event.collection_symbol.clone();
        self.ctx.history.touch_activity(&symbol);

        let Some(cfg) = self.configs.get(&symbol) else {
            return Ok(());
        };

        match event.kind {
            EventKind::BuyingBroadcasted
            | EventKind::OfferAcceptedBroadcasted
            | EventKind::CollOfferFulfillBroadcasted => self.handle_purchase(cfg, &event).await,
            _ if !cfg.enable_counter_bidding => Ok(()),
            EventKind::OfferPlaced => self.handle_offer_placed(cfg, &event).await,
            EventKind::OfferCancelled => self.handle_offer_cancelled(cfg, &event).await,
            EventKind::CollOfferCreated | EventKind::CollOfferEdited => {
                self.handle_collection_offer_changed(cfg, &event).await
            }
            EventKind::CollOfferCancelled => {
                self.handle_collection_offer_cancelled(cfg, &event).await
            }
        }
    }

    /// A competitor placed an item offer.
    async fn handle_offer_placed(
        &self,
        cfg: &CollectionConfig,
        event: &MarketEvent,
    ) -> Result<()> {
        if cfg.offer_type != OfferType::Item {
            return Ok(());
        }
        let Some(token_id) = event.token_id.as_deref() else {
            return Ok(());
        };
        let symbol = &event.collection_symbol;

        // Only tokens in the cheapest-listings window are targets.
        let targeted = self
            .ctx
            .history
            .bottom_listings(symbol)
            .iter()
            .any(|l| l.id == token_id);
        if !targeted {
            return Ok(());
        }

        let Some(our_bid) = self.ctx.history.our_bid(symbol, token_id) else {
            return Ok(());
        };
        let Some(incoming) = event.listed_price else {
            return Ok(());
        };

        if !self.ctx.token_locks.acquire(token_id).await {
            return Ok(());
        }
        let result = self
            .react_to_item_offer(cfg, symbol, token_id, our_bid, incoming)
            .await;
        self.ctx.token_locks.release(token_id);
        result
    }

    async fn react_to_item_offer(
        &self,
        cfg: &CollectionConfig,
        symbol: &str,
        token_id: &str,
        our_bid: BidRecord,
        incoming: u64,
    ) -> Result<()> {
        if incoming < our_bid.price {
            // Still ahead.
            debug!(token_id, incoming, ours = our_bid.price, "still top, skipping");
            return Ok(());
        }

        if incoming == our_bid.price {
            // Equal price: only the marketplace knows who ranks first.
            let top = match self.ctx.marketplace.best_token_offer(token_id).await {
                Ok(top) => top,
                Err(e) => {
                    debug!(token_id, error = %e, "tie-break lookup failed, skipping");
                    return Ok(());
                }
            };
            match top {
                Some(offer) if self.ctx.wallets.owns_address(&offer.buyer_payment_address) => {
                    self.ctx.history.mark_top(symbol, token_id);
                    inc(&self.ctx.bid_stats.skipped_already_top);
                    return Ok(());
                }
                Some(offer) => {
                    self.ctx.history.clear_top(symbol, token_id);
                    return self.counter_item(cfg, symbol, token_id, offer.price).await;
                }
                None => return Ok(()),
            }
        }

        // Beaten outright; the incoming offer is the price to clear.
        self.ctx.history.clear_top(symbol, token_id);
        self.counter_item(cfg, symbol, token_id, incoming).await
    }

    /// An item offer disappeared; reclaim top or counter the new leader.
    async fn handle_offer_cancelled(
        &self,
        cfg: &CollectionConfig,
        event: &MarketEvent,
    ) -> Result<()> {
        if cfg.offer_type != OfferType::Item {
            return Ok(());
        }
        let Some(token_id) = event.token_id.as_deref() else {
            return Ok(());
        };
        let symbol = &event.collection_symbol;

        if self.ctx.history.our_bid(symbol, token_id).is_none() {
            return Ok(());
        }

        if !self.ctx.token_locks.acquire(token_id).await {
            return Ok(());
        }
        let result = async {
            match self.ctx.marketplace.best_token_offer(token_id).await {
                Ok(Some(offer))
                    if self.ctx.wallets.owns_address(&offer.buyer_payment_address) =>
                {
                    self.ctx.history.mark_top(symbol, token_id);
                    Ok(())
                }
                Ok(Some(offer)) => self.counter_item(cfg, symbol, token_id, offer.price).await,
                Ok(None) => Ok(()),
                Err(e) => {
                    debug!(token_id, error = %e, "post-cancel lookup failed, skipping");
                    Ok(())
                }
            }
        }
        .await;
        self.ctx.token_locks.release(token_id);
        result
    }

    /// Place an item counter-bid strictly above `top_price`.
    async fn counter_item(
        &self,
        cfg: &CollectionConfig,
        symbol: &str,
        token_id: &str,
        top_price: u64,
    ) -> Result<()> {
        let floor = match self.ctx.marketplace.floor_price(symbol).await {
            Ok(floor) => floor,
            Err(e) => {
                debug!(symbol, error = %e, "floor fetch failed, skipping counter");
                return Ok(());
            }
        };
        let limits = PriceLimits::for_collection(cfg, floor);
        let new_price = pricing::outbid_price(top_price, cfg);

        if let Err(rejection) = pricing::check_bid(cfg, new_price, floor, &limits) {
            inc(&self.ctx.bid_stats.safety_gate_rejections);
            warn!(token_id, %rejection, "counter-bid rejected by safety gate");
            return Ok(());
        }

        let pool = self.ctx.wallets.pool_for(symbol);
        let Some(wallet) = pool.acquire() else {
            inc(&self.ctx.bid_stats.skipped_wallet_exhausted);
            debug!(token_id, "no wallet available for counter-bid");
            return Ok(());
        };

        let request = ItemOfferRequest {
            token_id: token_id.to_string(),
            collection_symbol: symbol.to_string(),
            price: new_price,
            expiration_ms: BidContext::expiration_ms(cfg.duration),
            receive_address: self.ctx.receive_policy.receive_address(&wallet),
            wallet,
            fee_sats_per_vbyte: cfg.fee_sats_per_vbyte,
        };

        match self.ctx.marketplace.place_item_offer(&request).await {
            Ok(PlaceOutcome::Placed(offer)) => {
                self.ctx.history.set_our_bid(
                    symbol,
                    token_id,
                    BidRecord {
                        price: offer.price,
                        expiration: offer.expiration_ms,
                        payment_address: offer.payment_address,
                    },
                );
                self.ctx.history.mark_top(symbol, token_id);
                inc(&self.ctx.bid_stats.counter_bids_placed);
                info!(token_id, price = new_price, over = top_price, "counter-bid placed");
                Ok(())
            }
            Ok(PlaceOutcome::WalletExhausted) => {
                self.ctx
                    .wallets
                    .disable_for_window(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.skipped_wallet_exhausted);
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .wallets
                    .decrement_bid_count(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.errors);
                Err(e)
            }
        }
    }

    /// A collection-wide offer appeared or changed. Created and edited
    /// are handled identically.
    async fn handle_collection_offer_changed(
        &self,
        cfg: &CollectionConfig,
        event: &MarketEvent,
    ) -> Result<()> {
        if cfg.offer_type != OfferType::Collection {
            return Ok(());
        }
        let symbol = &event.collection_symbol;
        let Some(ours) = self.ctx.history.collection_offer(symbol) else {
            // Nothing standing; the scheduled loop will establish one.
            return Ok(());
        };

        if let Some(incoming) = event.listed_price {
            if incoming < ours.price {
                return Ok(());
            }
        }
        self.reevaluate_collection_offer(cfg, symbol, &ours).await
    }

    async fn handle_collection_offer_cancelled(
        &self,
        cfg: &CollectionConfig,
        event: &MarketEvent,
    ) -> Result<()> {
        if cfg.offer_type != OfferType::Collection {
            return Ok(());
        }
        let symbol = &event.collection_symbol;
        let Some(ours) = self.ctx.history.collection_offer(symbol) else {
            return Ok(());
        };
        self.reevaluate_collection_offer(cfg, symbol, &ours).await
    }

    /// Confirm our standing against the live best collection offer and
    /// cancel-and-rebid when beaten.
    async fn reevaluate_collection_offer(
        &self,
        cfg: &CollectionConfig,
        symbol: &str,
        ours: &OurCollectionOffer,
    ) -> Result<()> {
        let best = match self.ctx.marketplace.best_collection_offer(symbol).await {
            Ok(best) => best,
            Err(e) => {
                debug!(symbol, error = %e, "collection offer lookup failed, skipping");
                return Ok(());
            }
        };

        let Some(top) = best else {
            return Ok(());
        };
        if top
            .buyer_payment_address
            .as_deref()
            .map(|a| self.ctx.wallets.owns_address(a))
            .unwrap_or(false)
        {
            return Ok(());
        }
        if top.price < ours.price {
            return Ok(());
        }

        let floor = match self.ctx.marketplace.floor_price(symbol).await {
            Ok(floor) => floor,
            Err(e) => {
                debug!(symbol, error = %e, "floor fetch failed, skipping counter");
                return Ok(());
            }
        };
        let limits = PriceLimits::for_collection(cfg, floor);
        let new_price = pricing::outbid_price(top.price, cfg);

        if let Err(rejection) = pricing::check_bid(cfg, new_price, floor, &limits) {
            inc(&self.ctx.bid_stats.safety_gate_rejections);
            warn!(symbol, %rejection, "collection counter rejected by safety gate");
            return Ok(());
        }

        let pool = self.ctx.wallets.pool_for(symbol);
        let Some(wallet) = pool.acquire() else {
            inc(&self.ctx.bid_stats.skipped_wallet_exhausted);
            return Ok(());
        };

        // Cancel the standing offer first; the marketplace allows one
        // collection offer per collection. The cancel is signed by the
        // wallet that placed it.
        if let Some(offer_id) = ours.offer_id.as_deref() {
            let placing_wallet = self
                .ctx
                .wallets
                .pool_for(symbol)
                .get_by_payment_address(&ours.payment_address);
            let wif = placing_wallet.map(|w| w.wif).unwrap_or_default();
            if let Err(e) = self.ctx.marketplace.cancel_offer(offer_id, &wif).await {
                warn!(symbol, error = %e, "failed to cancel standing collection offer");
            } else {
                inc(&self.ctx.bid_stats.bids_cancelled);
            }
        }

        let request = CollectionOfferRequest {
            collection_symbol: symbol.to_string(),
            price: new_price,
            expiration_ms: BidContext::expiration_ms(cfg.duration),
            receive_address: self.ctx.receive_policy.receive_address(&wallet),
            wallet,
            fee_sats_per_vbyte: cfg.fee_sats_per_vbyte,
            existing_offer_id: ours.offer_id.clone(),
        };

        match self.ctx.marketplace.place_collection_offer(&request).await {
            Ok(PlaceOutcome::Placed(offer)) => {
                self.ctx.history.set_collection_offer(
                    symbol,
                    OurCollectionOffer {
                        price: offer.price,
                        expiration: offer.expiration_ms,
                        payment_address: offer.payment_address,
                        offer_id: offer.offer_id,
                    },
                );
                inc(&self.ctx.bid_stats.counter_bids_placed);
                info!(symbol, price = new_price, over = top.price, "collection counter placed");
                Ok(())
            }
            Ok(PlaceOutcome::WalletExhausted) => {
                self.ctx
                    .wallets
                    .disable_for_window(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.skipped_wallet_exhausted);
                Ok(())
            }
            Err(e) => {
                self.ctx
                    .wallets
                    .decrement_bid_count(&request.wallet.payment_address);
                inc(&self.ctx.bid_stats.errors);
                Err(e)
            }
        }
    }

    /// A broadcasted purchase. When the buyer is one of our wallets the
    /// items-won counter advances under the quantity lock.
    async fn handle_purchase(&self, cfg: &CollectionConfig, event: &MarketEvent) -> Result<()> {
        let symbol = &event.collection_symbol;
        let buyer_is_ours = [
            event.buyer_payment_address.as_deref(),
            event.new_owner.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|addr| self.ctx.wallets.owns_address(addr));

        if !buyer_is_ours {
            return Ok(());
        }

        let quantity = match self.ctx.quantity_locks.acquire(symbol).await {
            Some(_guard) => self.ctx.history.increment_quantity(symbol),
            // Retries exhausted: read without incrementing. A missed
            // increment is recoverable, a double increment is not.
            None => self.ctx.history.quantity(symbol),
        };
        inc(&self.ctx.bid_stats.items_won);

        // The won token no longer needs an outstanding offer.
        if let Some(token_id) = event.token_id.as_deref() {
            self.ctx.history.remove_our_bid(symbol, token_id);
        }

        info!(
            symbol,
            quantity,
            cap = cfg.quantity,
            token = event.token_id.as_deref().unwrap_or("-"),
            "item won"
        );
        if quantity >= cfg.quantity {
            info!(symbol, "quantity cap reached; scheduler will stand down");
        }
        Ok(())
    }
}
