//! Core domain types for the bidding engine.
//!
//! Wire-facing structs stay permissive (marketplaces send numbers as
//! strings); everything downstream of validation is strongly typed.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: f64 = 100_000_000.0;

/// Convert a BTC amount from configuration into integer satoshis.
pub fn btc_to_sats(btc: f64) -> u64 {
    (btc * SATS_PER_BTC).round() as u64
}

/// Offer placement mode for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OfferType {
    Item,
    Collection,
}

impl OfferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferType::Item => "ITEM",
            OfferType::Collection => "COLLECTION",
        }
    }
}

/// Trait filter entry for trait-scoped bidding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitFilter {
    pub trait_type: String,
    pub value: String,
}

/// One entry of `config/collections.json`.
///
/// Amounts (`min_bid`, `max_bid`, `out_bid_margin`) are BTC; floor bounds
/// are percentages of the marketplace floor price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub collection_symbol: String,
    pub min_bid: f64,
    pub max_bid: f64,
    #[serde(default)]
    pub min_floor_bid: f64,
    #[serde(default = "default_max_floor_bid")]
    pub max_floor_bid: f64,
    #[serde(default = "default_bid_count")]
    pub bid_count: usize,
    /// Bid expiration in minutes.
    #[serde(default = "default_duration")]
    pub duration: u64,
    /// Seconds between scheduled cycles.
    #[serde(default = "default_scheduled_loop")]
    pub scheduled_loop: u64,
    #[serde(default)]
    pub enable_counter_bidding: bool,
    #[serde(default)]
    pub out_bid_margin: f64,
    #[serde(default = "default_offer_type")]
    pub offer_type: OfferType,
    /// Maximum items won before the collection stops bidding.
    #[serde(default = "default_quantity")]
    pub quantity: u64,
    #[serde(default = "default_fee_rate")]
    pub fee_sats_per_vbyte: u64,
    #[serde(default)]
    pub traits: Vec<TraitFilter>,
    /// Optional wallet-group binding; unset means the flat pool.
    #[serde(default)]
    pub wallet_group: Option<String>,
}

fn default_max_floor_bid() -> f64 {
    100.0
}

fn default_bid_count() -> usize {
    20
}

fn default_duration() -> u64 {
    30
}

fn default_scheduled_loop() -> u64 {
    600
}

fn default_offer_type() -> OfferType {
    OfferType::Item
}

fn default_quantity() -> u64 {
    1
}

fn default_fee_rate() -> u64 {
    28
}

impl CollectionConfig {
    /// Outbid margin in satoshis, never below one sat.
    pub fn out_bid_margin_sats(&self) -> u64 {
        btc_to_sats(self.out_bid_margin).max(1)
    }
}

/// Marketplace activity kinds the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OfferPlaced,
    CollOfferCreated,
    CollOfferEdited,
    OfferCancelled,
    CollOfferCancelled,
    BuyingBroadcasted,
    OfferAcceptedBroadcasted,
    CollOfferFulfillBroadcasted,
}

impl EventKind {
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "offer_placed" => Some(EventKind::OfferPlaced),
            "coll_offer_created" => Some(EventKind::CollOfferCreated),
            "coll_offer_edited" => Some(EventKind::CollOfferEdited),
            "offer_cancelled" => Some(EventKind::OfferCancelled),
            "coll_offer_cancelled" => Some(EventKind::CollOfferCancelled),
            "buying_broadcasted" => Some(EventKind::BuyingBroadcasted),
            "offer_accepted_broadcasted" => Some(EventKind::OfferAcceptedBroadcasted),
            "coll_offer_fulfill_broadcasted" => Some(EventKind::CollOfferFulfillBroadcasted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OfferPlaced => "offer_placed",
            EventKind::CollOfferCreated => "coll_offer_created",
            EventKind::CollOfferEdited => "coll_offer_edited",
            EventKind::OfferCancelled => "offer_cancelled",
            EventKind::CollOfferCancelled => "coll_offer_cancelled",
            EventKind::BuyingBroadcasted => "buying_broadcasted",
            EventKind::OfferAcceptedBroadcasted => "offer_accepted_broadcasted",
            EventKind::CollOfferFulfillBroadcasted => "coll_offer_fulfill_broadcasted",
        }
    }

    /// Purchase kinds carry settlement information and must never be
    /// dropped by queue overflow or superseded by later events.
    pub fn is_purchase(&self) -> bool {
        matches!(
            self,
            EventKind::BuyingBroadcasted
                | EventKind::OfferAcceptedBroadcasted
                | EventKind::CollOfferFulfillBroadcasted
        )
    }

    pub fn is_item_offer(&self) -> bool {
        matches!(self, EventKind::OfferPlaced | EventKind::OfferCancelled)
    }

    pub fn is_collection_offer(&self) -> bool {
        matches!(
            self,
            EventKind::CollOfferCreated
                | EventKind::CollOfferEdited
                | EventKind::CollOfferCancelled
        )
    }
}

/// Raw push-stream frame, pre-validation.
///
/// Only `kind` and `collection_symbol` are required to be present as
/// strings; everything else is optional and decoded permissively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub kind: String,
    pub collection_symbol: String,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_sats")]
    pub listed_price: Option<u64>,
    #[serde(default)]
    pub buyer_payment_address: Option<String>,
    #[serde(default)]
    pub new_owner: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// A validated marketplace event, past the watched-kind filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub kind: EventKind,
    pub collection_symbol: String,
    pub token_id: Option<String>,
    pub listed_price: Option<u64>,
    pub buyer_payment_address: Option<String>,
    pub new_owner: Option<String>,
    pub created_at: Option<String>,
}

impl MarketEvent {
    pub fn from_raw(kind: EventKind, raw: RawEvent) -> Self {
        Self {
            kind,
            collection_symbol: raw.collection_symbol,
            token_id: raw.token_id,
            listed_price: raw.listed_price,
            buyer_payment_address: raw.buyer_payment_address,
            new_owner: raw.new_owner,
            created_at: raw.created_at,
        }
    }

    /// Canonical key identifying the logical subject of this event.
    ///
    /// Purchase kinds return `None`: they are never deduplicated against
    /// each other and never superseded in the queue.
    pub fn dedup_key(&self) -> Option<String> {
        if self.kind.is_purchase() {
            return None;
        }
        if self.kind.is_item_offer() {
            let token = self.token_id.as_deref()?;
            return Some(format!("item:{}:{}", self.collection_symbol, token));
        }
        Some(format!("coll_offer:{}", self.collection_symbol))
    }
}

/// One of our active bids on a specific token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidRecord {
    /// Price in satoshis.
    pub price: u64,
    /// Expiration, epoch milliseconds.
    pub expiration: i64,
    /// Payment address of the wallet that placed the bid.
    pub payment_address: String,
}

/// Our active collection-wide offer, COLLECTION mode only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OurCollectionOffer {
    pub price: u64,
    pub expiration: i64,
    pub payment_address: String,
    #[serde(default)]
    pub offer_id: Option<String>,
}

/// A marketplace listing: token id plus asking price in sats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub price: u64,
}

/// Everything the engine remembers about one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionBidRecord {
    pub offer_type: OfferType,
    /// token id -> our active bid.
    #[serde(default)]
    pub our_bids: HashMap<String, BidRecord>,
    /// Tokens where we are confirmed current top bidder.
    /// Invariant: every member also exists in `our_bids`.
    #[serde(default)]
    pub top_bids: HashSet<String>,
    /// The marketplace's cheapest listings at last fetch, price ascending.
    #[serde(default)]
    pub bottom_listings: Vec<Listing>,
    /// Epoch ms of the last activity observed for this collection.
    #[serde(default)]
    pub last_seen_activity: Option<i64>,
    /// Items-won counter, serialized through the quantity lock.
    #[serde(default)]
    pub quantity: u64,
    #[serde(default)]
    pub highest_collection_offer: Option<OurCollectionOffer>,
}

impl CollectionBidRecord {
    pub fn new(offer_type: OfferType) -> Self {
        Self {
            offer_type,
            our_bids: HashMap::new(),
            top_bids: HashSet::new(),
            bottom_listings: Vec::new(),
            last_seen_activity: None,
            quantity: 0,
            highest_collection_offer: None,
        }
    }
}

/// Decode an optional sat amount that may arrive as a number or a string.
fn de_opt_sats<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<serde_json::Value>::deserialize(deserializer)?;
    match v {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                Ok(Some(u))
            } else if let Some(f) = n.as_f64() {
                Ok(Some(f.round() as u64))
            } else {
                Err(serde::de::Error::custom("invalid price number"))
            }
        }
        Some(serde_json::Value::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom("invalid price string")),
        Some(_) => Err(serde::de::Error::custom("expected number or string")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_to_sats_rounds() {
        assert_eq!(btc_to_sats(0.0005), 50_000);
        assert_eq!(btc_to_sats(0.000001), 100);
        assert_eq!(btc_to_sats(0.0), 0);
    }

    #[test]
    fn test_event_kind_wire_names_round_trip() {
        for kind in [
            "offer_placed",
            "coll_offer_created",
            "coll_offer_edited",
            "offer_cancelled",
            "coll_offer_cancelled",
            "buying_broadcasted",
            "offer_accepted_broadcasted",
            "coll_offer_fulfill_broadcasted",
        ] {
            let parsed = EventKind::from_wire(kind).expect("watched kind");
            assert_eq!(parsed.as_str(), kind);
        }
        assert!(EventKind::from_wire("listing_created").is_none());
    }

    #[test]
    fn test_raw_event_permissive_price() {
        let json = r#"{
            "kind": "offer_placed",
            "collectionSymbol": "bitcoin-frogs",
            "tokenId": "abc123i0",
            "listedPrice": "42000"
        }"#;
        let raw: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(raw.listed_price, Some(42_000));

        let json = r#"{"kind":"offer_placed","collectionSymbol":"s","listedPrice":42000}"#;
        let raw: RawEvent = serde_json::from_str(json).unwrap();
        assert_eq!(raw.listed_price, Some(42_000));
    }

    #[test]
    fn test_dedup_keys() {
        let mut ev = MarketEvent {
            kind: EventKind::OfferPlaced,
            collection_symbol: "frogs".to_string(),
            token_id: Some("t1".to_string()),
            listed_price: Some(1000),
            buyer_payment_address: None,
            new_owner: None,
            created_at: None,
        };
        assert_eq!(ev.dedup_key().as_deref(), Some("item:frogs:t1"));

        ev.kind = EventKind::CollOfferCreated;
        assert_eq!(ev.dedup_key().as_deref(), Some("coll_offer:frogs"));

        ev.kind = EventKind::BuyingBroadcasted;
        assert_eq!(ev.dedup_key(), None);
    }

    #[test]
    fn test_collection_config_defaults() {
        let json = r#"{
            "collectionSymbol": "bitcoin-frogs",
            "minBid": 0.0001,
            "maxBid": 0.0005
        }"#;
        let cfg: CollectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.max_floor_bid, 100.0);
        assert_eq!(cfg.offer_type, OfferType::Item);
        assert_eq!(cfg.bid_count, 20);
        assert!(cfg.traits.is_empty());
        assert_eq!(cfg.out_bid_margin_sats(), 1);
    }
}
