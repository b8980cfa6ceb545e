//! Offer price calculation and safety gates.
//!
//! All arithmetic is integer satoshis; configuration amounts in BTC are
//! converted once at the boundary. Gates are pure functions so the
//! scheduler and counter-bid paths share identical rejection behavior.

use std::fmt;

use crate::models::{btc_to_sats, CollectionConfig, OfferType};

/// Effective price bounds for one collection at a given floor price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLimits {
    /// Lower bound in sats: max(minBid, minFloorBid% of floor).
    pub min_offer: u64,
    /// Upper bound in sats: min(maxBid, maxFloorBid% of floor).
    pub max_offer: u64,
}

impl PriceLimits {
    pub fn for_collection(cfg: &CollectionConfig, floor_sats: u64) -> Self {
        let floor = floor_sats as f64;
        let min_offer = btc_to_sats(cfg.min_bid).max((cfg.min_floor_bid * floor / 100.0).round() as u64);
        let max_offer = btc_to_sats(cfg.max_bid).min((cfg.max_floor_bid * floor / 100.0).round() as u64);
        Self { min_offer, max_offer }
    }
}

/// Price to place when countering a competitor at `top_price`.
///
/// Always strictly above the competitor: a zero configured margin still
/// produces a one-sat outbid.
pub fn outbid_price(top_price: u64, cfg: &CollectionConfig) -> u64 {
    top_price + cfg.out_bid_margin_sats()
}

/// Why a bid (or a whole configuration) was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum BidRejection {
    /// Computed price is zero or negative.
    NonPositivePrice,
    /// Price exceeds the effective max offer.
    AboveMaxOffer { price: u64, max_offer: u64 },
    /// COLLECTION offers must stay strictly below the floor.
    AtOrAboveFloor { price: u64, floor: u64 },
    /// Non-trait ITEM/COLLECTION configs may not bid above the floor.
    FloorCapExceeded { max_floor_bid: f64 },
}

impl fmt::Display for BidRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BidRejection::NonPositivePrice => write!(f, "bid price must be positive"),
            BidRejection::AboveMaxOffer { price, max_offer } => {
                write!(f, "bid {} sats exceeds max offer {} sats", price, max_offer)
            }
            BidRejection::AtOrAboveFloor { price, floor } => {
                write!(f, "collection bid {} sats not below floor {} sats", price, floor)
            }
            BidRejection::FloorCapExceeded { max_floor_bid } => {
                write!(f, "maxFloorBid {}% above 100% without trait filters", max_floor_bid)
            }
        }
    }
}

impl std::error::Error for BidRejection {}

/// Configuration-level floor-cap gate.
///
/// A trait-less ITEM or COLLECTION config with `maxFloorBid > 100` would
/// let the bot bid above the floor and buy instantly; reject it outright.
pub fn check_floor_cap(cfg: &CollectionConfig) -> Result<(), BidRejection> {
    let trait_scoped = !cfg.traits.is_empty();
    match cfg.offer_type {
        OfferType::Item | OfferType::Collection if !trait_scoped && cfg.max_floor_bid > 100.0 => {
            Err(BidRejection::FloorCapExceeded {
                max_floor_bid: cfg.max_floor_bid,
            })
        }
        _ => Ok(()),
    }
}

/// Per-bid safety gates, applied after price computation.
pub fn check_bid(
    cfg: &CollectionConfig,
    price: u64,
    floor_sats: u64,
    limits: &PriceLimits,
) -> Result<(), BidRejection> {
    if price == 0 {
        return Err(BidRejection::NonPositivePrice);
    }
    if price > limits.max_offer {
        return Err(BidRejection::AboveMaxOffer {
            price,
            max_offer: limits.max_offer,
        });
    }
    if cfg.offer_type == OfferType::Collection && price >= floor_sats {
        return Err(BidRejection::AtOrAboveFloor {
            price,
            floor: floor_sats,
        });
    }
    Ok(())
}
