//! Shared dependencies for the bidding paths.
//!
//! One context is built in main and cloned into the scheduler and the
//! counter-bid handler; each shared resource has exactly one owner and
//! is only reached through it.

use std::sync::Arc;

use chrono::Utc;

use crate::history::BidHistoryStore;
use crate::locks::{QuantityLockMap, TokenLockMap};
use crate::marketplace::Marketplace;
use crate::pacer::BidPacer;
use crate::shutdown::Shutdown;
use crate::stats::BidStats;
use crate::wallets::pool::WalletHandle;
use crate::wallets::WalletSelector;

/// Where won items are delivered.
#[derive(Debug, Clone)]
pub enum ReceivePolicy {
    /// Each wallet receives to its own taproot address.
    WalletOwn,
    /// All wins land on one configured address.
    Centralized(String),
}

impl ReceivePolicy {
    pub fn receive_address(&self, wallet: &WalletHandle) -> String {
        match self {
            ReceivePolicy::WalletOwn => wallet.receive_address.clone(),
            ReceivePolicy::Centralized(address) => address.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BidContext {
    pub marketplace: Arc<dyn Marketplace>,
    pub pacer: Arc<BidPacer>,
    pub wallets: Arc<WalletSelector>,
    pub history: Arc<BidHistoryStore>,
    pub token_locks: Arc<TokenLockMap>,
    pub quantity_locks: Arc<QuantityLockMap>,
    pub bid_stats: Arc<BidStats>,
    pub receive_policy: ReceivePolicy,
    pub shutdown: Shutdown,
}

impl BidContext {
    /// Bid expiration for a collection's configured duration (minutes).
    pub fn expiration_ms(duration_minutes: u64) -> i64 {
        Utc::now().timestamp_millis() + (duration_minutes as i64) * 60_000
    }
}
