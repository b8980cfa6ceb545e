//! Funding wallet management: per-wallet bid budgets, group bindings,
//! and the on-disk (optionally encrypted) wallet configuration.

pub mod file;
pub mod groups;
pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::shutdown::Shutdown;
use file::WalletsFile;
use groups::{WalletGroupManager, WalletGroupsSnapshot};
use pool::{WalletHandle, WalletPool, WalletPoolSnapshot};

/// Wallet selection seam used by the scheduler and counter-bid paths.
///
/// Grouped configurations route per collection; a flat configuration is
/// one shared pool.
pub enum WalletSelector {
    Flat(Arc<WalletPool>),
    Grouped(Arc<WalletGroupManager>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WalletSelectorSnapshot {
    Flat { pool: WalletPoolSnapshot },
    Grouped { groups: WalletGroupsSnapshot },
}

impl WalletSelector {
    /// Build from the parsed wallet file. `default_bids_per_minute`
    /// applies where the file leaves the budget unset.
    pub fn from_file(
        file: WalletsFile,
        default_bids_per_minute: u32,
        shutdown: Shutdown,
    ) -> Result<Self> {
        file.validate()?;
        match file {
            WalletsFile::Flat {
                wallets,
                bids_per_minute,
            } => {
                let handles: Vec<WalletHandle> =
                    wallets.into_iter().map(|w| w.into_handle()).collect();
                let pool = WalletPool::new(
                    handles,
                    bids_per_minute.unwrap_or(default_bids_per_minute),
                    shutdown,
                );
                Ok(WalletSelector::Flat(Arc::new(pool)))
            }
            WalletsFile::Grouped {
                groups,
                default_group,
                ..
            } => {
                let mut pools = HashMap::new();
                let mut bindings = HashMap::new();
                for (name, group) in groups {
                    for symbol in &group.collections {
                        bindings.insert(symbol.clone(), name.clone());
                    }
                    let handles: Vec<WalletHandle> =
                        group.wallets.into_iter().map(|w| w.into_handle()).collect();
                    let pool = WalletPool::new(
                        handles,
                        group.bids_per_minute.unwrap_or(default_bids_per_minute),
                        shutdown.clone(),
                    );
                    pools.insert(name, Arc::new(pool));
                }
                let manager = WalletGroupManager::new(pools, bindings, default_group);
                Ok(WalletSelector::Grouped(Arc::new(manager)))
            }
        }
    }

    /// Pool funding bids for this collection.
    pub fn pool_for(&self, collection_symbol: &str) -> Arc<WalletPool> {
        match self {
            WalletSelector::Flat(pool) => pool.clone(),
            WalletSelector::Grouped(mgr) => mgr.pool_for_collection(collection_symbol),
        }
    }

    pub fn total_wallets(&self) -> usize {
        match self {
            WalletSelector::Flat(pool) => pool.len(),
            WalletSelector::Grouped(mgr) => mgr.total_wallets(),
        }
    }

    /// Global pacer capacity: summed per-wallet budgets.
    pub fn capacity_per_minute(&self) -> usize {
        match self {
            WalletSelector::Flat(pool) => pool.capacity_per_minute(),
            WalletSelector::Grouped(mgr) => mgr.capacity_per_minute(),
        }
    }

    /// Whether `address` is one of our payment or receive addresses.
    pub fn owns_address(&self, address: &str) -> bool {
        match self {
            WalletSelector::Flat(pool) => pool.owns_address(address),
            WalletSelector::Grouped(mgr) => mgr.owns_address(address),
        }
    }

    pub fn decrement_bid_count(&self, payment_address: &str) {
        match self {
            WalletSelector::Flat(pool) => pool.decrement_bid_count(payment_address),
            WalletSelector::Grouped(mgr) => mgr.decrement_bid_count(payment_address),
        }
    }

    pub fn disable_for_window(&self, payment_address: &str) {
        match self {
            WalletSelector::Flat(pool) => pool.disable_for_window(payment_address),
            WalletSelector::Grouped(mgr) => mgr.disable_for_window(payment_address),
        }
    }

    pub fn snapshot(&self) -> WalletSelectorSnapshot {
        match self {
            WalletSelector::Flat(pool) => WalletSelectorSnapshot::Flat {
                pool: pool.snapshot(),
            },
            WalletSelector::Grouped(mgr) => WalletSelectorSnapshot::Grouped {
                groups: mgr.snapshot(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_selector_from_file() {
        let json = r#"{
            "wallets": [
                {"label": "w0", "wif": "k0", "paymentAddress": "bc1q0", "receiveAddress": "bc1p0"},
                {"label": "w1", "wif": "k1", "paymentAddress": "bc1q1", "receiveAddress": "bc1p1"}
            ]
        }"#;
        let file: WalletsFile = serde_json::from_str(json).unwrap();
        let selector = WalletSelector::from_file(file, 10, Shutdown::new()).unwrap();
        assert_eq!(selector.total_wallets(), 2);
        assert_eq!(selector.capacity_per_minute(), 20);
        assert!(selector.owns_address("bc1q1"));
    }

    #[test]
    fn test_grouped_selector_routes_by_collection() {
        let json = r#"{
            "groups": {
                "hot": {
                    "wallets": [
                        {"label": "h0", "wif": "k", "paymentAddress": "q-h0", "receiveAddress": "p-h0"},
                        {"label": "h1", "wif": "k", "paymentAddress": "q-h1", "receiveAddress": "p-h1"}
                    ],
                    "bidsPerMinute": 4,
                    "collections": ["bitcoin-frogs"]
                },
                "main": {
                    "wallets": [
                        {"label": "m0", "wif": "k", "paymentAddress": "q-m0", "receiveAddress": "p-m0"}
                    ]
                }
            },
            "defaultGroup": "main"
        }"#;
        let file: WalletsFile = serde_json::from_str(json).unwrap();
        let selector = WalletSelector::from_file(file, 6, Shutdown::new()).unwrap();

        assert_eq!(selector.pool_for("bitcoin-frogs").len(), 2);
        assert_eq!(selector.pool_for("anything-else").len(), 1);
        // hot: 2 x 4, main: 1 x 6 (default applied)
        assert_eq!(selector.capacity_per_minute(), 14);
    }
}
