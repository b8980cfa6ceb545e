//! Wallet groups bound to collections.
//!
//! A grouped configuration partitions the funding wallets so hot
//! collections cannot starve the rest of the fleet. Selection resolves
//! the collection's bound group first, then the default group.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use super::pool::{WalletPool, WalletPoolSnapshot};

pub struct WalletGroupManager {
    groups: HashMap<String, Arc<WalletPool>>,
    /// collection symbol -> group name. Uniqueness enforced at load.
    bindings: HashMap<String, String>,
    default_group: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletGroupsSnapshot {
    pub default_group: String,
    pub groups: HashMap<String, WalletPoolSnapshot>,
    pub bindings: HashMap<String, String>,
}

impl WalletGroupManager {
    pub fn new(
        groups: HashMap<String, Arc<WalletPool>>,
        bindings: HashMap<String, String>,
        default_group: String,
    ) -> Self {
        Self {
            groups,
            bindings,
            default_group,
        }
    }

    /// Pool for this collection: its bound group, else the default group.
    pub fn pool_for_collection(&self, collection_symbol: &str) -> Arc<WalletPool> {
        let name = self
            .bindings
            .get(collection_symbol)
            .unwrap_or(&self.default_group);
        self.groups
            .get(name)
            .unwrap_or_else(|| &self.groups[&self.default_group])
            .clone()
    }

    pub fn total_wallets(&self) -> usize {
        self.groups.values().map(|p| p.len()).sum()
    }

    /// Summed pacer capacity across active groups.
    pub fn capacity_per_minute(&self) -> usize {
        self.groups.values().map(|p| p.capacity_per_minute()).sum()
    }

    pub fn owns_address(&self, address: &str) -> bool {
        self.groups.values().any(|p| p.owns_address(address))
    }

    pub fn decrement_bid_count(&self, payment_address: &str) {
        for pool in self.groups.values() {
            pool.decrement_bid_count(payment_address);
        }
    }

    pub fn disable_for_window(&self, payment_address: &str) {
        for pool in self.groups.values() {
            if pool.get_by_payment_address(payment_address).is_some() {
                pool.disable_for_window(payment_address);
            }
        }
    }

    pub fn snapshot(&self) -> WalletGroupsSnapshot {
        WalletGroupsSnapshot {
            default_group: self.default_group.clone(),
            groups: self
                .groups
                .iter()
                .map(|(name, pool)| (name.clone(), pool.snapshot()))
                .collect(),
            bindings: self.bindings.clone(),
        }
    }
}
