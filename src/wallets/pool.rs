//! Per-wallet bid budgets over a rolling 60 second window.
//!
//! Each wallet may place at most `bids_per_minute` bids per window.
//! Acquisition pre-increments the counter so concurrent callers cannot
//! both take the last slot; a bid that never goes out is undone with
//! `decrement_bid_count`.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::shutdown::Shutdown;

/// Rolling window length for per-wallet budgets.
const WALLET_WINDOW: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a wallet to free up.
const WAIT_POLL: Duration = Duration::from_millis(250);

/// Identity of a funding wallet handed to bid placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletHandle {
    pub label: String,
    /// Segwit v0 payment address; bids are funded from here.
    pub payment_address: String,
    /// Taproot receive address for won items.
    pub receive_address: String,
    /// Opaque signing-key material; consumed by the external signer.
    pub wif: String,
}

struct WalletState {
    handle: WalletHandle,
    bids_in_window: u32,
    window_start: Instant,
    /// `None` until first use; never-used wallets win LRU selection.
    last_used: Option<Instant>,
}

impl WalletState {
    fn reset_if_expired(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WALLET_WINDOW {
            self.bids_in_window = 0;
            self.window_start = now;
        }
    }
}

pub struct WalletPool {
    bids_per_minute: u32,
    wallets: Mutex<Vec<WalletState>>,
    shutdown: Shutdown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSnapshot {
    pub label: String,
    pub payment_address: String,
    pub bids_in_window: u32,
    pub window_remaining_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletPoolSnapshot {
    pub bids_per_minute: u32,
    pub wallets: Vec<WalletSnapshot>,
}

impl WalletPool {
    pub fn new(handles: Vec<WalletHandle>, bids_per_minute: u32, shutdown: Shutdown) -> Self {
        let now = Instant::now();
        let wallets = handles
            .into_iter()
            .map(|handle| WalletState {
                handle,
                bids_in_window: 0,
                window_start: now,
                last_used: None,
            })
            .collect();
        Self {
            bids_per_minute: bids_per_minute.max(1),
            wallets: Mutex::new(wallets),
            shutdown,
        }
    }

    pub fn len(&self) -> usize {
        self.wallets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bids_per_minute(&self) -> u32 {
        self.bids_per_minute
    }

    /// This pool's contribution to the global pacer capacity.
    pub fn capacity_per_minute(&self) -> usize {
        self.len() * self.bids_per_minute as usize
    }

    /// Take the least-recently-used wallet under its window cap,
    /// pre-incrementing its counter. `None` when every wallet is
    /// saturated for the current window.
    pub fn acquire(&self) -> Option<WalletHandle> {
        let now = Instant::now();
        let mut wallets = self.wallets.lock();

        for wallet in wallets.iter_mut() {
            wallet.reset_if_expired(now);
        }

        let cap = self.bids_per_minute;
        let candidate = wallets
            .iter_mut()
            .filter(|w| w.bids_in_window < cap)
            .min_by_key(|w| w.last_used)?;

        candidate.bids_in_window += 1;
        candidate.last_used = Some(now);
        debug!(
            label = %candidate.handle.label,
            bids_in_window = candidate.bids_in_window,
            "wallet acquired"
        );
        Some(candidate.handle.clone())
    }

    /// Block until some wallet frees up (or the window rolls). Fails on
    /// shutdown.
    pub async fn wait_for_available(&self) -> Result<WalletHandle> {
        loop {
            if let Some(handle) = self.acquire() {
                return Ok(handle);
            }
            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL) => {}
                _ = self.shutdown.wait() => bail!("wallet pool shutting down"),
            }
        }
    }

    /// Legacy path: count a bid against the wallet owning `payment_address`.
    pub fn record_bid(&self, payment_address: &str) {
        let now = Instant::now();
        let mut wallets = self.wallets.lock();
        if let Some(wallet) = find_by_payment(&mut wallets, payment_address) {
            wallet.reset_if_expired(now);
            wallet.bids_in_window = (wallet.bids_in_window + 1).min(self.bids_per_minute);
            wallet.last_used = Some(now);
        }
    }

    /// Undo a pre-increment for a bid that was never placed. Never goes
    /// below zero.
    pub fn decrement_bid_count(&self, payment_address: &str) {
        let mut wallets = self.wallets.lock();
        if let Some(wallet) = find_by_payment(&mut wallets, payment_address) {
            wallet.bids_in_window = wallet.bids_in_window.saturating_sub(1);
        }
    }

    /// Saturate the wallet for the remainder of its current window
    /// (remote 429: the marketplace already refused it).
    pub fn disable_for_window(&self, payment_address: &str) {
        let mut wallets = self.wallets.lock();
        if let Some(wallet) = find_by_payment(&mut wallets, payment_address) {
            wallet.bids_in_window = self.bids_per_minute;
        }
    }

    pub fn get_by_payment_address(&self, address: &str) -> Option<WalletHandle> {
        self.wallets
            .lock()
            .iter()
            .find(|w| w.handle.payment_address.eq_ignore_ascii_case(address))
            .map(|w| w.handle.clone())
    }

    pub fn get_by_receive_address(&self, address: &str) -> Option<WalletHandle> {
        self.wallets
            .lock()
            .iter()
            .find(|w| w.handle.receive_address.eq_ignore_ascii_case(address))
            .map(|w| w.handle.clone())
    }

    /// True when `address` matches any of our payment or receive addresses.
    pub fn owns_address(&self, address: &str) -> bool {
        self.wallets.lock().iter().any(|w| {
            w.handle.payment_address.eq_ignore_ascii_case(address)
                || w.handle.receive_address.eq_ignore_ascii_case(address)
        })
    }

    /// Diagnostic/test helper: clear every wallet's window.
    pub fn reset_all_windows(&self) {
        let now = Instant::now();
        let mut wallets = self.wallets.lock();
        for wallet in wallets.iter_mut() {
            wallet.bids_in_window = 0;
            wallet.window_start = now;
        }
    }

    pub fn snapshot(&self) -> WalletPoolSnapshot {
        let now = Instant::now();
        let wallets = self.wallets.lock();
        WalletPoolSnapshot {
            bids_per_minute: self.bids_per_minute,
            wallets: wallets
                .iter()
                .map(|w| {
                    let elapsed = now.duration_since(w.window_start);
                    WalletSnapshot {
                        label: w.handle.label.clone(),
                        payment_address: w.handle.payment_address.clone(),
                        bids_in_window: w.bids_in_window,
                        window_remaining_ms: WALLET_WINDOW
                            .saturating_sub(elapsed)
                            .as_millis() as u64,
                    }
                })
                .collect(),
        }
    }
}

fn find_by_payment<'a>(
    wallets: &'a mut [WalletState],
    payment_address: &str,
) -> Option<&'a mut WalletState> {
    wallets
        .iter_mut()
        .find(|w| w.handle.payment_address.eq_ignore_ascii_case(payment_address))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_handles(n: usize) -> Vec<WalletHandle> {
        (0..n)
            .map(|i| WalletHandle {
                label: format!("w{}", i),
                payment_address: format!("bc1q-pay-{}", i),
                receive_address: format!("bc1p-recv-{}", i),
                wif: format!("wif-{}", i),
            })
            .collect()
    }

    fn pool(n: usize, per_minute: u32) -> WalletPool {
        WalletPool::new(test_handles(n), per_minute, Shutdown::new())
    }

    #[test]
    fn test_acquire_exhausts_at_cap() {
        let pool = pool(2, 2);
        for _ in 0..4 {
            assert!(pool.acquire().is_some());
        }
        assert!(pool.acquire().is_none(), "all wallets saturated");
    }

    #[test]
    fn test_acquire_rotates_least_recently_used() {
        let pool = pool(3, 10);
        let first = pool.acquire().unwrap();
        let second = pool.acquire().unwrap();
        let third = pool.acquire().unwrap();
        assert_ne!(first.label, second.label);
        assert_ne!(second.label, third.label);
        assert_ne!(first.label, third.label);

        // Fourth acquisition cycles back to the least recently used.
        let fourth = pool.acquire().unwrap();
        assert_eq!(fourth.label, first.label);
    }

    #[test]
    fn test_decrement_restores_capacity() {
        let pool = pool(1, 1);
        let handle = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.decrement_bid_count(&handle.payment_address);
        assert!(pool.acquire().is_some());

        // Never goes below zero.
        pool.decrement_bid_count(&handle.payment_address);
        pool.decrement_bid_count(&handle.payment_address);
    }

    #[test]
    fn test_disable_for_window_saturates_wallet() {
        let pool = pool(1, 5);
        let handle = pool.acquire().unwrap();
        pool.disable_for_window(&handle.payment_address);
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_address_lookup_is_case_insensitive() {
        let pool = pool(1, 1);
        assert!(pool.get_by_payment_address("BC1Q-PAY-0").is_some());
        assert!(pool.get_by_receive_address("BC1P-RECV-0").is_some());
        assert!(pool.owns_address("bc1q-pay-0"));
        assert!(pool.owns_address("BC1P-RECV-0"));
        assert!(!pool.owns_address("bc1q-somebody-else"));
    }

    #[test]
    fn test_reset_all_windows() {
        let pool = pool(1, 1);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
        pool.reset_all_windows();
        assert!(pool.acquire().is_some());
    }

    #[tokio::test]
    async fn test_wait_for_available_aborts_on_shutdown() {
        let shutdown = Shutdown::new();
        let pool = std::sync::Arc::new(WalletPool::new(test_handles(1), 1, shutdown.clone()));
        pool.acquire().unwrap();

        let waiter = pool.clone();
        let handle = tokio::spawn(async move { waiter.wait_for_available().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("wait should abort")
            .unwrap();
        assert!(result.is_err());
    }
}
