//! Fine-grained locks serializing concurrent work on shared subjects.
//!
//! `TokenLockMap` gives FIFO mutual exclusion per token id so two tasks
//! never evaluate or bid the same token at once. `QuantityLockMap`
//! serializes increments of a collection's items-won counter.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::warn;

/// Locks held longer than this are considered abandoned and reclaimed.
const STALE_LOCK_MS: u64 = 60_000;

/// How long one quantity-lock retry waits on the current holder.
const QUANTITY_RETRY_WAIT: Duration = Duration::from_millis(200);

/// Bounded retries before giving up on the quantity lock.
const QUANTITY_MAX_RETRIES: usize = 10;

pub struct TokenLockMap {
    stale_after: Duration,
    inner: Mutex<HashMap<String, LockEntry>>,
}

struct LockEntry {
    acquired_at: Instant,
    /// Resumption handles, FIFO. Each release hands the lock to the
    /// front waiter or deletes the entry.
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Default for TokenLockMap {
    fn default() -> Self {
        Self::with_stale_after(Duration::from_millis(STALE_LOCK_MS))
    }
}

impl TokenLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            stale_after,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `token_id`, queueing FIFO behind the current
    /// holder. Returns `true` once the caller holds the lock.
    ///
    /// A holder that exceeds the stale timeout is forcibly reclaimed so
    /// one crashed task cannot wedge a token forever.
    pub async fn acquire(&self, token_id: &str) -> bool {
        let rx = {
            let mut map = self.inner.lock();
            match map.entry(token_id.to_string()) {
                Entry::Vacant(entry) => {
                    entry.insert(LockEntry {
                        acquired_at: Instant::now(),
                        waiters: VecDeque::new(),
                    });
                    return true;
                }
                Entry::Occupied(mut entry) => {
                    let lock = entry.get_mut();
                    if lock.acquired_at.elapsed() >= self.stale_after {
                        warn!(token_id, "reclaiming stale token lock");
                        lock.acquired_at = Instant::now();
                        return true;
                    }
                    let (tx, rx) = oneshot::channel();
                    lock.waiters.push_back(tx);
                    rx
                }
            }
        };
        rx.await.is_ok()
    }

    /// Hand the lock to the next waiter, or delete the entry when the
    /// queue is empty. Releasing an unheld token is a no-op.
    pub fn release(&self, token_id: &str) {
        let mut map = self.inner.lock();
        let Some(lock) = map.get_mut(token_id) else {
            return;
        };
        while let Some(waiter) = lock.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                lock.acquired_at = Instant::now();
                return;
            }
            // Waiter gave up (task cancelled); try the next one.
        }
        map.remove(token_id);
    }

    /// Number of currently held token locks. Diagnostic.
    pub fn held(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Per-collection mutex serializing items-won counter updates.
#[derive(Default)]
pub struct QuantityLockMap {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuantityLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the collection's quantity lock, retrying a bounded number
    /// of times; each retry awaits the current holder.
    ///
    /// Returns `None` on exhaustion. Callers then read the current value
    /// instead of incrementing: losing one increment is recoverable, a
    /// double increment is not.
    pub async fn acquire(&self, collection_symbol: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(collection_symbol.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        for attempt in 1..=QUANTITY_MAX_RETRIES {
            match tokio::time::timeout(QUANTITY_RETRY_WAIT, mutex.clone().lock_owned()).await {
                Ok(guard) => return Some(guard),
                Err(_) if attempt < QUANTITY_MAX_RETRIES => continue,
                Err(_) => {
                    warn!(
                        collection_symbol,
                        attempts = QUANTITY_MAX_RETRIES,
                        "quantity lock contention exhausted retries"
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_uncontended_acquire_release() {
        let locks = TokenLockMap::new();
        assert!(locks.acquire("t1").await);
        assert_eq!(locks.held(), 1);
        locks.release("t1");
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn test_waiters_resume_in_fifo_order() {
        let locks = Arc::new(TokenLockMap::new());
        assert!(locks.acquire("t1").await);

        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        for name in ["a", "b", "c"] {
            let locks = locks.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                assert!(locks.acquire("t1").await);
                tx.send(name).unwrap();
            });
            // Give each task time to enqueue before the next arrives.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        locks.release("t1");
        assert_eq!(rx.recv().await, Some("a"));
        locks.release("t1");
        assert_eq!(rx.recv().await, Some("b"));
        locks.release("t1");
        assert_eq!(rx.recv().await, Some("c"));
        locks.release("t1");
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn test_independent_tokens_do_not_contend() {
        let locks = TokenLockMap::new();
        assert!(locks.acquire("t1").await);
        assert!(locks.acquire("t2").await);
        assert_eq!(locks.held(), 2);
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let locks = TokenLockMap::with_stale_after(Duration::from_millis(30));
        assert!(locks.acquire("t1").await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Holder never released; a new caller takes the lock anyway.
        let reclaimed =
            tokio::time::timeout(Duration::from_millis(100), locks.acquire("t1")).await;
        assert_eq!(reclaimed.unwrap(), true);
    }

    #[tokio::test]
    async fn test_release_of_unheld_token_is_noop() {
        let locks = TokenLockMap::new();
        locks.release("never-held");
        assert_eq!(locks.held(), 0);
    }

    #[tokio::test]
    async fn test_quantity_lock_serializes_increments() {
        let locks = Arc::new(QuantityLockMap::new());
        let counter = Arc::new(Mutex::new(0u64));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let guard = locks.acquire("frogs").await;
                assert!(guard.is_some());
                let mut c = counter.lock();
                *c += 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock(), 10);
    }
}
