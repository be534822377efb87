//! Nullifier replay guard
//!
//! Two layers. The fast filter is an in-process, fixed-capacity set that
//! catches same-nullifier races before any chain access; it is an
//! optimization only - not durable, not authoritative, and not safe across
//! instances. The canonical check is the existence of the on-chain
//! nullifier-record PDA, which is the only thing a multi-instance deployment
//! may rely on for correctness.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use solana_sdk::pubkey::Pubkey;

use crate::error::{RelayerError, RelayerResult};
use crate::gateway::{nullifier_address, LedgerGateway};

/// Default fast-filter capacity.
pub const CACHE_CAPACITY: usize = 10_000;

/// Swappable cache abstraction in front of the canonical on-chain check.
/// A multi-instance deployment can back this with a shared store.
pub trait NullifierCache: Send + Sync {
    fn contains(&self, nullifier: &[u8; 32]) -> bool;

    /// Insert if absent. Returns false (and does not insert) when the
    /// nullifier is already tracked.
    fn track(&self, nullifier: &[u8; 32]) -> bool;

    /// Release a reservation so a legitimate retry is not starved by a
    /// stale entry after a downstream failure.
    fn release(&self, nullifier: &[u8; 32]);
}

/// Fixed-capacity FIFO set: a ring of insertion order plus a hash set.
/// On overflow the oldest entry is evicted.
pub struct RingCache {
    inner: Mutex<RingCacheInner>,
    capacity: usize,
}

struct RingCacheInner {
    order: VecDeque<[u8; 32]>,
    present: HashSet<[u8; 32]>,
}

impl RingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingCacheInner {
                order: VecDeque::with_capacity(capacity),
                present: HashSet::with_capacity(capacity),
            }),
            capacity,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().present.len()
    }
}

impl Default for RingCache {
    fn default() -> Self {
        Self::new(CACHE_CAPACITY)
    }
}

impl NullifierCache for RingCache {
    fn contains(&self, nullifier: &[u8; 32]) -> bool {
        self.inner.lock().unwrap().present.contains(nullifier)
    }

    fn track(&self, nullifier: &[u8; 32]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.present.contains(nullifier) {
            return false;
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.present.remove(&oldest);
            }
        }
        inner.order.push_back(*nullifier);
        inner.present.insert(*nullifier);
        true
    }

    fn release(&self, nullifier: &[u8; 32]) {
        let mut inner = self.inner.lock().unwrap();
        if inner.present.remove(nullifier) {
            inner.order.retain(|n| n != nullifier);
        }
    }
}

/// Canonical on-chain replay check: the nullifier record PDA for
/// (pool, nullifier) exists if and only if the nullifier already backed a
/// successful claim.
pub fn check_onchain_unspent(
    gateway: &LedgerGateway,
    pool: &Pubkey,
    nullifier: &[u8; 32],
) -> RelayerResult<Pubkey> {
    let record = nullifier_address(pool, nullifier, &gateway.pool_program);
    if gateway.account_exists(&record)? {
        return Err(RelayerError::AlreadyClaimed);
    }
    Ok(record)
}
