//! UTXO reservation manager
//!
//! A process-wide lock table over receiver-owned coins. An entry carries no
//! payload: present means locked, absent means free, which reduces correctness
//! to the atomicity of the two operations below. Raw access to the underlying
//! set is never exposed.

use std::collections::HashSet;
use std::sync::Mutex;

use bitcoin::OutPoint;
use tracing::debug;

/// Mutually-exclusive lock table keyed by coin outpoint
#[derive(Debug, Default)]
pub struct UtxoLocks {
    locked: Mutex<HashSet<OutPoint>>,
}

impl UtxoLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically lock a coin. Returns `false` when it is already held.
    pub fn try_lock(&self, outpoint: OutPoint) -> bool {
        let mut locked = self.locked.lock().expect("utxo lock table poisoned");
        let acquired = locked.insert(outpoint);
        if acquired {
            debug!(%outpoint, "utxo locked");
        }
        acquired
    }

    /// Atomically release a coin. Returns `false` when it was already free;
    /// releasing twice is harmless, never an error.
    pub fn try_unlock(&self, outpoint: &OutPoint) -> bool {
        let mut locked = self.locked.lock().expect("utxo lock table poisoned");
        let released = locked.remove(outpoint);
        if released {
            debug!(%outpoint, "utxo unlocked");
        }
        released
    }

    /// Whether a coin is currently held
    pub fn is_locked(&self, outpoint: &OutPoint) -> bool {
        let locked = self.locked.lock().expect("utxo lock table poisoned");
        locked.contains(outpoint)
    }

    /// Number of coins currently held
    pub fn len(&self) -> usize {
        self.locked.lock().expect("utxo lock table poisoned").len()
    }

    /// Whether no coins are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every lock not claimed by a live owner. The recovery path for
    /// coins stranded by a crashed or timed-out negotiation: the caller passes
    /// the set of outpoints still legitimately held and everything else is
    /// freed. Returns the outpoints that were released.
    pub fn release_except(&self, keep: &HashSet<OutPoint>) -> Vec<OutPoint> {
        let mut locked = self.locked.lock().expect("utxo lock table poisoned");
        let stale: Vec<OutPoint> = locked.iter().filter(|op| !keep.contains(op)).copied().collect();
        for op in &stale {
            locked.remove(op);
            debug!(outpoint = %op, "stale utxo lock released");
        }
        stale
    }
}
