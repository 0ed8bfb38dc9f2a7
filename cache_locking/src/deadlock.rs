// SPDX-License-Identifier: MIT OR Apache-2.0
//! Early deadlock detection for transactional lock acquisition.
//!
//! # Overview
//!
//! Instead of blocking for the whole lock timeout, a transactional caller
//! spins: it tries the lock for a short `spin_duration`, and whenever that
//! slice expires it looks at the current owner of the key and asks whether
//! the two transactions form a cycle. Only the transaction that would lose
//! the coin toss against the owner runs the cycle checks, so the two sides of
//! one cycle can never both abort: the winner keeps spinning until the loser
//! rolls back and releases its locks.
//!
//! ```text
//!   caller (thisTx)                      LockContainer
//!   ---------------                      -------------
//!   lock_intention = key
//!   loop until deadline:
//!     acquire(key, spin) ------------->  granted? --> clear intention, done
//!     owner(key) <--------------------   current owner
//!       Plain owner       -> unresolvable++, spin again
//!       Transactional(o)  -> thisTx.would_lose(o)?
//!                              no  -> spin again
//!                              yes -> direct | cross-node | same-key cycle?
//!                                       yes -> DeadlockDetected
//!   deadline passed -> TimedOut
//! ```
//!
//! # Cycle patterns
//!
//! | Pattern | Condition |
//! |---------|-----------|
//! | Direct | the owner is blocked on a key this transaction holds here |
//! | Cross-node | the owner is a local leg trying to lock, on replicas, a key this transaction already holds at its origin |
//! | Same-key | this local leg already holds the key through one of its remote legs while another transaction's remote leg holds it here |
//!
//! The owner read after a failed attempt is racy: the lock may change hands
//! between the attempt and the check. A stale read costs one more spin; the
//! container alone decides who holds a key.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    context::InvocationContext,
    error::{LockError, Result},
    lock_container::{LockContainer, LockOutcome, FAR_FUTURE},
    lock_manager::ConflictResolver,
    transaction::{GlobalTransaction, LockOwner},
    Key,
};

/// Which cycle shape confirmed a deadlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePattern {
    Direct,
    CrossNode,
    SameKey,
}

/// Deadlock counters exposed for management.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Locally originated transactions stopped by a deadlock.
    local_deadlocks: AtomicU64,
    /// Remote legs stopped by a deadlock.
    remote_deadlocks: AtomicU64,
    /// Times the key owner was not a transaction, so detection could not run.
    unresolvable_owners: AtomicU64,
}

impl DeadlockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_deadlock(&self, remote: bool) {
        if remote {
            self.remote_deadlocks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.local_deadlocks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_unresolvable(&self) {
        self.unresolvable_owners.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_deadlocks(&self) -> u64 {
        self.local_deadlocks.load(Ordering::Relaxed)
    }

    pub fn remote_deadlocks(&self) -> u64 {
        self.remote_deadlocks.load(Ordering::Relaxed)
    }

    pub fn total_deadlocks(&self) -> u64 {
        self.local_deadlocks() + self.remote_deadlocks()
    }

    pub fn unresolvable_owners(&self) -> u64 {
        self.unresolvable_owners.load(Ordering::Relaxed)
    }

    /// Zero all counters.
    pub fn reset(&self) {
        self.local_deadlocks.store(0, Ordering::Relaxed);
        self.remote_deadlocks.store(0, Ordering::Relaxed);
        self.unresolvable_owners.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeadlockStatsSnapshot {
        let local = self.local_deadlocks();
        let remote = self.remote_deadlocks();
        DeadlockStatsSnapshot {
            total_deadlocks: local + remote,
            local_deadlocks: local,
            remote_deadlocks: remote,
            unresolvable_owners: self.unresolvable_owners(),
        }
    }
}

/// Point-in-time snapshot of deadlock counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockStatsSnapshot {
    pub total_deadlocks: u64,
    pub local_deadlocks: u64,
    pub remote_deadlocks: u64,
    pub unresolvable_owners: u64,
}

/// Clears the lock intention on every exit from the spin loop.
struct IntentionGuard<'a>(&'a GlobalTransaction);

impl Drop for IntentionGuard<'_> {
    fn drop(&mut self) {
        self.0.clear_lock_intention();
    }
}

/// Spin-and-check acquisition for transactional callers.
#[derive(Debug)]
pub struct DeadlockDetectingResolver {
    spin_duration: Duration,
    expose_statistics: bool,
    stats: DeadlockStats,
}

impl DeadlockDetectingResolver {
    pub fn new(spin_duration: Duration, expose_statistics: bool) -> Self {
        Self {
            spin_duration,
            expose_statistics,
            stats: DeadlockStats::new(),
        }
    }

    pub fn spin_duration(&self) -> Duration {
        self.spin_duration
    }

    pub fn stats(&self) -> &DeadlockStats {
        &self.stats
    }

    fn acquire_transactional(
        &self,
        container: &LockContainer,
        key: &Key,
        ctx: &InvocationContext,
        this_tx: &GlobalTransaction,
        timeout: Duration,
    ) -> Result<LockOutcome> {
        let start = Instant::now();
        let deadline = start
            .checked_add(timeout)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let this_owner = ctx.lock_owner();

        this_tx.set_lock_intention(key.clone());
        let _intention = IntentionGuard(this_tx);
        tracing::trace!(key = %key, tx = %this_tx, "using early deadlock detection");

        loop {
            let slice = self
                .spin_duration
                .min(deadline.saturating_duration_since(Instant::now()));

            if container
                .acquire(this_owner, key, slice, ctx.interrupt_flag())?
                .is_granted()
            {
                tracing::trace!(key = %key, tx = %this_tx, "acquired lock while spinning");
                return Ok(LockOutcome::Granted);
            }

            match container.owner(key) {
                Some(LockOwner::Transactional(owner_tx)) => {
                    tracing::trace!(key = %key, tx = %this_tx, owner = %owner_tx, "key held by transaction");
                    if let Some(pattern) = detect_cycle(container, key, &owner_tx, this_tx, this_owner) {
                        if self.expose_statistics {
                            self.stats.record_deadlock(this_tx.is_remote());
                        }
                        tracing::debug!(
                            key = %key,
                            tx = %this_tx,
                            other = %owner_tx,
                            pattern = ?pattern,
                            "deadlock found and we shall not continue"
                        );
                        return Err(LockError::DeadlockDetected {
                            this_tx: this_tx.to_string(),
                            other_tx: owner_tx.to_string(),
                        });
                    }
                },
                Some(plain @ LockOwner::Plain(_)) => {
                    tracing::trace!(key = %key, owner = %plain, "not running deadlock detection, owner is not a transaction");
                    self.stats.record_unresolvable();
                },
                // Released since the attempt; try again.
                None => {},
            }

            if Instant::now() >= deadline {
                return Ok(LockOutcome::TimedOut);
            }
        }
    }
}

impl ConflictResolver for DeadlockDetectingResolver {
    fn acquire(
        &self,
        container: &LockContainer,
        key: &Key,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> Result<LockOutcome> {
        match ctx.global_transaction() {
            Some(this_tx) => self.acquire_transactional(container, key, ctx, this_tx, timeout),
            None => container.acquire(ctx.lock_owner(), key, timeout, ctx.interrupt_flag()),
        }
    }

    fn deadlock_stats(&self) -> Option<&DeadlockStats> {
        Some(&self.stats)
    }
}

/// Decide whether `this_tx`, blocked on `key` held by `owner_tx`, is the
/// losing side of a lock cycle.
///
/// Returns `None` straight away when `this_tx` wins the coin toss.
pub fn detect_cycle(
    container: &LockContainer,
    key: &Key,
    owner_tx: &GlobalTransaction,
    this_tx: &GlobalTransaction,
    this_owner: &LockOwner,
) -> Option<CyclePattern> {
    if !this_tx.would_lose(owner_tx) {
        tracing::trace!(tx = %this_tx, other = %owner_tx, "we win the coin toss, skipping cycle checks");
        return None;
    }

    if let Some(intention) = owner_tx.lock_intention() {
        if container.owns_lock(&intention, this_owner) {
            return Some(CyclePattern::Direct);
        }
    }

    if !owner_tx.is_remote() && this_tx.has_lock_at_origin(&owner_tx.remote_lock_intention()) {
        return Some(CyclePattern::CrossNode);
    }

    if !this_tx.is_remote() && owner_tx.is_remote() && this_tx.has_lock_on_replica(key) {
        return Some(CyclePattern::SameKey);
    }

    None
}
