// SPDX-License-Identifier: MIT OR Apache-2.0
//! Striped store of exclusive per-key locks.
//!
//! Keys map onto a fixed number of stripes by hash. Each stripe guards its
//! slice of the lock table with one mutex and parks waiters on one condition
//! variable, so a release only wakes threads contending keys of the same
//! stripe. The container is the only place ownership changes: the
//! check-and-set for a key happens under its stripe mutex.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{LockError, Result},
    transaction::LockOwner,
    Key,
};

/// Fallback horizon when `now + timeout` overflows.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Result of a bounded acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    TimedOut,
}

impl LockOutcome {
    pub fn is_granted(self) -> bool {
        self == LockOutcome::Granted
    }
}

/// Shared interrupt flag for a blocked caller.
///
/// Raising it through [`LockContainer::interrupt`] wakes every waiter; the
/// waiter owning the flag consumes it and fails with
/// [`LockError::Interrupted`].
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// A held lock.
#[derive(Debug, Clone)]
pub struct LockRecord {
    pub owner: LockOwner,
    pub acquired_at: Instant,
}

#[derive(Debug, Default)]
struct Stripe {
    locks: Mutex<HashMap<Key, LockRecord>>,
    released: Condvar,
}

/// Keyed store of exclusive, owner-reentrant locks.
#[derive(Debug)]
pub struct LockContainer {
    stripes: Box<[Stripe]>,
    mask: usize,
}

impl LockContainer {
    /// Create a container with `concurrency_level` stripes, rounded up to a power of two.
    pub fn new(concurrency_level: usize) -> Self {
        let count = concurrency_level.max(1).next_power_of_two();
        let stripes: Vec<Stripe> = (0..count).map(|_| Stripe::default()).collect();
        Self {
            stripes: stripes.into_boxed_slice(),
            mask: count - 1,
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe(&self, key: &str) -> &Stripe {
        let hash = crc32fast::hash(key.as_bytes()) as usize;
        &self.stripes[hash & self.mask]
    }

    /// Acquire `key` for `owner`, blocking up to `timeout`.
    ///
    /// Re-acquiring a key the owner already holds is granted immediately.
    /// An interrupt raised on `interrupt` before or during the wait is
    /// consumed and reported as [`LockError::Interrupted`].
    pub fn acquire(
        &self,
        owner: &LockOwner,
        key: &Key,
        timeout: Duration,
        interrupt: &InterruptFlag,
    ) -> Result<LockOutcome> {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let stripe = self.stripe(key);
        let mut locks = stripe.locks.lock();

        loop {
            if interrupt.take() {
                return Err(LockError::Interrupted { key: key.clone() });
            }

            match locks.get(key) {
                None => {
                    locks.insert(
                        key.clone(),
                        LockRecord {
                            owner: owner.clone(),
                            acquired_at: Instant::now(),
                        },
                    );
                    return Ok(LockOutcome::Granted);
                },
                Some(record) if &record.owner == owner => return Ok(LockOutcome::Granted),
                Some(_) => {},
            }

            if Instant::now() >= deadline {
                return Ok(LockOutcome::TimedOut);
            }

            stripe.released.wait_until(&mut locks, deadline);
        }
    }

    /// Acquire without blocking.
    pub fn try_acquire(&self, owner: &LockOwner, key: &Key) -> bool {
        let mut locks = self.stripe(key).locks.lock();
        match locks.get(key) {
            None => {
                locks.insert(
                    key.clone(),
                    LockRecord {
                        owner: owner.clone(),
                        acquired_at: Instant::now(),
                    },
                );
                true
            },
            Some(record) => &record.owner == owner,
        }
    }

    /// Release `key` if `owner` holds it. Returns whether a lock was released.
    pub fn release(&self, owner: &LockOwner, key: &Key) -> bool {
        let stripe = self.stripe(key);
        let mut locks = stripe.locks.lock();
        let held = locks.get(key).is_some_and(|record| &record.owner == owner);
        if held {
            locks.remove(key);
            stripe.released.notify_all();
        }
        held
    }

    /// Current owner of `key`, if any.
    pub fn owner(&self, key: &Key) -> Option<LockOwner> {
        self.stripe(key)
            .locks
            .lock()
            .get(key)
            .map(|record| record.owner.clone())
    }

    pub fn record(&self, key: &Key) -> Option<LockRecord> {
        self.stripe(key).locks.lock().get(key).cloned()
    }

    pub fn is_locked(&self, key: &Key) -> bool {
        self.stripe(key).locks.lock().contains_key(key)
    }

    pub fn owns_lock(&self, key: &Key, owner: &LockOwner) -> bool {
        self.stripe(key)
            .locks
            .lock()
            .get(key)
            .is_some_and(|record| &record.owner == owner)
    }

    /// Number of keys currently locked.
    pub fn lock_count(&self) -> usize {
        self.stripes.iter().map(|s| s.locks.lock().len()).sum()
    }

    /// Every key `owner` holds. Scans all stripes.
    pub fn keys_owned_by(&self, owner: &LockOwner) -> Vec<Key> {
        let mut keys = Vec::new();
        for stripe in self.stripes.iter() {
            let locks = stripe.locks.lock();
            keys.extend(
                locks
                    .iter()
                    .filter(|(_, record)| &record.owner == owner)
                    .map(|(key, _)| key.clone()),
            );
        }
        keys.sort();
        keys
    }

    /// Raise `flag` and wake all waiters so its owner observes it.
    pub fn interrupt(&self, flag: &InterruptFlag) {
        flag.raise();
        for stripe in self.stripes.iter() {
            // Taking the mutex orders the raise before any waiter's next check.
            let _guard = stripe.locks.lock();
            stripe.released.notify_all();
        }
    }
}

impl Default for LockContainer {
    fn default() -> Self {
        Self::new(32)
    }
}
