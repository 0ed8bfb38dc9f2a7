// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lock manager: the acquisition contract used by the rest of the cache.
//!
//! How a contended acquisition behaves is decided by a [`ConflictResolver`]
//! injected at construction. [`BlockingResolver`] waits for the full timeout;
//! [`crate::deadlock::DeadlockDetectingResolver`] spins in short slices and
//! checks for lock cycles between attempts.

use std::{fmt, sync::Arc, time::Duration};

use crate::{
    config::LockingConfig,
    context::InvocationContext,
    deadlock::{DeadlockDetectingResolver, DeadlockStats},
    error::{LockError, Result},
    lock_container::{LockContainer, LockOutcome},
    transaction::LockOwner,
    Key,
};

/// Strategy for acquiring a key that may be held by someone else.
pub trait ConflictResolver: Send + Sync + fmt::Debug {
    /// Acquire `key` for the context's owner within `timeout`.
    fn acquire(
        &self,
        container: &LockContainer,
        key: &Key,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> Result<LockOutcome>;

    /// Deadlock counters, when this strategy keeps any.
    fn deadlock_stats(&self) -> Option<&DeadlockStats> {
        None
    }
}

/// Plain blocking acquisition with no deadlock awareness.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingResolver;

impl ConflictResolver for BlockingResolver {
    fn acquire(
        &self,
        container: &LockContainer,
        key: &Key,
        ctx: &InvocationContext,
        timeout: Duration,
    ) -> Result<LockOutcome> {
        container.acquire(ctx.lock_owner(), key, timeout, ctx.interrupt_flag())
    }
}

/// Grants exclusive key locks to invocations.
#[derive(Debug)]
pub struct LockManager {
    container: Arc<LockContainer>,
    resolver: Box<dyn ConflictResolver>,
    default_timeout: Duration,
}

impl LockManager {
    /// A manager with plain blocking acquisition.
    pub fn new(container: Arc<LockContainer>) -> Self {
        Self::with_resolver(container, Box::new(BlockingResolver))
    }

    pub fn with_resolver(container: Arc<LockContainer>, resolver: Box<dyn ConflictResolver>) -> Self {
        Self {
            container,
            resolver,
            default_timeout: Duration::from_secs(10),
        }
    }

    /// Build the container and pick the resolver from configuration.
    pub fn from_config(config: &LockingConfig) -> Result<Self> {
        config.check()?;
        let container = Arc::new(LockContainer::new(config.concurrency_level));
        let resolver: Box<dyn ConflictResolver> = if config.deadlock_detection.enabled {
            Box::new(DeadlockDetectingResolver::new(
                Duration::from_millis(config.deadlock_detection.spin_duration_ms),
                config.expose_statistics,
            ))
        } else {
            Box::new(BlockingResolver)
        };
        Ok(Self::with_resolver(container, resolver)
            .with_default_timeout(Duration::from_millis(config.lock_acquisition_timeout_ms)))
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn container(&self) -> &Arc<LockContainer> {
        &self.container
    }

    /// Acquire `key` and, when granted, record it in the context.
    ///
    /// Fails with [`crate::LockError::DeadlockDetected`] when the resolver
    /// confirms a cycle this transaction loses, with
    /// [`crate::LockError::Interrupted`] when the wait is interrupted, and with
    /// [`crate::LockError::MarkedForRollback`] when cleanup rolled back the
    /// remote transaction before or during the wait.
    pub fn lock_and_record(
        &self,
        key: &Key,
        ctx: &mut InvocationContext,
        timeout: Duration,
    ) -> Result<LockOutcome> {
        tracing::trace!(
            key = %key,
            owner = %ctx.lock_owner(),
            timeout_ms = timeout.as_millis() as u64,
            "attempting to lock"
        );

        self.check_not_rolled_back(ctx)?;

        let outcome = self
            .resolver
            .acquire(&self.container, key, ctx, timeout)?;

        match outcome {
            LockOutcome::Granted => {
                // Cleanup may have rolled the transaction back while we waited.
                if let Err(e) = self.check_not_rolled_back(ctx) {
                    self.container.release(ctx.lock_owner(), key);
                    return Err(e);
                }
                ctx.add_locked_key(key.clone());
                tracing::trace!(key = %key, owner = %ctx.lock_owner(), "lock acquired");
            },
            LockOutcome::TimedOut => {
                tracing::debug!(
                    key = %key,
                    owner = %ctx.lock_owner(),
                    holder = ?self.container.owner(key).map(|o| o.to_string()),
                    "lock acquisition timed out"
                );
            },
        }

        Ok(outcome)
    }

    fn check_not_rolled_back(&self, ctx: &InvocationContext) -> Result<()> {
        match ctx.rolled_back_transaction() {
            Some(tx) => {
                tracing::debug!(
                    tx = %tx.global_transaction(),
                    age_ms = tx.age().as_millis() as u64,
                    "refusing lock for transaction marked for rollback"
                );
                Err(LockError::MarkedForRollback {
                    tx: tx.global_transaction().to_string(),
                })
            },
            None => Ok(()),
        }
    }

    /// [`Self::lock_and_record`] with the configured acquisition timeout.
    pub fn lock(&self, key: &Key, ctx: &mut InvocationContext) -> Result<LockOutcome> {
        self.lock_and_record(key, ctx, self.default_timeout)
    }

    /// Release `keys` held by `owner`. Returns how many were released.
    pub fn unlock(&self, keys: &[Key], owner: &LockOwner) -> usize {
        let released = keys
            .iter()
            .filter(|key| self.container.release(owner, key))
            .count();
        tracing::trace!(owner = %owner, released, "unlocked keys");
        released
    }

    /// Release every key recorded in the context and forget them.
    pub fn unlock_all(&self, ctx: &mut InvocationContext) -> usize {
        let keys = ctx.locked_keys();
        let released = self.unlock(&keys, ctx.lock_owner());
        ctx.clear_locked_keys();
        released
    }

    pub fn owner(&self, key: &Key) -> Option<LockOwner> {
        self.container.owner(key)
    }

    pub fn is_locked(&self, key: &Key) -> bool {
        self.container.is_locked(key)
    }

    pub fn owns_lock(&self, key: &Key, owner: &LockOwner) -> bool {
        self.container.owns_lock(key, owner)
    }

    pub fn lock_count(&self) -> usize {
        self.container.lock_count()
    }

    /// Interrupt a wait the context's caller is blocked in.
    pub fn interrupt(&self, ctx: &InvocationContext) {
        self.container.interrupt(ctx.interrupt_flag());
    }

    pub fn deadlock_stats(&self) -> Option<&DeadlockStats> {
        self.resolver.deadlock_stats()
    }
}
