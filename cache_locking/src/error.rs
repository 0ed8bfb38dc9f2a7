// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for cache_locking.

use thiserror::Error;

/// Result type for cache_locking operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Errors that can occur while locking keys or reconciling transactions.
#[derive(Debug, Error)]
pub enum LockError {
    /// A lock cycle was confirmed and this transaction is the predetermined loser.
    ///
    /// Never retried by the lock manager: the caller must roll back.
    #[error("deadlock found and we {this_tx} shall not continue; other tx is {other_tx}")]
    DeadlockDetected { this_tx: String, other_tx: String },

    /// A blocked lock wait was interrupted.
    #[error("interrupted while waiting for lock on {key}")]
    Interrupted { key: String },

    /// The remote transaction was rolled back by cleanup; it may not lock keys.
    #[error("transaction {tx} is marked for rollback")]
    MarkedForRollback { tx: String },

    /// The background worker no longer accepts submissions.
    #[error("worker {worker} is shut down")]
    WorkerShutdown { worker: String },

    /// An unlock or rollback command failed at the invocation boundary.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Configuration cannot be used to build a component.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// Whether this error means the calling transaction lost a deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, LockError::DeadlockDetected { .. })
    }
}
