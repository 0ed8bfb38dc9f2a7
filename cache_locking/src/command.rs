// SPDX-License-Identifier: MIT OR Apache-2.0
//! Commands the lock layer issues against transactions, and the boundary
//! that executes them.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    lock_manager::LockManager,
    transaction::{GlobalTransaction, LockOwner},
    Key,
};

/// A lock-control or rollback request scoped to one transaction.
#[derive(Debug, Clone)]
pub enum TxCommand {
    LockControl {
        tx: Arc<GlobalTransaction>,
        keys: Vec<Key>,
        unlock: bool,
        /// Apply on this node only; never forwarded to the keys' new owners.
        local_only: bool,
    },
    Rollback {
        tx: Arc<GlobalTransaction>,
        locked_keys: Vec<Key>,
    },
}

impl TxCommand {
    /// Release `keys` held by `tx` on this node only.
    pub fn unlock_local(tx: Arc<GlobalTransaction>, keys: Vec<Key>) -> Self {
        TxCommand::LockControl {
            tx,
            keys,
            unlock: true,
            local_only: true,
        }
    }

    pub fn rollback(tx: Arc<GlobalTransaction>, locked_keys: Vec<Key>) -> Self {
        TxCommand::Rollback { tx, locked_keys }
    }

    pub fn tx(&self) -> &Arc<GlobalTransaction> {
        match self {
            TxCommand::LockControl { tx, .. } | TxCommand::Rollback { tx, .. } => tx,
        }
    }

    pub fn keys(&self) -> &[Key] {
        match self {
            TxCommand::LockControl { keys, .. } => keys,
            TxCommand::Rollback { locked_keys, .. } => locked_keys,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxCommand::LockControl { unlock: true, .. } => "unlock",
            TxCommand::LockControl { unlock: false, .. } => "lock",
            TxCommand::Rollback { .. } => "rollback",
        }
    }
}

impl fmt::Display for TxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, keys={:?}]", self.name(), self.tx(), self.keys())
    }
}

/// Outcome reported by a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    Success,
    Failure(String),
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResponse::Success)
    }
}

/// Executes transaction commands.
///
/// Implementations may fail outright (`Err`) or report a failure response;
/// callers on the reconciliation path log both and carry on.
pub trait CommandInvoker: Send + Sync {
    fn perform(&self, command: &TxCommand) -> Result<CommandResponse>;
}

/// Executes commands directly against this node's lock manager.
#[derive(Debug, Clone)]
pub struct LockReleasingInvoker {
    lock_manager: Arc<LockManager>,
}

impl LockReleasingInvoker {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self { lock_manager }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

impl CommandInvoker for LockReleasingInvoker {
    fn perform(&self, command: &TxCommand) -> Result<CommandResponse> {
        let owner = LockOwner::Transactional(Arc::clone(command.tx()));

        match command {
            TxCommand::LockControl {
                keys,
                unlock: true,
                local_only,
                ..
            } => {
                let released = self.lock_manager.unlock(keys, &owner);
                tracing::trace!(owner = %owner, released, local_only, "unlock command done");
                Ok(CommandResponse::Success)
            },
            TxCommand::LockControl {
                keys,
                unlock: false,
                ..
            } => {
                let container = self.lock_manager.container();
                for key in keys {
                    if !container.try_acquire(&owner, key) {
                        return Ok(CommandResponse::Failure(format!(
                            "key {key} is locked by another owner"
                        )));
                    }
                }
                Ok(CommandResponse::Success)
            },
            TxCommand::Rollback { locked_keys, .. } => {
                let mut released = self.lock_manager.unlock(locked_keys, &owner);
                // Anything still held here under this transaction goes too.
                let remaining = self.lock_manager.container().keys_owned_by(&owner);
                released += self.lock_manager.unlock(&remaining, &owner);
                tracing::debug!(tx = %owner, released, "rolled back transaction locks");
                Ok(CommandResponse::Success)
            },
        }
    }
}
