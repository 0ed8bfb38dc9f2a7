// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-invocation locking context.

use std::{collections::BTreeSet, sync::Arc};

use crate::{
    lock_container::InterruptFlag,
    transaction::{GlobalTransaction, LocalTransaction, LockOwner, RemoteTransaction},
    Key,
};

/// What the invocation runs on behalf of.
#[derive(Debug, Clone)]
pub enum TxScope {
    /// No transaction; locks are owned by the invocation itself.
    NonTransactional(LockOwner),
    /// The local leg, on the node that started the transaction.
    Local(Arc<LocalTransaction>),
    /// A replica leg executing a command from the originating node.
    Remote(Arc<RemoteTransaction>),
}

/// State carried through one lock-acquiring invocation.
#[derive(Debug)]
pub struct InvocationContext {
    scope: TxScope,
    owner: LockOwner,
    /// Keys locked by a non-transactional invocation.
    locked_keys: BTreeSet<Key>,
    interrupt: InterruptFlag,
}

impl InvocationContext {
    pub fn non_transactional() -> Self {
        Self::with_scope(TxScope::NonTransactional(LockOwner::plain()))
    }

    pub fn local(tx: Arc<LocalTransaction>) -> Self {
        Self::with_scope(TxScope::Local(tx))
    }

    pub fn remote(tx: Arc<RemoteTransaction>) -> Self {
        Self::with_scope(TxScope::Remote(tx))
    }

    fn with_scope(scope: TxScope) -> Self {
        let owner = match &scope {
            TxScope::NonTransactional(owner) => owner.clone(),
            TxScope::Local(tx) => LockOwner::Transactional(Arc::clone(tx.global_transaction())),
            TxScope::Remote(tx) => LockOwner::Transactional(Arc::clone(tx.global_transaction())),
        };
        Self {
            scope,
            owner,
            locked_keys: BTreeSet::new(),
            interrupt: InterruptFlag::new(),
        }
    }

    pub fn scope(&self) -> &TxScope {
        &self.scope
    }

    pub fn lock_owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn is_in_tx_scope(&self) -> bool {
        !matches!(self.scope, TxScope::NonTransactional(_))
    }

    pub fn is_origin_local(&self) -> bool {
        !matches!(self.scope, TxScope::Remote(_))
    }

    pub fn global_transaction(&self) -> Option<&Arc<GlobalTransaction>> {
        self.owner.transaction()
    }

    /// The remote transaction this invocation runs for, once cleanup has
    /// marked it for rollback.
    pub fn rolled_back_transaction(&self) -> Option<&Arc<RemoteTransaction>> {
        match &self.scope {
            TxScope::Remote(tx) if tx.is_marked_for_rollback() => Some(tx),
            _ => None,
        }
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.interrupt
    }

    /// Record a key granted to this invocation against its owner.
    pub fn add_locked_key(&mut self, key: Key) {
        match &self.scope {
            TxScope::NonTransactional(_) => {
                self.locked_keys.insert(key);
            },
            TxScope::Local(tx) => tx.register_locked_key(key),
            TxScope::Remote(tx) => tx.register_locked_key(key),
        }
    }

    /// Keys locked on behalf of this context's owner.
    pub fn locked_keys(&self) -> Vec<Key> {
        match &self.scope {
            TxScope::NonTransactional(_) => self.locked_keys.iter().cloned().collect(),
            TxScope::Local(tx) => tx.locked_keys(),
            TxScope::Remote(tx) => tx.locked_keys(),
        }
    }

    pub fn clear_locked_keys(&mut self) {
        match &self.scope {
            TxScope::NonTransactional(_) => self.locked_keys.clear(),
            TxScope::Local(tx) => tx.clear_locked_keys(),
            TxScope::Remote(tx) => tx.clear_locked_keys(),
        }
    }
}
