// SPDX-License-Identifier: MIT OR Apache-2.0
//! Registry of the transactions active on this node.

use std::{collections::BTreeSet, fmt, sync::Arc};

use dashmap::DashMap;

use crate::{
    command::{CommandInvoker, CommandResponse, TxCommand},
    transaction::{GlobalTransaction, GlobalTxId, LocalTransaction, RemoteTransaction},
    Address,
};

/// What topology cleanup needs from the transaction registry.
pub trait TransactionRegistry: Send + Sync {
    /// Snapshot of the remote transactions; safe to mutate the table while
    /// walking it.
    fn remote_transactions(&self) -> Vec<Arc<RemoteTransaction>>;

    fn remove_remote_transaction(&self, tx_id: &GlobalTxId) -> Option<Arc<RemoteTransaction>>;

    /// Roll back and forget remote transactions started by `leavers`.
    /// Returns how many were removed.
    fn update_state_on_nodes_leaving(&self, leavers: &BTreeSet<Address>) -> usize;
}

/// Local and remote transactions of one cache on one node.
pub struct TransactionTable {
    address: Address,
    cache_name: String,
    remote: DashMap<GlobalTxId, Arc<RemoteTransaction>>,
    local: DashMap<GlobalTxId, Arc<LocalTransaction>>,
    invoker: Arc<dyn CommandInvoker>,
}

impl TransactionTable {
    pub fn new(
        address: impl Into<Address>,
        cache_name: impl Into<String>,
        invoker: Arc<dyn CommandInvoker>,
    ) -> Self {
        Self {
            address: address.into(),
            cache_name: cache_name.into(),
            remote: DashMap::new(),
            local: DashMap::new(),
            invoker,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Start a transaction on this node and track its local leg.
    pub fn create_local_transaction(&self) -> Arc<LocalTransaction> {
        let gtx = Arc::new(GlobalTransaction::new_local(self.address.clone()));
        let local = Arc::new(LocalTransaction::new(gtx));
        self.local
            .insert(local.global_transaction().tx_id().clone(), Arc::clone(&local));
        tracing::trace!(tx = %local.global_transaction(), cache = %self.cache_name, "created local transaction");
        local
    }

    pub fn local_transaction(&self, tx_id: &GlobalTxId) -> Option<Arc<LocalTransaction>> {
        self.local.get(tx_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove_local_transaction(&self, tx_id: &GlobalTxId) -> Option<Arc<LocalTransaction>> {
        self.local.remove(tx_id).map(|(_, tx)| tx)
    }

    pub fn local_transaction_count(&self) -> usize {
        self.local.len()
    }

    /// Look up the remote transaction for `gtx`, registering it on first use.
    pub fn get_or_create_remote_transaction(
        &self,
        gtx: Arc<GlobalTransaction>,
    ) -> Arc<RemoteTransaction> {
        let entry = self
            .remote
            .entry(gtx.tx_id().clone())
            .or_insert_with(|| {
                tracing::trace!(tx = %gtx, cache = %self.cache_name, "created remote transaction");
                Arc::new(RemoteTransaction::new(Arc::clone(&gtx)))
            });
        Arc::clone(entry.value())
    }

    pub fn remote_transaction(&self, tx_id: &GlobalTxId) -> Option<Arc<RemoteTransaction>> {
        self.remote.get(tx_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains_remote_transaction(&self, tx_id: &GlobalTxId) -> bool {
        self.remote.contains_key(tx_id)
    }

    pub fn remote_transaction_count(&self) -> usize {
        self.remote.len()
    }

    fn roll_back(&self, remote: &RemoteTransaction) {
        remote.mark_for_rollback();

        let mut keys = remote.locked_keys();
        keys.extend(remote.backup_locked_keys());
        let command = TxCommand::rollback(Arc::clone(remote.global_transaction()), keys);

        match self.invoker.perform(&command) {
            Ok(CommandResponse::Success) => {
                tracing::trace!(
                    tx = %remote.global_transaction(),
                    age_ms = remote.age().as_millis() as u64,
                    "rolled back transaction of departed node"
                );
            },
            Ok(CommandResponse::Failure(reason)) => {
                tracing::warn!(tx = %remote.global_transaction(), reason = %reason, "rollback reported failure");
            },
            Err(e) => {
                tracing::warn!(tx = %remote.global_transaction(), error = %e, "rollback failed");
            },
        }
    }
}

impl TransactionRegistry for TransactionTable {
    fn remote_transactions(&self) -> Vec<Arc<RemoteTransaction>> {
        self.remote
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn remove_remote_transaction(&self, tx_id: &GlobalTxId) -> Option<Arc<RemoteTransaction>> {
        let removed = self.remote.remove(tx_id).map(|(_, tx)| tx);
        if removed.is_some() {
            tracing::trace!(tx = %tx_id, "removed remote transaction");
        }
        removed
    }

    fn update_state_on_nodes_leaving(&self, leavers: &BTreeSet<Address>) -> usize {
        let orphaned: Vec<_> = self
            .remote_transactions()
            .into_iter()
            .filter(|tx| leavers.contains(tx.global_transaction().origin()))
            .collect();

        for remote in &orphaned {
            self.roll_back(remote);
            self.remove_remote_transaction(remote.global_transaction().tx_id());
        }

        if !orphaned.is_empty() {
            tracing::debug!(
                cache = %self.cache_name,
                leavers = ?leavers,
                removed = orphaned.len(),
                "removed transactions of departed nodes"
            );
        }
        orphaned.len()
    }
}

impl fmt::Debug for TransactionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTable")
            .field("address", &self.address)
            .field("cache_name", &self.cache_name)
            .field("remote", &self.remote.len())
            .field("local", &self.local.len())
            .finish_non_exhaustive()
    }
}
