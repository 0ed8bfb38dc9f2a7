// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-node wiring of the locking components for one cache.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::{
    cleanup::{CleanupStatsSnapshot, StaleTransactionCleanupService},
    command::LockReleasingInvoker,
    config::LockingConfig,
    consistent_hash::ConsistentHash,
    context::{InvocationContext, TxScope},
    deadlock::DeadlockStatsSnapshot,
    error::Result,
    lock_manager::LockManager,
    topology::TopologyNotifier,
    transaction::GlobalTransaction,
    transaction_table::{TransactionRegistry, TransactionTable},
    Address,
};

/// Lock manager, transaction table and topology cleanup for one cache.
#[derive(Debug)]
pub struct NodeLocking {
    config: LockingConfig,
    address: Address,
    lock_manager: Arc<LockManager>,
    transactions: Arc<TransactionTable>,
    cleanup: Arc<StaleTransactionCleanupService>,
    topology: Arc<TopologyNotifier>,
}

impl NodeLocking {
    /// Wire a node with its own topology notifier.
    pub fn new(address: impl Into<Address>, config: LockingConfig) -> Result<Self> {
        Self::with_topology(
            address,
            config,
            Arc::new(TopologyNotifier::new()),
        )
    }

    /// Wire a node whose cleanup listens on a shared topology notifier.
    pub fn with_topology(
        address: impl Into<Address>,
        config: LockingConfig,
        topology: Arc<TopologyNotifier>,
    ) -> Result<Self> {
        let address = address.into();
        config.check()?;
        let warnings = config.validate();

        let lock_manager = Arc::new(LockManager::from_config(&config)?);
        let invoker = Arc::new(LockReleasingInvoker::new(Arc::clone(&lock_manager)));
        let transactions = Arc::new(TransactionTable::new(
            address.clone(),
            config.cache_name.clone(),
            invoker.clone(),
        ));
        let cleanup = Arc::new(StaleTransactionCleanupService::new(
            address.clone(),
            config.is_distributed(),
            transactions.clone(),
            invoker,
        ));
        topology.register_listener(cleanup.clone());

        tracing::info!(
            address = %address,
            cache = %config.cache_name,
            mode = ?config.cache_mode,
            deadlock_detection = config.deadlock_detection.enabled,
            warnings = warnings.len(),
            "cache locking configured"
        );

        Ok(Self {
            config,
            address,
            lock_manager,
            transactions,
            cleanup,
            topology,
        })
    }

    /// Start background cleanup on `runtime`.
    pub fn start(&self, runtime: &Handle) -> Result<()> {
        self.cleanup.start(runtime)
    }

    /// Stop background cleanup without waiting for it.
    pub fn shutdown(&self) {
        self.cleanup.stop();
        tracing::debug!(address = %self.address, cache = %self.config.cache_name, "cache locking stopped");
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &LockingConfig {
        &self.config
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    pub fn cleanup(&self) -> &Arc<StaleTransactionCleanupService> {
        &self.cleanup
    }

    pub fn topology(&self) -> &Arc<TopologyNotifier> {
        &self.topology
    }

    /// Install a new membership view and run cleanup for it.
    pub fn install_topology(&self, hash: Arc<dyn ConsistentHash>) -> u64 {
        self.topology.install(hash)
    }

    /// Start a transaction on this node.
    pub fn begin_transaction(&self) -> InvocationContext {
        InvocationContext::local(self.transactions.create_local_transaction())
    }

    /// Context for a replicated command executing for `gtx`'s remote leg.
    pub fn remote_context(&self, gtx: Arc<GlobalTransaction>) -> InvocationContext {
        InvocationContext::remote(self.transactions.get_or_create_remote_transaction(gtx))
    }

    /// Release the context's locks and forget its transaction.
    pub fn complete(&self, ctx: &mut InvocationContext) -> usize {
        let released = self.lock_manager.unlock_all(ctx);
        match ctx.scope() {
            TxScope::Local(tx) => {
                self.transactions
                    .remove_local_transaction(tx.global_transaction().tx_id());
            },
            TxScope::Remote(tx) => {
                self.transactions
                    .remove_remote_transaction(tx.global_transaction().tx_id());
            },
            TxScope::NonTransactional(_) => {},
        }
        released
    }

    /// Deadlock counters, when detection and statistics are enabled.
    pub fn deadlock_stats(&self) -> Option<DeadlockStatsSnapshot> {
        if !self.config.expose_statistics {
            return None;
        }
        self.lock_manager.deadlock_stats().map(|s| s.snapshot())
    }

    pub fn reset_deadlock_stats(&self) {
        if let Some(stats) = self.lock_manager.deadlock_stats() {
            stats.reset();
        }
    }

    pub fn cleanup_stats(&self) -> CleanupStatsSnapshot {
        self.cleanup.stats()
    }
}
