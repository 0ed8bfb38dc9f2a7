// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stale transaction cleanup driven by topology changes.
//!
//! # Phases
//!
//! ```text
//! Pre  (old view still installed)
//!   leavers = members(start) - members(end)
//!   leavers non-empty -> worker: table.update_state_on_nodes_leaving(leavers)
//!
//! Post (new view installed, distributed caches only)
//!   for each remote tx:
//!     locked keys local in start but not in end -> local-only unlock
//!     no locked or backup key local in end       -> rollback, then remove
//! ```
//!
//! The Pre round runs on the background worker so a slow rollback fan-out
//! never holds up view installation. A burst of changes collapses to the
//! latest leaver set: a round replaced while waiting is lost, and later
//! changes compute leavers against their own previous view, so transactions
//! of nodes named only in a discarded round stay in the table until they
//! complete or an ownership pass drops them. A rejected submission is logged
//! and dropped the same way. The Post pass runs on the notifying thread, over
//! a snapshot of the table, and keeps going past any command failure.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::{
    command::{CommandInvoker, CommandResponse, TxCommand},
    consistent_hash::ConsistentHash,
    error::Result,
    topology::{TopologyListener, TopologyPhase, TopologyTransition},
    transaction::RemoteTransaction,
    transaction_table::TransactionRegistry,
    worker::LockBreakingWorker,
    Address, Key,
};

/// Cleanup counters.
#[derive(Debug, Default)]
pub struct CleanupStats {
    pub leaver_rounds_submitted: AtomicU64,
    pub leaver_rounds_rejected: AtomicU64,
    /// Transactions removed because their originator left.
    pub leaver_transactions_removed: AtomicU64,
    pub keys_unlocked: AtomicU64,
    pub transactions_rolled_back: AtomicU64,
    pub command_failures: AtomicU64,
}

impl CleanupStats {
    pub fn snapshot(&self) -> CleanupStatsSnapshot {
        CleanupStatsSnapshot {
            leaver_rounds_submitted: self.leaver_rounds_submitted.load(Ordering::Relaxed),
            leaver_rounds_rejected: self.leaver_rounds_rejected.load(Ordering::Relaxed),
            leaver_transactions_removed: self.leaver_transactions_removed.load(Ordering::Relaxed),
            keys_unlocked: self.keys_unlocked.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.leaver_rounds_submitted.store(0, Ordering::Relaxed);
        self.leaver_rounds_rejected.store(0, Ordering::Relaxed);
        self.leaver_transactions_removed.store(0, Ordering::Relaxed);
        self.keys_unlocked.store(0, Ordering::Relaxed);
        self.transactions_rolled_back.store(0, Ordering::Relaxed);
        self.command_failures.store(0, Ordering::Relaxed);
    }

    fn add_report(&self, report: &ReconciliationReport) {
        self.keys_unlocked
            .fetch_add(report.keys_unlocked as u64, Ordering::Relaxed);
        self.transactions_rolled_back
            .fetch_add(report.transactions_rolled_back as u64, Ordering::Relaxed);
        self.command_failures
            .fetch_add(report.command_failures as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStatsSnapshot {
    pub leaver_rounds_submitted: u64,
    pub leaver_rounds_rejected: u64,
    pub leaver_transactions_removed: u64,
    pub keys_unlocked: u64,
    pub transactions_rolled_back: u64,
    pub command_failures: u64,
}

/// Result of one ownership reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub transactions_scanned: usize,
    pub keys_unlocked: usize,
    pub transactions_rolled_back: usize,
    pub command_failures: usize,
}

/// Reconciles the transaction table with each new membership view.
pub struct StaleTransactionCleanupService {
    address: Address,
    distributed: bool,
    registry: Arc<dyn TransactionRegistry>,
    invoker: Arc<dyn CommandInvoker>,
    worker: LockBreakingWorker,
    stats: Arc<CleanupStats>,
}

impl StaleTransactionCleanupService {
    pub fn new(
        address: impl Into<Address>,
        distributed: bool,
        registry: Arc<dyn TransactionRegistry>,
        invoker: Arc<dyn CommandInvoker>,
    ) -> Self {
        let address = address.into();
        let worker = LockBreakingWorker::new(format!("lock-breaking-{address}"));
        Self {
            address,
            distributed,
            registry,
            invoker,
            worker,
            stats: Arc::new(CleanupStats::default()),
        }
    }

    /// Start the background worker used for leaver rounds.
    pub fn start(&self, runtime: &Handle) -> Result<()> {
        self.worker.start(runtime)
    }

    /// Stop the worker without waiting; a waiting leaver round is dropped.
    pub fn stop(&self) {
        if self.worker.shutdown() {
            tracing::debug!(address = %self.address, "dropped pending leaver round on stop");
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    pub fn worker(&self) -> &LockBreakingWorker {
        &self.worker
    }

    pub fn stats(&self) -> CleanupStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    fn on_pre(&self, transition: &TopologyTransition) {
        let leavers = transition.leavers();
        if leavers.is_empty() {
            return;
        }
        self.submit_leavers(leavers);
    }

    fn submit_leavers(&self, leavers: BTreeSet<Address>) {
        tracing::debug!(address = %self.address, leavers = ?leavers, "scheduling cleanup for departed nodes");

        let registry = Arc::clone(&self.registry);
        let stats = Arc::clone(&self.stats);
        let submitted = self.worker.submit(move || {
            let removed = registry.update_state_on_nodes_leaving(&leavers);
            stats
                .leaver_transactions_removed
                .fetch_add(removed as u64, Ordering::Relaxed);
        });

        match submitted {
            Ok(()) => {
                self.stats
                    .leaver_rounds_submitted
                    .fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                self.stats
                    .leaver_rounds_rejected
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(address = %self.address, error = %e, "could not schedule cleanup for departed nodes");
            },
        }
    }

    fn on_post(&self, transition: &TopologyTransition) {
        if !self.distributed {
            return;
        }
        let Some(start) = transition.hash_at_start.as_deref() else {
            return;
        };

        let report = self.reconcile_ownership(start, transition.hash_at_end.as_ref());
        tracing::debug!(
            address = %self.address,
            generation = transition.generation,
            scanned = report.transactions_scanned,
            unlocked = report.keys_unlocked,
            rolled_back = report.transactions_rolled_back,
            failures = report.command_failures,
            "reconciled lock ownership"
        );
    }

    /// Release locks on keys that moved away from this node and drop
    /// transactions left with no local keys.
    pub fn reconcile_ownership(
        &self,
        start: &dyn ConsistentHash,
        end: &dyn ConsistentHash,
    ) -> ReconciliationReport {
        let mut report = ReconciliationReport::default();

        for remote in self.registry.remote_transactions() {
            report.transactions_scanned += 1;

            let mut moved: Vec<Key> = Vec::new();
            let mut has_local_keys = false;
            for key in remote.locked_keys() {
                let was_local = start.is_key_local_to_node(&self.address, &key);
                let is_local = end.is_key_local_to_node(&self.address, &key);
                if was_local && !is_local {
                    moved.push(key);
                }
                has_local_keys |= is_local;
            }
            for key in remote.backup_locked_keys() {
                has_local_keys |= end.is_key_local_to_node(&self.address, &key);
            }

            if !moved.is_empty() {
                self.unlock_moved_keys(&remote, moved, &mut report);
            }

            if !has_local_keys {
                self.roll_back(&remote, &mut report);
            }
        }

        self.stats.add_report(&report);
        report
    }

    fn unlock_moved_keys(
        &self,
        remote: &RemoteTransaction,
        moved: Vec<Key>,
        report: &mut ReconciliationReport,
    ) {
        let gtx = remote.global_transaction();
        tracing::trace!(tx = %gtx, keys = ?moved, "unlocking keys that moved to other nodes");

        let command = TxCommand::unlock_local(Arc::clone(gtx), moved);
        match self.invoker.perform(&command) {
            Ok(CommandResponse::Success) => {
                remote.remove_locked_keys(command.keys());
                report.keys_unlocked += command.keys().len();
            },
            Ok(CommandResponse::Failure(reason)) => {
                report.command_failures += 1;
                tracing::error!(tx = %gtx, reason = %reason, "unlock of moved keys reported failure");
            },
            Err(e) => {
                report.command_failures += 1;
                tracing::error!(tx = %gtx, error = %e, "unlock of moved keys failed");
            },
        }
    }

    fn roll_back(&self, remote: &RemoteTransaction, report: &mut ReconciliationReport) {
        let gtx = remote.global_transaction();
        tracing::debug!(
            tx = %gtx,
            age_ms = remote.age().as_millis() as u64,
            "transaction holds no local keys, rolling back"
        );

        remote.mark_for_rollback();
        let command = TxCommand::rollback(Arc::clone(gtx), remote.locked_keys());
        match self.invoker.perform(&command) {
            Ok(CommandResponse::Success) => {},
            Ok(CommandResponse::Failure(reason)) => {
                report.command_failures += 1;
                tracing::warn!(tx = %gtx, reason = %reason, "rollback reported failure");
            },
            Err(e) => {
                report.command_failures += 1;
                tracing::warn!(tx = %gtx, error = %e, "rollback failed");
            },
        }

        self.registry.remove_remote_transaction(gtx.tx_id());
        report.transactions_rolled_back += 1;
    }
}

impl TopologyListener for StaleTransactionCleanupService {
    fn on_topology_change(&self, transition: &TopologyTransition) {
        match transition.phase {
            TopologyPhase::Pre => self.on_pre(transition),
            TopologyPhase::Post => self.on_post(transition),
        }
    }
}

impl fmt::Debug for StaleTransactionCleanupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleTransactionCleanupService")
            .field("address", &self.address)
            .field("distributed", &self.distributed)
            .field("worker", &self.worker)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}
