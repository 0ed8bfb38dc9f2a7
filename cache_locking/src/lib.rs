// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cache Locking - deadlock-aware key locks for a replicated transactional cache
//!
//! Grants exclusive per-key locks to local and remote transactions, breaks
//! cross-node lock cycles before they hang, and reconciles lock and
//! transaction state whenever cluster membership moves key ownership.
//!
//! # Architecture
//!
//! ```text
//! NodeLocking
//!   ├── LockManager (acquisition contract)
//!   │     ├── LockContainer (striped per-key locks)
//!   │     └── ConflictResolver (blocking | deadlock-detecting)
//!   ├── TransactionTable (local + remote transactions)
//!   ├── StaleTransactionCleanupService (topology listener)
//!   │     └── LockBreakingWorker (one job running, one waiting)
//!   └── TopologyNotifier (Pre / Post view changes)
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use cache_locking::{CacheMode, LockingConfig, NodeLocking};
//!
//! let config = LockingConfig::new("orders")
//!     .with_cache_mode(CacheMode::Distributed)
//!     .with_deadlock_detection(100);
//! let node = NodeLocking::new("node-a", config)?;
//! node.start(&tokio::runtime::Handle::current())?;
//!
//! let mut ctx = node.begin_transaction();
//! match node.lock_manager().lock(&"users:1".to_string(), &mut ctx) {
//!     Ok(outcome) if outcome.is_granted() => { /* write */ },
//!     Ok(_) => { /* timed out */ },
//!     Err(e) if e.is_deadlock() => { /* roll back */ },
//!     Err(e) => return Err(e),
//! }
//! node.complete(&mut ctx);
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod cleanup;
pub mod command;
pub mod config;
pub mod consistent_hash;
pub mod context;
pub mod deadlock;
pub mod error;
pub mod lock_container;
pub mod lock_manager;
pub mod node;
pub mod topology;
pub mod transaction;
pub mod transaction_table;
pub mod worker;

/// Cluster member address.
pub type Address = String;

/// Cache key.
pub type Key = String;

pub use cleanup::{
    CleanupStats, CleanupStatsSnapshot, ReconciliationReport, StaleTransactionCleanupService,
};
pub use command::{CommandInvoker, CommandResponse, LockReleasingInvoker, TxCommand};
pub use config::{CacheMode, ClusterTimeouts, ConfigWarning, DeadlockDetectionConfig, LockingConfig};
pub use consistent_hash::{members_joined, members_left, ConsistentHash, HashRing};
pub use context::{InvocationContext, TxScope};
pub use deadlock::{
    detect_cycle, CyclePattern, DeadlockDetectingResolver, DeadlockStats, DeadlockStatsSnapshot,
};
pub use error::{LockError, Result};
pub use lock_container::{InterruptFlag, LockContainer, LockOutcome, LockRecord};
pub use lock_manager::{BlockingResolver, ConflictResolver, LockManager};
pub use node::NodeLocking;
pub use topology::{TopologyListener, TopologyNotifier, TopologyPhase, TopologyTransition};
pub use transaction::{
    GlobalTransaction, GlobalTxId, LocalTransaction, LockOwner, OwnerId, RemoteTransaction,
};
pub use transaction_table::{TransactionRegistry, TransactionTable};
pub use worker::{LockBreakingWorker, WorkerStats, WorkerStatsSnapshot};
