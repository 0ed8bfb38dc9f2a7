// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for topology-driven stale transaction cleanup.

use std::{
    collections::BTreeSet,
    sync::{mpsc, Arc},
    time::Duration,
};

use cache_locking::{
    Address, CacheMode, ConsistentHash, GlobalTransaction, GlobalTxId, HashRing, LockContainer,
    LockError, LockManager, LockOwner, LockReleasingInvoker, LockingConfig, NodeLocking, RemoteTransaction,
    StaleTransactionCleanupService, TopologyNotifier, TransactionRegistry,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;

// ============================================================================
// Helper Functions
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cache_locking=debug")
        .with_test_writer()
        .try_init();
}

fn ring(members: &[&str]) -> Arc<HashRing> {
    Arc::new(HashRing::new(members.iter().copied(), 1))
}

fn distributed_node(address: &str) -> NodeLocking {
    let config = LockingConfig::new("orders")
        .with_cache_mode(CacheMode::Distributed)
        .with_lock_acquisition_timeout(500);
    NodeLocking::new(address, config).unwrap()
}

/// First key whose primary is `before` in one view and `after` in the other.
fn find_key(old: &HashRing, new: &HashRing, before: &str, after: &str, skip: &[String]) -> String {
    (0..10_000)
        .map(|i| format!("key-{i}"))
        .find(|k| {
            !skip.contains(k)
                && old.primary(k).as_deref() == Some(before)
                && new.primary(k).as_deref() == Some(after)
        })
        .expect("no key with the requested placement")
}

fn remote_tx_holding(node: &NodeLocking, origin: &str, id: u64, keys: &[String]) -> Arc<GlobalTransaction> {
    let gtx = Arc::new(GlobalTransaction::from_parts(origin, id, id, true));
    let mut ctx = node.remote_context(gtx.clone());
    for key in keys {
        assert!(node.lock_manager().lock(key, &mut ctx).unwrap().is_granted());
    }
    gtx
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ============================================================================
// Ownership moves (post phase)
// ============================================================================

#[test]
fn test_keys_moving_away_are_unlocked_and_empty_transactions_dropped() {
    init_tracing();
    let node = distributed_node("node-a");
    let before = ring(&["node-a", "node-b"]);
    let after = ring(&["node-a", "node-b", "node-c"]);
    node.install_topology(before.clone());

    let moved_1 = find_key(&before, &after, "node-a", "node-c", &[]);
    let moved_2 = find_key(&before, &after, "node-a", "node-c", &[moved_1.clone()]);
    let stays = find_key(&before, &after, "node-a", "node-a", &[]);

    let gone = remote_tx_holding(&node, "node-b", 1, &[moved_1.clone()]);
    let kept = remote_tx_holding(&node, "node-b", 2, &[moved_2.clone(), stays.clone()]);
    assert_eq!(node.transactions().remote_transaction_count(), 2);

    node.install_topology(after);

    let table = node.transactions();
    assert!(table.remote_transaction(gone.tx_id()).is_none());
    let kept_tx = table.remote_transaction(kept.tx_id()).unwrap();
    assert_eq!(kept_tx.locked_keys(), vec![stays.clone()]);

    let manager = node.lock_manager();
    assert!(!manager.is_locked(&moved_1));
    assert!(!manager.is_locked(&moved_2));
    assert!(manager.owns_lock(&stays, &LockOwner::Transactional(kept)));

    let stats = node.cleanup_stats();
    assert_eq!(stats.keys_unlocked, 2);
    assert_eq!(stats.transactions_rolled_back, 1);
    assert_eq!(stats.command_failures, 0);
}

#[test]
fn test_replicated_cache_skips_ownership_reconciliation() {
    let config = LockingConfig::new("sessions").with_cache_mode(CacheMode::Replicated);
    let node = NodeLocking::new("node-a", config).unwrap();
    let before = ring(&["node-a", "node-b"]);
    let after = ring(&["node-a", "node-b", "node-c"]);
    node.install_topology(before.clone());

    let moved = find_key(&before, &after, "node-a", "node-c", &[]);
    remote_tx_holding(&node, "node-b", 1, &[moved.clone()]);

    node.install_topology(after);

    assert_eq!(node.transactions().remote_transaction_count(), 1);
    assert!(node.lock_manager().is_locked(&moved));
}

// ============================================================================
// Departed originators (pre phase)
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transactions_of_departed_node_are_rolled_back() {
    init_tracing();
    let node = distributed_node("node-a");
    node.start(&Handle::current()).unwrap();

    let before = ring(&["node-a", "node-b", "node-c"]);
    let after = ring(&["node-a", "node-c"]);
    node.install_topology(before.clone());

    let local_key = find_key(&before, &after, "node-a", "node-a", &[]);
    let orphan = remote_tx_holding(&node, "node-b", 1, &[local_key.clone()]);
    let survivor_key = find_key(&before, &after, "node-a", "node-a", &[local_key.clone()]);
    let survivor = remote_tx_holding(&node, "node-c", 2, &[survivor_key.clone()]);

    node.install_topology(after);

    let table = node.transactions().clone();
    let orphan_id = orphan.tx_id().clone();
    assert!(eventually(|| table.remote_transaction(&orphan_id).is_none()).await);

    assert!(!node.lock_manager().is_locked(&local_key));
    assert!(table.remote_transaction(survivor.tx_id()).is_some());
    assert!(node.lock_manager().is_locked(&survivor_key));
    assert_eq!(node.cleanup_stats().leaver_transactions_removed, 1);

    node.shutdown();
}

#[test]
fn test_command_in_flight_after_rollback_cannot_lock() {
    let node = distributed_node("node-a");
    let gtx = Arc::new(GlobalTransaction::from_parts("node-b", 1, 1, true));
    let mut ctx = node.remote_context(gtx.clone());
    assert!(node.lock_manager().lock(&"k1".to_string(), &mut ctx).unwrap().is_granted());

    let removed = node
        .transactions()
        .update_state_on_nodes_leaving(&BTreeSet::from(["node-b".to_string()]));
    assert_eq!(removed, 1);
    assert!(!node.transactions().contains_remote_transaction(gtx.tx_id()));
    assert!(!node.lock_manager().is_locked(&"k1".to_string()));

    let result = node.lock_manager().lock(&"k2".to_string(), &mut ctx);

    assert!(matches!(result, Err(LockError::MarkedForRollback { .. })));
    assert!(!node.lock_manager().is_locked(&"k2".to_string()));
    assert_eq!(node.lock_manager().lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_leaver_round_after_shutdown_is_dropped() {
    let node = distributed_node("node-a");
    node.start(&Handle::current()).unwrap();
    node.install_topology(ring(&["node-a", "node-b"]));
    // Every key stays local once node-a is alone, so only the leaver round
    // could remove this transaction.
    remote_tx_holding(&node, "node-b", 1, &["k".to_string()]);

    node.shutdown();
    node.install_topology(ring(&["node-a"]));

    let stats = node.cleanup_stats();
    assert_eq!(stats.leaver_rounds_rejected, 1);
    assert_eq!(node.transactions().remote_transaction_count(), 1);
}

/// Records each leaver round; the first one blocks until released.
struct GatedRegistry {
    rounds: Mutex<Vec<BTreeSet<Address>>>,
    started: Mutex<Option<mpsc::Sender<()>>>,
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

impl TransactionRegistry for GatedRegistry {
    fn remote_transactions(&self) -> Vec<Arc<RemoteTransaction>> {
        Vec::new()
    }

    fn remove_remote_transaction(&self, _tx_id: &GlobalTxId) -> Option<Arc<RemoteTransaction>> {
        None
    }

    fn update_state_on_nodes_leaving(&self, leavers: &BTreeSet<Address>) -> usize {
        self.rounds.lock().push(leavers.clone());
        if let Some(started) = self.started.lock().take() {
            started.send(()).ok();
        }
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.recv().ok();
        }
        0
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rapid_leaver_events_collapse_to_latest() {
    init_tracing();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let registry = Arc::new(GatedRegistry {
        rounds: Mutex::new(Vec::new()),
        started: Mutex::new(Some(started_tx)),
        gate: Mutex::new(Some(release_rx)),
    });
    let manager = Arc::new(LockManager::new(Arc::new(LockContainer::default())));
    let service = Arc::new(StaleTransactionCleanupService::new(
        "node-a",
        true,
        registry.clone(),
        Arc::new(LockReleasingInvoker::new(manager)),
    ));
    service.start(&Handle::current()).unwrap();

    let notifier = TopologyNotifier::new();
    notifier.register_listener(service.clone());

    let mut members = vec!["node-a", "node-b", "node-c", "node-d", "node-e", "node-f", "node-g"];
    notifier.install(ring(&members));

    // First leaver round starts and blocks on the worker.
    members.pop();
    notifier.install(ring(&members));
    tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
        .await
        .unwrap();

    // Five more departures while it is blocked.
    for _ in 0..5 {
        members.pop();
        notifier.install(ring(&members));
    }
    assert_eq!(members, vec!["node-a"]);
    release_tx.send(()).unwrap();

    let r = registry.clone();
    assert!(eventually(|| r.rounds.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let rounds = registry.rounds.lock();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0], BTreeSet::from(["node-g".to_string()]));
    // node-c through node-f were named only in discarded rounds.
    assert_eq!(rounds[1], BTreeSet::from(["node-b".to_string()]));
    assert_eq!(service.stats().leaver_rounds_submitted, 6);
    assert_eq!(service.worker().stats().replaced, 4);

    service.stop();
}

#[test]
fn test_first_view_triggers_no_cleanup() {
    let node = distributed_node("node-a");
    remote_tx_holding(&node, "node-b", 1, &["k".to_string()]);

    node.install_topology(ring(&["node-a"]) as Arc<dyn ConsistentHash>);

    assert_eq!(node.transactions().remote_transaction_count(), 1);
    assert_eq!(node.cleanup_stats(), Default::default());
}
