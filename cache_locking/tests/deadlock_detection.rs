// SPDX-License-Identifier: MIT OR Apache-2.0
//! Integration tests for deadlock-aware lock acquisition.
//!
//! Transactions run on real threads against a shared lock manager; cross-node
//! scenarios use one lock manager per simulated node.

use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

use cache_locking::{
    GlobalTransaction, InvocationContext, LocalTransaction, LockContainer, LockError, LockManager,
    LockOutcome, LockingConfig, RemoteTransaction, Result,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cache_locking=debug")
        .with_test_writer()
        .try_init();
}

fn detecting_manager(spin_ms: u64) -> Arc<LockManager> {
    let config = LockingConfig::default()
        .with_deadlock_detection(spin_ms)
        .with_lock_acquisition_timeout(5_000);
    Arc::new(LockManager::from_config(&config).unwrap())
}

fn local_ctx(gtx: GlobalTransaction) -> InvocationContext {
    InvocationContext::local(Arc::new(LocalTransaction::new(Arc::new(gtx))))
}

fn key(s: &str) -> String {
    s.to_string()
}

/// Lock `first`, meet at the barrier, then try `second`. A loser releases
/// everything, as its caller would when rolling back.
fn cross_lock(
    manager: Arc<LockManager>,
    mut ctx: InvocationContext,
    first: &'static str,
    second: &'static str,
    barrier: Arc<Barrier>,
) -> thread::JoinHandle<Result<LockOutcome>> {
    thread::spawn(move || {
        assert!(manager.lock(&key(first), &mut ctx)?.is_granted());
        barrier.wait();
        let result = manager.lock(&key(second), &mut ctx);
        if result.is_err() {
            manager.unlock_all(&mut ctx);
        } else {
            // Hold both briefly, then finish.
            thread::sleep(Duration::from_millis(10));
            manager.unlock_all(&mut ctx);
        }
        result
    })
}

// ============================================================================
// Two-cycle on one node
// ============================================================================

#[test]
fn test_two_cycle_loser_aborts_and_winner_proceeds() {
    init_tracing();
    let manager = detecting_manager(10);
    let barrier = Arc::new(Barrier::new(2));

    let winner = local_ctx(GlobalTransaction::from_parts("node-a", 1, 900, false));
    let loser = local_ctx(GlobalTransaction::from_parts("node-a", 2, 100, false));

    let a = cross_lock(manager.clone(), winner, "k1", "k2", barrier.clone());
    let b = cross_lock(manager.clone(), loser, "k2", "k1", barrier);

    let a = a.join().unwrap();
    let b = b.join().unwrap();

    assert_eq!(a.unwrap(), LockOutcome::Granted);
    match b {
        Err(LockError::DeadlockDetected { this_tx, other_tx }) => {
            assert_eq!(this_tx, "GlobalTx:node-a:2:local");
            assert_eq!(other_tx, "GlobalTx:node-a:1:local");
        },
        other => panic!("expected deadlock, got {other:?}"),
    }

    let stats = manager.deadlock_stats().unwrap();
    assert_eq!(stats.local_deadlocks(), 1);
    assert_eq!(stats.remote_deadlocks(), 0);
    assert_eq!(stats.total_deadlocks(), 1);
    assert_eq!(manager.lock_count(), 0);
}

#[test]
fn test_two_cycle_exactly_one_side_aborts() {
    init_tracing();
    let manager = detecting_manager(5);

    for round in 0..10 {
        let barrier = Arc::new(Barrier::new(2));
        let first = local_ctx(GlobalTransaction::new_local("node-a"));
        let second = local_ctx(GlobalTransaction::new_local("node-b"));

        let a = cross_lock(manager.clone(), first, "x", "y", barrier.clone());
        let b = cross_lock(manager.clone(), second, "y", "x", barrier);
        let results = [a.join().unwrap(), b.join().unwrap()];

        let aborted = results.iter().filter(|r| matches!(r, Err(e) if e.is_deadlock())).count();
        let granted = results
            .iter()
            .filter(|r| matches!(r, Ok(LockOutcome::Granted)))
            .count();
        assert_eq!((aborted, granted), (1, 1), "round {round}");
    }

    let stats = manager.deadlock_stats().unwrap();
    assert_eq!(stats.total_deadlocks(), 10);
}

#[test]
fn test_deadlock_detected_well_before_timeout() {
    let manager = detecting_manager(10);
    let barrier = Arc::new(Barrier::new(2));

    let winner = local_ctx(GlobalTransaction::from_parts("node-a", 1, 2, false));
    let loser = local_ctx(GlobalTransaction::from_parts("node-a", 2, 1, false));

    let start = Instant::now();
    let a = cross_lock(manager.clone(), winner, "p", "q", barrier.clone());
    let b = cross_lock(manager.clone(), loser, "q", "p", barrier);
    let b = b.join().unwrap();
    a.join().unwrap().unwrap();

    assert!(b.unwrap_err().is_deadlock());
    assert!(start.elapsed() < Duration::from_secs(2));
}

// ============================================================================
// Same key raced from two replicas
// ============================================================================

#[test]
fn test_same_key_cross_replica_resolves_to_one_loser() {
    init_tracing();
    // One lock manager per node; each transaction's remote leg holds K on
    // the other node while its local leg wants K at home.
    let node_a = detecting_manager(10);
    let node_b = detecting_manager(10);

    let tx_a = Arc::new(GlobalTransaction::from_parts("node-a", 1, 10, false));
    let tx_b = Arc::new(GlobalTransaction::from_parts("node-b", 1, 20, false));

    let mut a_remote_on_b =
        InvocationContext::remote(Arc::new(RemoteTransaction::new(Arc::new(tx_a.remote_leg()))));
    let mut b_remote_on_a =
        InvocationContext::remote(Arc::new(RemoteTransaction::new(Arc::new(tx_b.remote_leg()))));
    assert!(node_b.lock(&key("K"), &mut a_remote_on_b).unwrap().is_granted());
    assert!(node_a.lock(&key("K"), &mut b_remote_on_a).unwrap().is_granted());

    let a_local = InvocationContext::local(Arc::new(LocalTransaction::new(tx_a)));
    let b_local = InvocationContext::local(Arc::new(LocalTransaction::new(tx_b)));

    let na = node_a.clone();
    let nb = node_b.clone();
    let a = thread::spawn(move || {
        let mut ctx = a_local;
        let result = na.lock(&key("K"), &mut ctx);
        if result.is_err() {
            // Rolling back a releases its remote leg on node-b.
            nb.unlock_all(&mut a_remote_on_b);
        }
        result
    });
    let nb = node_b.clone();
    let b = thread::spawn(move || {
        let mut ctx = b_local;
        nb.lock(&key("K"), &mut ctx)
    });

    let a = a.join().unwrap();
    let b = b.join().unwrap();

    assert!(a.unwrap_err().is_deadlock());
    assert_eq!(b.unwrap(), LockOutcome::Granted);
    assert_eq!(node_a.deadlock_stats().unwrap().local_deadlocks(), 1);
    assert_eq!(node_b.deadlock_stats().unwrap().total_deadlocks(), 0);
    drop(b_remote_on_a);
}

#[test]
fn test_local_transaction_waits_out_remote_leg_without_cycle() {
    init_tracing();
    let manager = detecting_manager(10);

    // Remote leg of b holds K and is not waiting on anything.
    let tx_b = Arc::new(GlobalTransaction::from_parts("node-b", 1, 100, false));
    let mut b_remote =
        InvocationContext::remote(Arc::new(RemoteTransaction::new(Arc::new(tx_b.remote_leg()))));
    assert!(manager.lock(&key("K"), &mut b_remote).unwrap().is_granted());

    let m = manager.clone();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        m.unlock_all(&mut b_remote)
    });

    // a loses the coin toss but holds nothing, locally or on replicas.
    let mut a = local_ctx(GlobalTransaction::from_parts("node-a", 1, 1, false));
    let outcome = manager.lock_and_record(&key("K"), &mut a, Duration::from_secs(5));

    assert_eq!(releaser.join().unwrap(), 1);
    assert_eq!(outcome.unwrap(), LockOutcome::Granted);
    assert_eq!(manager.deadlock_stats().unwrap().total_deadlocks(), 0);
}

#[test]
fn test_remote_leg_loser_counts_as_remote_deadlock() {
    let manager = detecting_manager(5);

    // Local leg of a holds K and is trying to lock K2 on replicas.
    let tx_a = Arc::new(GlobalTransaction::from_parts("node-a", 1, 50, false));
    tx_a.set_remote_lock_intention([key("K2")]);
    let mut a_ctx = InvocationContext::local(Arc::new(LocalTransaction::new(tx_a)));
    manager.lock(&key("K"), &mut a_ctx).unwrap();

    // Remote leg of b, whose origin already holds K2, now wants K here.
    let tx_b = GlobalTransaction::from_parts("node-b", 9, 5, false);
    tx_b.add_lock_at_origin(key("K2"));
    let mut b_ctx =
        InvocationContext::remote(Arc::new(RemoteTransaction::new(Arc::new(tx_b.remote_leg()))));

    let err = manager.lock(&key("K"), &mut b_ctx).unwrap_err();

    assert!(err.is_deadlock());
    let stats = manager.deadlock_stats().unwrap();
    assert_eq!(stats.remote_deadlocks(), 1);
    assert_eq!(stats.local_deadlocks(), 0);
}

// ============================================================================
// Non-transactional callers and plain owners
// ============================================================================

#[test]
fn test_non_transactional_caller_never_runs_detection() {
    let manager = detecting_manager(1);
    let mut holder = local_ctx(GlobalTransaction::from_parts("node-a", 1, 1_000, false));
    manager.lock(&key("k"), &mut holder).unwrap();

    let mut plain = InvocationContext::non_transactional();
    let outcome = manager
        .lock_and_record(&key("k"), &mut plain, Duration::from_millis(50))
        .unwrap();

    assert_eq!(outcome, LockOutcome::TimedOut);
    let stats = manager.deadlock_stats().unwrap().snapshot();
    assert_eq!(stats.total_deadlocks, 0);
    assert_eq!(stats.unresolvable_owners, 0);
}

#[test]
fn test_transaction_blocked_by_plain_owner_times_out() {
    let manager = detecting_manager(5);
    let mut plain = InvocationContext::non_transactional();
    manager.lock(&key("k"), &mut plain).unwrap();

    let mut tx = local_ctx(GlobalTransaction::from_parts("node-a", 1, 1, false));
    let outcome = manager
        .lock_and_record(&key("k"), &mut tx, Duration::from_millis(40))
        .unwrap();

    assert_eq!(outcome, LockOutcome::TimedOut);
    let stats = manager.deadlock_stats().unwrap();
    assert!(stats.unresolvable_owners() >= 1);

    stats.reset();
    assert_eq!(stats.snapshot(), Default::default());
}

#[test]
fn test_interrupt_stops_deadlock_aware_wait() {
    let manager = detecting_manager(20);
    let mut holder = InvocationContext::non_transactional();
    manager.lock(&key("k"), &mut holder).unwrap();

    let tx = Arc::new(LocalTransaction::new(Arc::new(GlobalTransaction::new_local(
        "node-a",
    ))));
    let mut waiter = InvocationContext::local(tx.clone());
    let flag = waiter.interrupt_flag().clone();

    let m = manager.clone();
    let handle = thread::spawn(move || m.lock_and_record(&key("k"), &mut waiter, Duration::from_secs(30)));

    thread::sleep(Duration::from_millis(50));
    manager.container().interrupt(&flag);

    let result = handle.join().unwrap();
    assert!(matches!(result, Err(LockError::Interrupted { .. })));
    assert!(tx.global_transaction().lock_intention().is_none());
}

#[test]
fn test_blocking_manager_has_no_deadlock_stats() {
    let manager = LockManager::new(Arc::new(LockContainer::default()));
    assert!(manager.deadlock_stats().is_none());
}
