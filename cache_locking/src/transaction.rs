// SPDX-License-Identifier: MIT OR Apache-2.0
//! Transaction identities and the per-node transaction records.
//!
//! A [`GlobalTransaction`] names one distributed transaction. The node that
//! started it holds the local leg (`remote == false`); every replica that
//! locks keys on its behalf holds a remote leg with the same id, origin and
//! coin toss. The mutable parts (lock intentions, keys held at origin, keys
//! held on replicas) are what the deadlock detector inspects while spinning,
//! so they sit behind their own locks and can be read from any thread.
//!
//! Keys held on replicas are shared by every leg derived with
//! [`GlobalTransaction::remote_leg`]: a replica granting a key to its leg
//! makes that visible to the originating leg, as the lock acknowledgement
//! would.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Address, Key};

/// Transaction id counter, unique per process.
static TX_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Owner id counter for non-transactional callers.
static OWNER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Cluster-wide identity of a transaction: originating node plus local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTxId {
    pub origin: Address,
    pub id: u64,
}

impl fmt::Display for GlobalTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalTx:{}:{}", self.origin, self.id)
    }
}

/// Deadlock-aware transaction identity.
#[derive(Debug)]
pub struct GlobalTransaction {
    tx_id: GlobalTxId,
    remote: bool,
    /// Fixed at creation; only used to break lock cycles.
    coin_toss: u64,
    /// Key this leg is currently blocked on.
    lock_intention: RwLock<Option<Key>>,
    /// Keys the local leg is trying to lock on replicas.
    remote_lock_intention: RwLock<BTreeSet<Key>>,
    /// Keys the local leg already holds on the originating node.
    locks_at_origin: RwLock<BTreeSet<Key>>,
    /// Keys held by remote legs, with the number of replicas holding each.
    locks_on_replicas: Arc<RwLock<BTreeMap<Key, usize>>>,
}

impl GlobalTransaction {
    /// Start a new transaction originating on `origin`.
    pub fn new_local(origin: impl Into<Address>) -> Self {
        let id = TX_COUNTER.fetch_add(1, Ordering::Relaxed);
        let coin_toss = rand::rng().next_u64();
        Self::from_parts(origin, id, coin_toss, false)
    }

    /// Rebuild an identity received from another node, or a fixed one for tests.
    pub fn from_parts(origin: impl Into<Address>, id: u64, coin_toss: u64, remote: bool) -> Self {
        Self {
            tx_id: GlobalTxId {
                origin: origin.into(),
                id,
            },
            remote,
            coin_toss,
            lock_intention: RwLock::new(None),
            remote_lock_intention: RwLock::new(BTreeSet::new()),
            locks_at_origin: RwLock::new(BTreeSet::new()),
            locks_on_replicas: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// The replica-side leg of this transaction.
    ///
    /// Carries the keys locked at origin, as they travel with the replicated
    /// command; intentions start empty. Keys the leg locks are reported back
    /// through the shared replica lock set.
    pub fn remote_leg(&self) -> Self {
        let mut leg = Self::from_parts(
            self.tx_id.origin.clone(),
            self.tx_id.id,
            self.coin_toss,
            true,
        );
        leg.set_locks_at_origin(self.locks_at_origin.read().iter().cloned());
        leg.locks_on_replicas = Arc::clone(&self.locks_on_replicas);
        leg
    }

    pub fn tx_id(&self) -> &GlobalTxId {
        &self.tx_id
    }

    pub fn id(&self) -> u64 {
        self.tx_id.id
    }

    pub fn origin(&self) -> &Address {
        &self.tx_id.origin
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn coin_toss(&self) -> u64 {
        self.coin_toss
    }

    /// Total order used to pick the loser of a cycle.
    ///
    /// The origin and id make the order strict between distinct transactions
    /// even when two coin tosses collide.
    fn precedence(&self) -> (u64, &str, u64) {
        (self.coin_toss, self.tx_id.origin.as_str(), self.tx_id.id)
    }

    /// Whether this transaction must give way to `other` in a cycle.
    pub fn would_lose(&self, other: &GlobalTransaction) -> bool {
        self.precedence() < other.precedence()
    }

    pub fn lock_intention(&self) -> Option<Key> {
        self.lock_intention.read().clone()
    }

    pub fn set_lock_intention(&self, key: Key) {
        *self.lock_intention.write() = Some(key);
    }

    pub fn clear_lock_intention(&self) {
        *self.lock_intention.write() = None;
    }

    pub fn remote_lock_intention(&self) -> Vec<Key> {
        self.remote_lock_intention.read().iter().cloned().collect()
    }

    pub fn set_remote_lock_intention(&self, keys: impl IntoIterator<Item = Key>) {
        *self.remote_lock_intention.write() = keys.into_iter().collect();
    }

    pub fn clear_remote_lock_intention(&self) {
        self.remote_lock_intention.write().clear();
    }

    pub fn add_lock_at_origin(&self, key: Key) {
        self.locks_at_origin.write().insert(key);
    }

    pub fn set_locks_at_origin(&self, keys: impl IntoIterator<Item = Key>) {
        *self.locks_at_origin.write() = keys.into_iter().collect();
    }

    /// A remote leg of this transaction was granted `key`.
    pub fn add_lock_on_replica(&self, key: Key) {
        *self.locks_on_replicas.write().entry(key).or_insert(0) += 1;
    }

    /// A remote leg of this transaction released `key`.
    pub fn remove_lock_on_replica(&self, key: &Key) {
        let mut held = self.locks_on_replicas.write();
        if let Some(count) = held.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                held.remove(key);
            }
        }
    }

    /// Whether some remote leg of this transaction holds `key`.
    pub fn has_lock_on_replica(&self, key: &Key) -> bool {
        self.locks_on_replicas.read().contains_key(key)
    }

    /// Whether any of `keys` is already locked by the originating leg.
    pub fn has_lock_at_origin<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) -> bool {
        let held = self.locks_at_origin.read();
        keys.into_iter().any(|k| held.contains(k))
    }
}

impl PartialEq for GlobalTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.tx_id == other.tx_id
    }
}

impl Eq for GlobalTransaction {}

impl fmt::Display for GlobalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.remote { "remote" } else { "local" };
        write!(f, "{}:{}", self.tx_id, side)
    }
}

/// Identity of a non-transactional lock owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        Self(OWNER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Whoever holds, or asks for, a key lock.
#[derive(Debug, Clone)]
pub enum LockOwner {
    /// A caller outside transactional scope; cannot take part in cycle detection.
    Plain(OwnerId),
    /// A transaction leg; deadlock-aware.
    Transactional(Arc<GlobalTransaction>),
}

impl LockOwner {
    /// A fresh non-transactional owner.
    pub fn plain() -> Self {
        LockOwner::Plain(OwnerId::next())
    }

    pub fn transaction(&self) -> Option<&Arc<GlobalTransaction>> {
        match self {
            LockOwner::Transactional(gtx) => Some(gtx),
            LockOwner::Plain(_) => None,
        }
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self, LockOwner::Transactional(_))
    }
}

impl PartialEq for LockOwner {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LockOwner::Plain(a), LockOwner::Plain(b)) => a == b,
            (LockOwner::Transactional(a), LockOwner::Transactional(b)) => a.tx_id == b.tx_id,
            _ => false,
        }
    }
}

impl Eq for LockOwner {}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockOwner::Plain(id) => write!(f, "Owner:{}", id.0),
            LockOwner::Transactional(gtx) => write!(f, "{}", gtx),
        }
    }
}

/// Local leg of a transaction as tracked on its originating node.
#[derive(Debug)]
pub struct LocalTransaction {
    global_tx: Arc<GlobalTransaction>,
    locked_keys: RwLock<BTreeSet<Key>>,
    created_at: Instant,
}

impl LocalTransaction {
    pub fn new(global_tx: Arc<GlobalTransaction>) -> Self {
        Self {
            global_tx,
            locked_keys: RwLock::new(BTreeSet::new()),
            created_at: Instant::now(),
        }
    }

    pub fn global_transaction(&self) -> &Arc<GlobalTransaction> {
        &self.global_tx
    }

    /// Record a key locked on this node; it is also a lock held at origin.
    pub fn register_locked_key(&self, key: Key) {
        self.global_tx.add_lock_at_origin(key.clone());
        self.locked_keys.write().insert(key);
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        self.locked_keys.read().iter().cloned().collect()
    }

    pub fn clear_locked_keys(&self) {
        self.locked_keys.write().clear();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// A transaction started elsewhere that holds locks on this node.
#[derive(Debug)]
pub struct RemoteTransaction {
    global_tx: Arc<GlobalTransaction>,
    /// Keys locked here as a primary owner.
    locked_keys: RwLock<BTreeSet<Key>>,
    /// Keys held here because this node is a backup owner.
    backup_locked_keys: RwLock<BTreeSet<Key>>,
    marked_for_rollback: AtomicBool,
    created_at: Instant,
}

impl RemoteTransaction {
    pub fn new(global_tx: Arc<GlobalTransaction>) -> Self {
        Self {
            global_tx,
            locked_keys: RwLock::new(BTreeSet::new()),
            backup_locked_keys: RwLock::new(BTreeSet::new()),
            marked_for_rollback: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn global_transaction(&self) -> &Arc<GlobalTransaction> {
        &self.global_tx
    }

    pub fn register_locked_key(&self, key: Key) {
        if self.locked_keys.write().insert(key.clone()) {
            self.global_tx.add_lock_on_replica(key);
        }
    }

    pub fn add_backup_locked_key(&self, key: Key) {
        self.backup_locked_keys.write().insert(key);
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        self.locked_keys.read().iter().cloned().collect()
    }

    pub fn backup_locked_keys(&self) -> Vec<Key> {
        self.backup_locked_keys.read().iter().cloned().collect()
    }

    pub fn remove_locked_keys(&self, keys: &[Key]) {
        let mut locked = self.locked_keys.write();
        for key in keys {
            if locked.remove(key) {
                self.global_tx.remove_lock_on_replica(key);
            }
        }
    }

    pub fn clear_locked_keys(&self) {
        let keys = std::mem::take(&mut *self.locked_keys.write());
        for key in &keys {
            self.global_tx.remove_lock_on_replica(key);
        }
        self.backup_locked_keys.write().clear();
    }

    pub fn is_marked_for_rollback(&self) -> bool {
        self.marked_for_rollback.load(Ordering::Acquire)
    }

    pub fn mark_for_rollback(&self) {
        self.marked_for_rollback.store(true, Ordering::Release);
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
