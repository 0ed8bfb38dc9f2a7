// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topology change notifications.
//!
//! Every membership change is announced twice: [`TopologyPhase::Pre`] before
//! the node switches to the new [`ConsistentHash`], and
//! [`TopologyPhase::Post`] after. Installs are serialised, so listeners
//! always see the Pre of a transition before its Post and never interleave
//! two transitions.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    consistent_hash::{members_joined, members_left, ConsistentHash},
    Address,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPhase {
    Pre,
    Post,
}

/// One phase of a membership change.
#[derive(Debug, Clone)]
pub struct TopologyTransition {
    pub phase: TopologyPhase,
    /// View number being installed.
    pub generation: u64,
    /// `None` for the first view a node installs.
    pub hash_at_start: Option<Arc<dyn ConsistentHash>>,
    pub hash_at_end: Arc<dyn ConsistentHash>,
}

impl TopologyTransition {
    pub fn is_pre(&self) -> bool {
        self.phase == TopologyPhase::Pre
    }

    pub fn is_post(&self) -> bool {
        self.phase == TopologyPhase::Post
    }

    /// Members that are gone in the new view.
    pub fn leavers(&self) -> BTreeSet<Address> {
        match &self.hash_at_start {
            Some(start) => members_left(start.as_ref(), self.hash_at_end.as_ref()),
            None => BTreeSet::new(),
        }
    }

    /// Members that are new in the new view.
    pub fn joiners(&self) -> BTreeSet<Address> {
        match &self.hash_at_start {
            Some(start) => members_joined(start.as_ref(), self.hash_at_end.as_ref()),
            None => self.hash_at_end.members().clone(),
        }
    }
}

/// Receives topology transitions.
pub trait TopologyListener: Send + Sync {
    /// Called on the installing thread, once per phase.
    fn on_topology_change(&self, transition: &TopologyTransition);
}

/// Holds the current view and fans transitions out to listeners.
pub struct TopologyNotifier {
    current: RwLock<Option<Arc<dyn ConsistentHash>>>,
    generation: AtomicU64,
    listeners: RwLock<Vec<Arc<dyn TopologyListener>>>,
    install_lock: Mutex<()>,
}

impl TopologyNotifier {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
            install_lock: Mutex::new(()),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn TopologyListener>) {
        self.listeners.write().push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// The installed view, if any.
    pub fn current(&self) -> Option<Arc<dyn ConsistentHash>> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Switch to `new_hash`, notifying Pre before the switch and Post after.
    ///
    /// Returns the generation of the installed view.
    pub fn install(&self, new_hash: Arc<dyn ConsistentHash>) -> u64 {
        let _serial = self.install_lock.lock();

        let hash_at_start = self.current();
        let generation = self.generation() + 1;
        let mut transition = TopologyTransition {
            phase: TopologyPhase::Pre,
            generation,
            hash_at_start,
            hash_at_end: Arc::clone(&new_hash),
        };

        tracing::debug!(
            generation,
            leavers = ?transition.leavers(),
            joiners = ?transition.joiners(),
            "installing topology"
        );

        self.notify(&transition);

        *self.current.write() = Some(new_hash);
        self.generation.store(generation, Ordering::Release);

        transition.phase = TopologyPhase::Post;
        self.notify(&transition);

        generation
    }

    fn notify(&self, transition: &TopologyTransition) {
        // Listeners run without the registry lock held.
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for listener in listeners {
            listener.on_topology_change(transition);
        }
    }
}

impl Default for TopologyNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TopologyNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyNotifier")
            .field("generation", &self.generation())
            .field("listeners", &self.listener_count())
            .field("current", &self.current())
            .finish()
    }
}
