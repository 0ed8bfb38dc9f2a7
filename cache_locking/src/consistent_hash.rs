// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key ownership for one membership view.
//!
//! A [`ConsistentHash`] is an immutable snapshot: it is built for a view,
//! handed to topology listeners, and replaced as a whole when membership
//! changes. [`HashRing`] places each member on a ring at several virtual
//! points and assigns a key to the first `num_owners` distinct members found
//! walking clockwise from the key's hash.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use crate::Address;

/// Default virtual points per member.
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Ownership snapshot for one membership view.
pub trait ConsistentHash: Send + Sync + fmt::Debug {
    /// Members of this view, ordered.
    fn members(&self) -> &BTreeSet<Address>;

    /// Owners of `key`, primary first.
    fn locate(&self, key: &str) -> Vec<Address>;

    /// Whether `address` is one of the owners of `key` in this view.
    fn is_key_local_to_node(&self, address: &str, key: &str) -> bool {
        self.locate(key).iter().any(|owner| owner == address)
    }
}

/// Members present in `old` but absent from `new`.
pub fn members_left(old: &dyn ConsistentHash, new: &dyn ConsistentHash) -> BTreeSet<Address> {
    old.members().difference(new.members()).cloned().collect()
}

/// Members present in `new` but absent from `old`.
pub fn members_joined(old: &dyn ConsistentHash, new: &dyn ConsistentHash) -> BTreeSet<Address> {
    new.members().difference(old.members()).cloned().collect()
}

/// Ring of virtual nodes hashed with CRC32.
#[derive(Debug, Clone)]
pub struct HashRing {
    members: BTreeSet<Address>,
    ring: BTreeMap<u32, Address>,
    num_owners: usize,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new<I, A>(members: I, num_owners: usize) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self::with_virtual_nodes(members, num_owners, DEFAULT_VIRTUAL_NODES)
    }

    pub fn with_virtual_nodes<I, A>(members: I, num_owners: usize, virtual_nodes: usize) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        let members: BTreeSet<Address> = members.into_iter().map(Into::into).collect();
        let virtual_nodes = virtual_nodes.max(1);

        let mut ring = BTreeMap::new();
        for member in &members {
            for point in 0..virtual_nodes {
                let hash = crc32fast::hash(format!("{member}#{point}").as_bytes());
                // First member in address order keeps a colliding point.
                ring.entry(hash).or_insert_with(|| member.clone());
            }
        }

        Self {
            members,
            ring,
            num_owners: num_owners.max(1),
            virtual_nodes,
        }
    }

    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// The first owner of `key`, if the view has any member.
    pub fn primary(&self, key: &str) -> Option<Address> {
        self.locate(key).into_iter().next()
    }
}

impl ConsistentHash for HashRing {
    fn members(&self) -> &BTreeSet<Address> {
        &self.members
    }

    fn locate(&self, key: &str) -> Vec<Address> {
        let wanted = self.num_owners.min(self.members.len());
        let mut owners: Vec<Address> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return owners;
        }

        let hash = crc32fast::hash(key.as_bytes());
        for member in self.ring.range(hash..).chain(self.ring.range(..hash)).map(|(_, m)| m) {
            if !owners.contains(member) {
                owners.push(member.clone());
                if owners.len() == wanted {
                    break;
                }
            }
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> Vec<String> {
        (0..500).map(|i| format!("key-{i}")).collect()
    }

    #[test]
    fn test_empty_ring_owns_nothing() {
        let ring = HashRing::new(Vec::<String>::new(), 2);

        assert!(ring.members().is_empty());
        assert!(ring.locate("k").is_empty());
        assert!(ring.primary("k").is_none());
        assert!(!ring.is_key_local_to_node("node-a", "k"));
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = HashRing::new(["node-a"], 2);

        for key in keys() {
            assert_eq!(ring.locate(&key), vec!["node-a".to_string()]);
            assert!(ring.is_key_local_to_node("node-a", &key));
        }
    }

    #[test]
    fn test_locate_returns_distinct_owners() {
        let ring = HashRing::new(["node-a", "node-b", "node-c", "node-d"], 2);

        for key in keys() {
            let owners = ring.locate(&key);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
        }
    }

    #[test]
    fn test_locate_is_deterministic() {
        let a = HashRing::new(["node-c", "node-a", "node-b"], 1);
        let b = HashRing::new(["node-a", "node-b", "node-c"], 1);

        for key in keys() {
            assert_eq!(a.locate(&key), b.locate(&key));
        }
    }

    #[test]
    fn test_every_member_owns_some_keys() {
        let ring = HashRing::new(["node-a", "node-b", "node-c"], 1);
        let mut owners = BTreeSet::new();
        for key in keys() {
            owners.extend(ring.primary(&key));
        }

        assert_eq!(&owners, ring.members());
    }

    #[test]
    fn test_removing_member_only_moves_its_keys() {
        let before = HashRing::new(["node-a", "node-b", "node-c"], 1);
        let after = HashRing::new(["node-a", "node-b"], 1);

        for key in keys() {
            let old = before.primary(&key).unwrap();
            if old != "node-c" {
                assert_eq!(after.primary(&key), Some(old));
            }
        }
    }

    #[test]
    fn test_num_owners_and_virtual_nodes_floor() {
        let ring = HashRing::with_virtual_nodes(["node-a"], 0, 0);

        assert_eq!(ring.num_owners(), 1);
        assert_eq!(ring.virtual_nodes(), 1);
        assert_eq!(ring.locate("k").len(), 1);
    }

    #[test]
    fn test_members_left_and_joined() {
        let old = HashRing::new(["node-a", "node-b", "node-c"], 1);
        let new = HashRing::new(["node-a", "node-d"], 1);

        let left = members_left(&old, &new);
        let joined = members_joined(&old, &new);

        assert_eq!(
            left.into_iter().collect::<Vec<_>>(),
            vec!["node-b".to_string(), "node-c".to_string()]
        );
        assert_eq!(joined.into_iter().collect::<Vec<_>>(), vec!["node-d".to_string()]);
        assert!(members_left(&old, &old).is_empty());
    }
}
