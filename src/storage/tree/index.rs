//! In-memory node index: addresses to loaded nodes plus their links.
//!
//! Sibling and parent links live here rather than in the nodes so that the
//! whole link graph is protected by one tree-wide `RwLock`. Sibling links are
//! weak; a parent link pins the parent in memory while the child is loaded.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::types::BlockAddr;

use super::node::TreeNode;

/// Horizontal direction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum Side {
    /// Towards smaller keys.
    Left,
    /// Towards larger keys.
    Right,
}

impl Side {
    /// The other side.
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) enum SiblingLink {
    #[default]
    Unknown,
    Absent,
    Present(Weak<TreeNode>),
}

/// Connection state of one sibling pointer, for introspection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum LinkState {
    /// Not established yet (or the neighbor was evicted).
    Unknown,
    /// Established: there is no neighbor on that side.
    Absent,
    /// Established: the neighbor at this address.
    Present(BlockAddr),
}

#[derive(Clone)]
pub(crate) struct ParentLink {
    pub(crate) node: Arc<TreeNode>,
    pub(crate) pos_hint: usize,
}

struct IndexEntry {
    node: Arc<TreeNode>,
    left: SiblingLink,
    right: SiblingLink,
    parent: Option<ParentLink>,
}

impl IndexEntry {
    fn link(&self, side: Side) -> &SiblingLink {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn link_mut(&mut self, side: Side) -> &mut SiblingLink {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

#[derive(Default)]
pub(crate) struct NodeIndex {
    entries: FxHashMap<BlockAddr, IndexEntry>,
}

impl NodeIndex {
    pub(crate) fn get(&self, addr: BlockAddr) -> Option<Arc<TreeNode>> {
        self.entries.get(&addr).map(|entry| Arc::clone(&entry.node))
    }

    /// Inserts `node` unless its address is already loaded; returns the indexed node.
    pub(crate) fn insert(&mut self, node: Arc<TreeNode>) -> Arc<TreeNode> {
        let entry = self.entries.entry(node.addr()).or_insert_with(|| IndexEntry {
            node,
            left: SiblingLink::Unknown,
            right: SiblingLink::Unknown,
            parent: None,
        });
        Arc::clone(&entry.node)
    }

    /// Drops the node and severs sibling links pointing at it.
    pub(crate) fn remove(&mut self, addr: BlockAddr) -> Option<Arc<TreeNode>> {
        let entry = self.entries.remove(&addr)?;
        for side in [Side::Left, Side::Right] {
            let neighbor = match entry.link(side) {
                SiblingLink::Present(weak) => weak.upgrade().map(|node| node.addr()),
                _ => None,
            };
            if let Some(neighbor) = neighbor {
                if let Some(other) = self.entries.get_mut(&neighbor) {
                    let back = other.link_mut(side.opposite());
                    if matches!(back, SiblingLink::Present(w) if w.upgrade().map(|n| n.addr()) == Some(addr))
                    {
                        *back = SiblingLink::Unknown;
                    }
                }
            }
        }
        Some(entry.node)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn addrs(&self) -> Vec<BlockAddr> {
        self.entries.keys().copied().collect()
    }

    /// Current sibling link; dead weak links read as unknown.
    pub(crate) fn link(&self, addr: BlockAddr, side: Side) -> SiblingLink {
        match self.entries.get(&addr).map(|entry| entry.link(side)) {
            Some(SiblingLink::Present(weak)) if weak.strong_count() > 0 => {
                SiblingLink::Present(weak.clone())
            }
            Some(SiblingLink::Absent) => SiblingLink::Absent,
            _ => SiblingLink::Unknown,
        }
    }

    pub(crate) fn link_state(&self, addr: BlockAddr, side: Side) -> Option<LinkState> {
        self.entries.get(&addr)?;
        Some(match self.link(addr, side) {
            SiblingLink::Unknown => LinkState::Unknown,
            SiblingLink::Absent => LinkState::Absent,
            SiblingLink::Present(weak) => weak
                .upgrade()
                .map(|node| LinkState::Present(node.addr()))
                .unwrap_or(LinkState::Unknown),
        })
    }

    pub(crate) fn is_connected(&self, addr: BlockAddr, side: Side) -> bool {
        !matches!(self.link(addr, side), SiblingLink::Unknown)
    }

    pub(crate) fn set_absent(&mut self, addr: BlockAddr, side: Side) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            *entry.link_mut(side) = SiblingLink::Absent;
        }
    }

    /// Links `left` and `right` as neighbors.
    ///
    /// Returns false without changing anything when either side is already
    /// linked to a different live node, which means the pair went stale.
    pub(crate) fn link_pair(&mut self, left: &Arc<TreeNode>, right: &Arc<TreeNode>) -> bool {
        let conflicts = |link: SiblingLink, expected: BlockAddr| match link {
            SiblingLink::Present(weak) => weak
                .upgrade()
                .map(|node| node.addr() != expected)
                .unwrap_or(false),
            _ => false,
        };
        if conflicts(self.link(left.addr(), Side::Right), right.addr())
            || conflicts(self.link(right.addr(), Side::Left), left.addr())
        {
            return false;
        }
        self.force_link(left, right);
        true
    }

    /// Links `left` and `right` unconditionally (used by balancing).
    pub(crate) fn force_link(&mut self, left: &Arc<TreeNode>, right: &Arc<TreeNode>) {
        if let Some(entry) = self.entries.get_mut(&left.addr()) {
            entry.right = SiblingLink::Present(Arc::downgrade(right));
        }
        if let Some(entry) = self.entries.get_mut(&right.addr()) {
            entry.left = SiblingLink::Present(Arc::downgrade(left));
        }
    }

    /// Copies `from`'s link on `side` to `to`, used when splicing a node out.
    pub(crate) fn copy_link(&mut self, from: BlockAddr, to: BlockAddr, side: Side) {
        let link = self.link(from, side);
        if let Some(entry) = self.entries.get_mut(&to) {
            *entry.link_mut(side) = link;
        }
    }

    pub(crate) fn parent(&self, addr: BlockAddr) -> Option<ParentLink> {
        self.entries.get(&addr).and_then(|entry| entry.parent.clone())
    }

    pub(crate) fn set_parent(&mut self, addr: BlockAddr, parent: &Arc<TreeNode>, pos_hint: usize) {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.parent = Some(ParentLink {
                node: Arc::clone(parent),
                pos_hint,
            });
        }
    }

    pub(crate) fn set_parent_hint(&mut self, addr: BlockAddr, pos_hint: usize) {
        if let Some(parent) = self.entries.get_mut(&addr).and_then(|e| e.parent.as_mut()) {
            parent.pos_hint = pos_hint;
        }
    }

    /// Loaded nodes referenced by nothing but the index.
    pub(crate) fn unused(&self, keep: BlockAddr) -> Vec<BlockAddr> {
        self.entries
            .iter()
            .filter(|(addr, entry)| {
                **addr != keep && Arc::strong_count(&entry.node) == 1 && !entry.node.lock().is_locked()
            })
            .map(|(addr, _)| *addr)
            .collect()
    }
}
