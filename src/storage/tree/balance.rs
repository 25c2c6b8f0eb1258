//! Minimal balancing: leaf inserts with bottom-up splits, and removal of
//! emptied leaves.
//!
//! Balancing goes against the natural lock order (child to parent), so every
//! upward lock is requested at high priority. The parent is locked before a
//! node is modified, which keeps a failed upward step from leaving the tree
//! half-split: the node simply stays overfull until the next insert.

use std::sync::Arc;

use crate::primitives::concurrency::{LockRequest, LockStack, NodeLock};
use crate::types::{BlockAddr, Key, LockMode, Result, TreeError, LEAF_LEVEL, MAX_TREE_HEIGHT};

use super::index::{Side, SiblingLink};
use super::layout::{Bias, Position};
use super::node::{DelimitingKeys, Item, ItemBody, LockedNode, NodeData, TreeNode};
use super::search::Coord;
use super::Tree;

impl Tree {
    /// Returns a copy of the leftmost item stored under `key`.
    pub fn get(&self, stack: &LockStack, key: &Key) -> Result<Option<Item>> {
        let found = self.search_by_key(stack, &self.request(*key, LockMode::Read))?;
        if found.is_found() && found.coord.level == LEAF_LEVEL {
            Ok(found.item())
        } else {
            Ok(None)
        }
    }

    /// Inserts a leaf item after any items with the same key.
    ///
    /// Returns where the item landed; the coordinate may be outdated as soon
    /// as the insert returns if the leaf was split.
    pub fn insert(&self, stack: &LockStack, item: Item) -> Result<Coord> {
        if matches!(item.body, ItemBody::Child(_)) {
            return Err(TreeError::InvalidArgument("internal items are placed by balancing"));
        }
        let request = self
            .request(item.key, LockMode::Write)
            .bias(Bias::MaxNotMoreThan)
            .unique();
        let found = self.search_by_key(stack, &request)?;
        if found.coord.level != LEAF_LEVEL {
            return Err(TreeError::InvalidArgument("key is covered by an extent"));
        }
        let leaf = found.node;
        let at = found.coord.position.insertion_index();
        {
            let mut data = leaf.data_mut();
            data.items.insert(at, item);
            self.store.write_node(leaf.addr(), &data)?;
        }
        let coord = Coord {
            addr: leaf.addr(),
            level: LEAF_LEVEL,
            position: Position::at(at),
        };
        self.split_upwards(stack, leaf)?;
        Ok(coord)
    }

    fn split_upwards(&self, stack: &LockStack, node: LockedNode) -> Result<()> {
        let capacity = self.options.node_capacity;
        let mut current = node;
        while current.len() > capacity {
            let (parent, pos) = match self.get_parent(stack, current.node(), LockMode::Write) {
                Ok(found) => found,
                Err(err) if err.is_retryable() => {
                    tracing::debug!(node = %current.addr(), cause = %err, "split postponed");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
            if parent.addr() == BlockAddr::UBER {
                return self.grow_tree(stack, &current, &parent);
            }
            if !self.split_node(stack, &current, &parent, pos)? {
                return Ok(());
            }
            drop(current);
            current = parent;
        }
        Ok(())
    }

    /// Moves the upper half of `node` into a fresh right neighbor and hangs
    /// it into `parent` right after `pos`. Returns false if no split point
    /// exists.
    pub(super) fn split_node(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        parent: &LockedNode,
        pos: usize,
    ) -> Result<bool> {
        let level = node.level();
        let Some(range) = self.delimiting_keys(node.addr()) else {
            tracing::debug!(node = %node.addr(), "node range unknown, split postponed");
            return Ok(false);
        };
        let Some(mid) = split_point(&node.data(), &range) else {
            tracing::debug!(node = %node.addr(), "node holds one key only, split skipped");
            return Ok(false);
        };
        let new_addr = self.store.allocate()?;
        let items = node.data_mut().items.split_off(mid);
        let split_key = items[0].key;
        let children: Vec<(usize, BlockAddr)> = items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item.body {
                ItemBody::Child(child) => Some((i, child)),
                _ => None,
            })
            .collect();
        let right = Arc::new(TreeNode::new(
            new_addr,
            NodeData::new(level, items),
            self.options.convoy_size,
        ));
        let right = self.index.write().insert(right);
        let right_locked = self.lock_node(stack, &right, LockRequest::write().high_priority().try_lock())?;

        {
            let mut dk = self.dk.write();
            dk.insert(node.addr(), DelimitingKeys::new(range.left, split_key));
            dk.insert(new_addr, DelimitingKeys::new(split_key, range.right));
        }
        {
            let mut index = self.index.write();
            let old_right = index.link(node.addr(), Side::Right);
            index.force_link(node.node(), &right);
            match old_right {
                SiblingLink::Present(weak) => {
                    if let Some(next) = weak.upgrade() {
                        index.force_link(&right, &next);
                    }
                }
                SiblingLink::Absent => index.set_absent(new_addr, Side::Right),
                SiblingLink::Unknown => {}
            }
            index.set_parent(new_addr, parent.node(), pos + 1);
            for (i, child) in children {
                if index.get(child).is_some() {
                    index.set_parent(child, &right, i);
                }
            }
        }
        {
            let mut data = parent.data_mut();
            data.items.insert(pos + 1, Item::child(split_key, new_addr));
            self.store.write_node(parent.addr(), &data)?;
        }
        self.store.write_node(node.addr(), &node.data())?;
        self.store.write_node(new_addr, &right.data())?;
        self.stats.inc_splits();
        tracing::debug!(node = %node.addr(), new = %new_addr, level, split_key = %split_key, "node split");
        drop(right_locked);
        Ok(true)
    }

    /// Splits the root under a new root. `uber` must be write-locked.
    fn grow_tree(&self, stack: &LockStack, root: &LockedNode, uber: &LockedNode) -> Result<()> {
        debug_assert_eq!(uber.mode(), LockMode::Write);
        let level = root.level();
        if level >= MAX_TREE_HEIGHT {
            tracing::warn!(height = level, "tree height limit reached, root stays overfull");
            return Ok(());
        }
        let Some(range) = self.delimiting_keys(root.addr()) else {
            tracing::debug!(root = %root.addr(), "root range unknown, growth postponed");
            return Ok(());
        };
        if split_point(&root.data(), &range).is_none() {
            return Ok(());
        }
        let new_addr = self.store.allocate()?;
        let data = NodeData::new(level + 1, vec![Item::child(Key::MIN, root.addr())]);
        self.store.write_node(new_addr, &data)?;
        let new_root = Arc::new(TreeNode::new(new_addr, data, self.options.convoy_size));
        let new_root = self.index.write().insert(new_root);
        let new_locked = self.lock_node(stack, &new_root, LockRequest::write().high_priority().try_lock())?;
        self.set_delimiting_keys(new_addr, DelimitingKeys::FULL);
        {
            let mut index = self.index.write();
            index.set_absent(new_addr, Side::Left);
            index.set_absent(new_addr, Side::Right);
            index.set_parent(root.addr(), &new_root, 0);
        }
        {
            let mut current = self.root.lock();
            debug_assert_eq!(current.addr, root.addr());
            current.addr = new_addr;
            current.height = level + 1;
        }
        tracing::debug!(old = %root.addr(), new = %new_addr, height = level + 1, "tree grew");
        self.split_node(stack, root, &new_locked, 0)?;
        drop(new_locked);
        Ok(())
    }

    /// Deletes the leftmost item stored under `key` and returns it.
    pub fn delete(&self, stack: &LockStack, key: &Key) -> Result<Option<Item>> {
        let found = self.search_by_key(stack, &self.request(*key, LockMode::Write))?;
        if !found.is_found() || found.coord.level != LEAF_LEVEL {
            return Ok(None);
        }
        let leaf = found.node;
        let removed = {
            let mut data = leaf.data_mut();
            let item = data.items.remove(found.coord.position.pos);
            self.store.write_node(leaf.addr(), &data)?;
            item
        };
        if leaf.is_empty() && leaf.addr() != self.root().0 {
            self.remove_empty_leaf(stack, leaf)?;
        }
        Ok(Some(removed))
    }

    /// Unhooks an empty leaf, handing its key range to a sibling under the
    /// same parent. Gives up silently whenever a lock is not immediately
    /// available; an empty leaf is harmless.
    fn remove_empty_leaf(&self, stack: &LockStack, leaf: LockedNode) -> Result<()> {
        let (parent, pos) = match self.get_parent(stack, leaf.node(), LockMode::Write) {
            Ok(found) => found,
            Err(err) if err.is_retryable() || matches!(err, TreeError::NoNeighbor) => return Ok(()),
            Err(err) => return Err(err),
        };
        if parent.addr() == BlockAddr::UBER {
            return Ok(());
        }
        let Some(range) = self.delimiting_keys(leaf.addr()) else {
            return Ok(());
        };
        let (side, absorber_pos) = if pos > 0 { (Side::Left, pos - 1) } else { (Side::Right, pos + 1) };
        let absorber_addr = {
            let data = parent.data();
            if data.len() <= 1 {
                return Ok(());
            }
            match self.layout.child_pointer(&data, absorber_pos) {
                Some(addr) => addr,
                None => return Ok(()),
            }
        };
        let absorber = self.load_node(absorber_addr, leaf.level(), Some((parent.node(), absorber_pos)))?;
        let absorber = match self.lock_node(stack, &absorber, LockRequest::write().high_priority().try_lock()) {
            Ok(locked) => locked,
            Err(err) if err.is_retryable() => return Ok(()),
            Err(err) => return Err(err),
        };

        {
            let mut dk = self.dk.write();
            if let Some(mut keys) = dk.get(&absorber.addr()).copied() {
                match side {
                    Side::Left => keys.right = range.right,
                    Side::Right => keys.left = range.left,
                }
                dk.insert(absorber.addr(), keys);
            }
            dk.remove(&leaf.addr());
        }
        {
            let mut data = parent.data_mut();
            data.items.remove(pos);
            if side == Side::Right {
                // The right sibling slid into `pos` and now starts where the leaf started.
                data.items[pos].key = range.left;
            }
            self.store.write_node(parent.addr(), &data)?;
        }
        {
            let mut index = self.index.write();
            let present = |link: SiblingLink| match link {
                SiblingLink::Present(weak) => weak.upgrade(),
                _ => None,
            };
            let left = present(index.link(leaf.addr(), Side::Left));
            let right = present(index.link(leaf.addr(), Side::Right));
            match (left, right) {
                (Some(l), Some(r)) => index.force_link(&l, &r),
                (Some(l), None) => index.copy_link(leaf.addr(), l.addr(), Side::Right),
                (None, Some(r)) => index.copy_link(leaf.addr(), r.addr(), Side::Left),
                (None, None) => {}
            }
            index.remove(leaf.addr());
        }
        self.cache.invalidate(leaf.addr());
        let (node, handle) = leaf.into_parts();
        NodeLock::invalidate(handle)?;
        self.store.free(node.addr())?;
        self.stats.inc_removals();
        tracing::debug!(node = %node.addr(), absorber = %absorber.addr(), "empty leaf removed");
        Ok(())
    }
}

/// First index at or after the middle whose key lies strictly inside
/// `range`. The right half must start there, or the left half would be left
/// with an empty range.
fn split_point(data: &NodeData, range: &DelimitingKeys) -> Option<usize> {
    (data.len() / 2..data.len()).find(|&i| data.items[i].key > range.left)
}
