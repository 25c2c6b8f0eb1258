//! Parent and sibling navigation.
//!
//! Sibling pointers are established lazily. During a descent, [`Tree::connect`]
//! links a freshly locked node to the neighbors its parent knows about. When a
//! walker later needs a neighbor that is not connected yet, the link is renewed
//! by going up to the parent (at high priority) and, at the parent's edge, to
//! the parent's own neighbor.

use std::sync::Arc;

use crate::primitives::concurrency::{LockRequest, LockStack};
use crate::types::{BlockAddr, LockMode, LockPriority, Result, TreeError};

use super::index::{SiblingLink, Side};
use super::node::{LockedNode, NodeData, TreeNode};
use super::Tree;

/// Attempts before a neighbor probe gives up with [`TreeError::Repeat`].
const PROBE_RETRIES: usize = 8;

/// Options for neighbor lookups.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct NeighborFlags {
    /// Establish a missing link by going up through the parent.
    pub upper_levels: bool,
    /// Fail with [`TreeError::Repeat`] instead of waiting for the neighbor's lock.
    pub try_lock: bool,
}

impl NeighborFlags {
    /// Flags for walks: connect through upper levels, wait for the lock.
    pub const fn through_parent() -> Self {
        Self {
            upper_levels: true,
            try_lock: false,
        }
    }

    /// Also refuse to wait for the neighbor's lock.
    pub const fn non_blocking(mut self) -> Self {
        self.try_lock = true;
        self
    }
}

/// Node related to a locked node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Relative {
    /// Left neighbor at the same level.
    Left,
    /// Right neighbor at the same level.
    Right,
    /// Parent node.
    Parent,
}

enum Probe<T> {
    Done(T),
    Retry,
}

impl Tree {
    /// Locks a relative of `node`: a neighbor or the parent.
    pub fn lock_relative(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        relative: Relative,
        mode: LockMode,
        flags: NeighborFlags,
    ) -> Result<LockedNode> {
        match relative {
            Relative::Left => self.get_neighbor(stack, node, Side::Left, mode, flags),
            Relative::Right => self.get_neighbor(stack, node, Side::Right, mode, flags),
            Relative::Parent => self.get_parent(stack, node.node(), mode).map(|(p, _)| p),
        }
    }

    fn probe_with_retry<T>(&self, what: &'static str, mut probe: impl FnMut() -> Result<Probe<T>>) -> Result<T> {
        for _ in 0..PROBE_RETRIES {
            match probe()? {
                Probe::Done(value) => return Ok(value),
                Probe::Retry => continue,
            }
        }
        tracing::debug!(what, "link probe keeps racing with balancing");
        Err(TreeError::Repeat)
    }

    /// Locks the parent of `node` at high priority and returns it with the
    /// position of the pointer to `node` inside it. For the root, the parent
    /// is the uber node.
    pub fn get_parent(
        &self,
        stack: &LockStack,
        node: &Arc<TreeNode>,
        mode: LockMode,
    ) -> Result<(LockedNode, usize)> {
        let request = LockRequest::new(mode).priority(LockPriority::High);
        self.probe_with_retry("parent", || {
            if self.root.lock().addr == node.addr() {
                let uber = self.lock_uber(stack, request)?;
                if self.root.lock().addr == node.addr() {
                    return Ok(Probe::Done((uber, 0)));
                }
                return Ok(Probe::Retry);
            }
            let Some(link) = self.index.read().parent(node.addr()) else {
                return Err(TreeError::NoNeighbor);
            };
            let parent = match self.lock_node(stack, &link.node, request) {
                Ok(parent) => parent,
                // Parent removed: the balancer re-hung us somewhere else.
                Err(TreeError::Invalid) => return Ok(Probe::Retry),
                Err(err) => return Err(err),
            };
            let found = {
                let data = parent.data();
                self.layout.find_child(&data, node.addr(), link.pos_hint)
            };
            match found {
                Some(pos) => {
                    if pos != link.pos_hint {
                        self.index.write().set_parent_hint(node.addr(), pos);
                    }
                    Ok(Probe::Done((parent, pos)))
                }
                None => Ok(Probe::Retry),
            }
        })
    }

    /// Locks the neighbor of `node` on `side`.
    ///
    /// Fails with [`TreeError::NoNeighbor`] at the edge of the tree, or when
    /// the link is not established and `flags.upper_levels` is not set.
    /// Leftward requests never wait: they go against the natural lock order.
    pub fn get_neighbor(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        side: Side,
        mode: LockMode,
        flags: NeighborFlags,
    ) -> Result<LockedNode> {
        let mut request = LockRequest::new(mode);
        if side == Side::Left || flags.try_lock {
            request = request.try_lock();
        }
        self.probe_with_retry("neighbor", || {
            let link = self.index.read().link(node.addr(), side);
            match link {
                SiblingLink::Absent => Err(TreeError::NoNeighbor),
                SiblingLink::Present(weak) => {
                    let Some(neighbor) = weak.upgrade() else {
                        return Ok(Probe::Retry);
                    };
                    let locked = match self.lock_node(stack, &neighbor, request) {
                        Ok(locked) => locked,
                        Err(TreeError::WouldBlock) => return Err(TreeError::Repeat),
                        Err(TreeError::Invalid) => return Ok(Probe::Retry),
                        Err(err) => return Err(err),
                    };
                    // The neighbor may have been split off or spliced out meanwhile.
                    let still = match self.index.read().link(node.addr(), side) {
                        SiblingLink::Present(w) => w
                            .upgrade()
                            .map(|n| Arc::ptr_eq(&n, &neighbor))
                            .unwrap_or(false),
                        _ => false,
                    };
                    if still {
                        Ok(Probe::Done(locked))
                    } else {
                        Ok(Probe::Retry)
                    }
                }
                SiblingLink::Unknown => {
                    if !flags.upper_levels {
                        return Err(TreeError::NoNeighbor);
                    }
                    self.renew_sibling_link(stack, node, side)?;
                    Ok(Probe::Retry)
                }
            }
        })
    }

    /// First child pointer at or beyond `start` in direction `side`, skipping extents.
    fn child_towards(&self, data: &NodeData, start: Option<usize>, side: Side) -> Option<(BlockAddr, usize)> {
        let mut pos = start?;
        loop {
            if pos >= data.len() {
                return None;
            }
            if let Some(addr) = self.layout.child_pointer(data, pos) {
                return Some((addr, pos));
            }
            pos = match side {
                Side::Left => pos.checked_sub(1)?,
                Side::Right => pos + 1,
            };
        }
    }

    fn edge_start(data: &NodeData, side: Side) -> Option<usize> {
        match side {
            Side::Left => data.len().checked_sub(1),
            Side::Right => (!data.is_empty()).then_some(0),
        }
    }

    fn step(pos: usize, side: Side) -> Option<usize> {
        match side {
            Side::Left => pos.checked_sub(1),
            Side::Right => Some(pos + 1),
        }
    }

    /// Establishes the sibling link of `node` on `side` through the parent.
    fn renew_sibling_link(&self, stack: &LockStack, node: &LockedNode, side: Side) -> Result<()> {
        let (parent, pos) = self.get_parent(stack, node.node(), LockMode::Read)?;
        if parent.addr() == BlockAddr::UBER {
            self.index.write().set_absent(node.addr(), side);
            return Ok(());
        }
        let adjacent = {
            let data = parent.data();
            self.child_towards(&data, Self::step(pos, side), side)
        };
        let (sibling, sibling_parent, sibling_pos) = match adjacent {
            Some((addr, p)) => (addr, Arc::clone(parent.node()), p),
            None => {
                let flags = NeighborFlags::through_parent();
                let mut current = parent;
                loop {
                    let uncle = match self.get_neighbor(stack, &current, side, LockMode::Read, flags) {
                        Ok(uncle) => uncle,
                        Err(TreeError::NoNeighbor) => {
                            self.index.write().set_absent(node.addr(), side);
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    };
                    drop(current);
                    let found = {
                        let data = uncle.data();
                        self.child_towards(&data, Self::edge_start(&data, side), side)
                    };
                    if let Some((addr, p)) = found {
                        break (addr, Arc::clone(uncle.node()), p);
                    }
                    current = uncle;
                }
            }
        };
        let neighbor = self.load_node(sibling, node.level(), Some((&sibling_parent, sibling_pos)))?;
        let linked = {
            let mut index = self.index.write();
            match side {
                Side::Left => index.link_pair(&neighbor, node.node()),
                Side::Right => index.link_pair(node.node(), &neighbor),
            }
        };
        if !linked {
            tracing::trace!(node = %node.addr(), ?side, "sibling link raced with balancing");
        }
        Ok(())
    }

    /// Connects a node that was just locked during a descent to the
    /// neighbors visible from its locked parent.
    ///
    /// Never waits for a lock; links that cannot be established cheaply stay
    /// unknown and are renewed later on demand.
    pub(crate) fn connect(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        parent: &LockedNode,
        pos: usize,
    ) -> Result<()> {
        if parent.addr() == BlockAddr::UBER {
            let mut index = self.index.write();
            index.set_absent(node.addr(), Side::Left);
            index.set_absent(node.addr(), Side::Right);
            return Ok(());
        }
        for side in [Side::Left, Side::Right] {
            if self.index.read().is_connected(node.addr(), side) {
                continue;
            }
            let adjacent = {
                let data = parent.data();
                self.child_towards(&data, Self::step(pos, side), side)
            };
            match adjacent {
                Some((addr, p)) => {
                    let neighbor = self.load_node(addr, node.level(), Some((parent.node(), p)))?;
                    let mut index = self.index.write();
                    match side {
                        Side::Left => index.link_pair(&neighbor, node.node()),
                        Side::Right => index.link_pair(node.node(), &neighbor),
                    };
                }
                None => self.connect_across(stack, node, parent, side)?,
            }
        }
        Ok(())
    }

    /// Connects `node` sitting at the edge of `parent` through the parent's own link.
    fn connect_across(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        parent: &LockedNode,
        side: Side,
    ) -> Result<()> {
        let link = self.index.read().link(parent.addr(), side);
        let uncle = match link {
            SiblingLink::Absent => {
                self.index.write().set_absent(node.addr(), side);
                return Ok(());
            }
            SiblingLink::Unknown => return Ok(()),
            SiblingLink::Present(weak) => match weak.upgrade() {
                Some(uncle) => uncle,
                None => return Ok(()),
            },
        };
        let uncle = match self.lock_node(stack, &uncle, LockRequest::read().try_lock()) {
            Ok(locked) => locked,
            Err(TreeError::WouldBlock) => {
                stack.forget_contention();
                return Ok(());
            }
            Err(TreeError::Invalid) => return Ok(()),
            Err(err) => return Err(err),
        };
        let edge = {
            let data = uncle.data();
            self.child_towards(&data, Self::edge_start(&data, side), side)
        };
        if let Some((addr, p)) = edge {
            let neighbor = self.load_node(addr, node.level(), Some((uncle.node(), p)))?;
            let mut index = self.index.write();
            match side {
                Side::Left => index.link_pair(&neighbor, node.node()),
                Side::Right => index.link_pair(node.node(), &neighbor),
            };
        }
        Ok(())
    }
}
