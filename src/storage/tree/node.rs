use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::primitives::concurrency::{LockHandle, NodeLock};
use crate::types::{BlockAddr, Key, Level, LockMode};

/// Body of one item stored in a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemBody {
    /// Pointer to a child node (internal item).
    Child(BlockAddr),
    /// Reference to a run of unformatted blocks (twig level only).
    Extent {
        /// First block of the run.
        start: BlockAddr,
        /// Number of blocks in the run.
        blocks: u64,
    },
    /// Inline payload (leaf level).
    Data(Bytes),
}

/// One keyed item of a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    /// Item key; for internal items this is the child's left delimiting key.
    pub key: Key,
    /// Item body.
    pub body: ItemBody,
}

impl Item {
    /// Creates a leaf item carrying `payload`.
    pub fn data(key: Key, payload: impl Into<Bytes>) -> Self {
        Self {
            key,
            body: ItemBody::Data(payload.into()),
        }
    }

    /// Creates an internal item pointing at `child`.
    pub fn child(key: Key, child: BlockAddr) -> Self {
        Self {
            key,
            body: ItemBody::Child(child),
        }
    }

    /// Creates a twig-level extent item.
    pub fn extent(key: Key, start: BlockAddr, blocks: u64) -> Self {
        Self {
            key,
            body: ItemBody::Extent { start, blocks },
        }
    }
}

/// In-memory image of a formatted node as handed over by the block store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeData {
    /// Level of the node.
    pub level: Level,
    /// Items sorted by key; equal keys are allowed.
    pub items: Vec<Item>,
}

impl NodeData {
    /// Creates a node image.
    pub fn new(level: Level, items: Vec<Item>) -> Self {
        Self { level, items }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the node holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Key range a node is responsible for: `left <= key < right`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DelimitingKeys {
    /// Smallest key the node may hold.
    pub left: Key,
    /// Left delimiting key of the right neighbor.
    pub right: Key,
}

impl DelimitingKeys {
    /// Range of the root node.
    pub const FULL: DelimitingKeys = DelimitingKeys {
        left: Key::MIN,
        right: Key::MAX,
    };

    /// Creates a range.
    pub const fn new(left: Key, right: Key) -> Self {
        Self { left, right }
    }

    /// Returns true if a search for `key` may land in this node.
    pub fn contains(&self, key: &Key) -> bool {
        self.left <= *key && (*key < self.right || self.right == Key::MAX)
    }

    /// Returns true if `key` cannot also live in the left neighbor.
    ///
    /// A non-unique key equal to the left delimiting key may have earlier
    /// duplicates to the left, so only unique keys may sit on the boundary.
    pub fn contains_strict(&self, key: &Key, unique: bool) -> bool {
        let left_ok = *key > self.left || (unique && *key == self.left);
        left_ok && (*key < self.right || self.right == Key::MAX)
    }

    /// Returns true if the whole range `[min, max]` falls inside this node.
    pub fn covers(&self, min: &Key, max: &Key) -> bool {
        self.contains(min) && self.contains(max)
    }
}

impl fmt::Display for DelimitingKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.left, self.right)
    }
}

/// In-memory handle of one disk-resident tree node.
pub struct TreeNode {
    addr: BlockAddr,
    level: Level,
    lock: Arc<NodeLock>,
    data: RwLock<NodeData>,
}

impl TreeNode {
    pub(crate) fn new(addr: BlockAddr, data: NodeData, convoy: usize) -> Self {
        Self {
            addr,
            level: data.level,
            lock: Arc::new(NodeLock::new(addr.0, convoy)),
            data: RwLock::new(data),
        }
    }

    /// Disk address (possibly a placeholder).
    pub fn addr(&self) -> BlockAddr {
        self.addr
    }

    /// Tree level; leaves are at level 1.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Long-term lock of the node.
    pub fn lock(&self) -> &Arc<NodeLock> {
        &self.lock
    }

    /// Returns true once the node was removed from the tree.
    pub fn is_removed(&self) -> bool {
        self.lock.is_invalid()
    }

    /// Read access to the node content. Callers hold a long-term lock.
    pub fn data(&self) -> RwLockReadGuard<'_, NodeData> {
        self.data.read()
    }

    /// Write access; only balancing code holding the write lock may modify content.
    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, NodeData> {
        self.data.write()
    }

    /// Number of items in the node.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the node has no items.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("addr", &self.addr)
            .field("level", &self.level)
            .field("lock", &self.lock.snapshot())
            .finish()
    }
}

/// A tree node together with a long-term lock held on it.
pub struct LockedNode {
    node: Arc<TreeNode>,
    handle: LockHandle,
}

impl LockedNode {
    pub(crate) fn new(node: Arc<TreeNode>, handle: LockHandle) -> Self {
        Self { node, handle }
    }

    /// The locked node.
    pub fn node(&self) -> &Arc<TreeNode> {
        &self.node
    }

    /// Mode the lock was granted in.
    pub fn mode(&self) -> LockMode {
        self.handle.mode()
    }

    /// Lock handle.
    pub fn handle(&self) -> &LockHandle {
        &self.handle
    }

    /// Releases the lock.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn into_parts(self) -> (Arc<TreeNode>, LockHandle) {
        (self.node, self.handle)
    }
}

impl Deref for LockedNode {
    type Target = TreeNode;

    fn deref(&self) -> &TreeNode {
        &self.node
    }
}

impl fmt::Debug for LockedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedNode")
            .field("addr", &self.node.addr)
            .field("mode", &self.mode())
            .finish()
    }
}
