//! Concurrent balanced tree over a block store.
//!
//! Loaded nodes live in a node index guarded by one tree-wide `RwLock`; node
//! ranges (delimiting keys) live in a separate table with its own lock. Both
//! are short critical sections. Long-term node locks come from
//! [`crate::primitives::concurrency`] and are taken through a [`LockStack`]
//! owned by the calling operation.

mod balance;
mod cache;
mod connect;
#[cfg(test)]
mod hooks;
mod index;
mod layout;
mod node;
mod search;
mod stats;
mod store;
mod walk;

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::primitives::concurrency::{LockRequest, LockStack};
use crate::storage::options::TreeOptions;
use crate::types::{BlockAddr, Key, Level, LockMode, Result, TreeError, LEAF_LEVEL, MAX_TREE_HEIGHT};

pub use connect::{NeighborFlags, Relative};
pub use index::{LinkState, Side};
pub use layout::{Between, Bias, NodeLayout, NodeLookup, Position, SortedLayout};
pub use node::{DelimitingKeys, Item, ItemBody, LockedNode, NodeData, TreeNode};
pub use search::{Coord, ObjectRange, SearchFlags, SearchRequest, SearchResult};
pub use stats::{TreeStats, TreeStatsSnapshot};
pub use store::{BlockStore, MemStore};
pub use walk::{TreeVisitor, WalkControl, WalkDirection, WalkItem, WalkStart, WalkSummary};

use cache::ResultCache;
use index::NodeIndex;

pub(crate) type DkTable = RwLock<FxHashMap<BlockAddr, DelimitingKeys>>;

#[derive(Copy, Clone, Debug)]
struct TreeRoot {
    addr: BlockAddr,
    height: Level,
}

/// Concurrent tree handle. Shared between threads behind an `Arc`.
pub struct Tree {
    store: Arc<dyn BlockStore>,
    layout: Arc<dyn NodeLayout>,
    options: TreeOptions,
    /// Fake parent of the root; its lock serializes root replacement.
    uber: Arc<TreeNode>,
    /// Root location, changed only while the uber node is write-locked.
    root: Mutex<TreeRoot>,
    index: RwLock<NodeIndex>,
    dk: DkTable,
    cache: ResultCache,
    stats: TreeStats,
    #[cfg(test)]
    hooks: hooks::SearchHooks,
}

/// Introspection record for one loaded node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Node address.
    pub addr: BlockAddr,
    /// Node level.
    pub level: Level,
    /// Number of items.
    pub items: usize,
    /// Delimiting keys, if known.
    pub dk: Option<(Key, Key)>,
    /// Left sibling link.
    pub left: LinkState,
    /// Right sibling link.
    pub right: LinkState,
    /// Whether a long-term lock is held.
    pub locked: bool,
}

impl Tree {
    /// Creates an empty tree: a single empty leaf as root.
    pub fn create(
        store: Arc<dyn BlockStore>,
        layout: Arc<dyn NodeLayout>,
        options: TreeOptions,
    ) -> Result<Tree> {
        let root = store.allocate()?;
        store.write_node(root, &NodeData::new(LEAF_LEVEL, Vec::new()))?;
        Self::open(store, layout, options, root, LEAF_LEVEL)
    }

    /// Opens an existing tree rooted at `root` with the given height.
    pub fn open(
        store: Arc<dyn BlockStore>,
        layout: Arc<dyn NodeLayout>,
        options: TreeOptions,
        root: BlockAddr,
        height: Level,
    ) -> Result<Tree> {
        options
            .validate()
            .map_err(|_| TreeError::InvalidArgument("invalid tree options"))?;
        if height < LEAF_LEVEL || height > MAX_TREE_HEIGHT {
            return Err(TreeError::InvalidArgument("tree height out of range"));
        }
        let uber = Arc::new(TreeNode::new(
            BlockAddr::UBER,
            NodeData::new(Level::MAX, Vec::new()),
            options.convoy_size,
        ));
        let cache = ResultCache::new(options.cache_slots);
        let tree = Tree {
            store,
            layout,
            uber,
            root: Mutex::new(TreeRoot { addr: root, height }),
            index: RwLock::new(NodeIndex::default()),
            dk: RwLock::new(FxHashMap::default()),
            cache,
            stats: TreeStats::default(),
            options,
            #[cfg(test)]
            hooks: hooks::SearchHooks::default(),
        };
        tree.dk.write().insert(root, DelimitingKeys::FULL);
        tracing::debug!(root = %root, height, "tree opened");
        Ok(tree)
    }

    /// Address and height of the current root.
    pub fn root(&self) -> (BlockAddr, Level) {
        let root = *self.root.lock();
        (root.addr, root.height)
    }

    /// Current tree height.
    pub fn height(&self) -> Level {
        self.root.lock().height
    }

    /// Options the tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    /// Traversal statistics.
    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    /// Locks `node` on behalf of `stack`.
    pub fn lock_node(
        &self,
        stack: &LockStack,
        node: &Arc<TreeNode>,
        request: LockRequest,
    ) -> Result<LockedNode> {
        match node.lock().acquire(stack, request) {
            Ok(handle) => Ok(LockedNode::new(Arc::clone(node), handle)),
            Err(TreeError::Deadlock) => {
                self.stats.inc_deadlock_yields();
                Err(TreeError::Deadlock)
            }
            Err(err) => Err(err),
        }
    }

    /// Locks the uber node. Holding it in read mode pins the root; write mode
    /// is required to replace the root.
    pub fn lock_uber(&self, stack: &LockStack, request: LockRequest) -> Result<LockedNode> {
        self.lock_node(stack, &self.uber, request)
    }

    /// Returns the loaded node at `addr`, reading it from the store if needed.
    ///
    /// Validates the address range and that the stored level matches the
    /// level the caller expects. `parent` records where the node hangs.
    pub(crate) fn load_node(
        &self,
        addr: BlockAddr,
        level: Level,
        parent: Option<(&Arc<TreeNode>, usize)>,
    ) -> Result<Arc<TreeNode>> {
        if addr == BlockAddr::UBER {
            return Err(TreeError::Corruption("uber node referenced as a child"));
        }
        if !addr.is_fake() && addr.0 >= self.store.block_count() {
            tracing::error!(addr = %addr, "block address out of range");
            return Err(TreeError::Corruption("block address out of range"));
        }
        let cached = self.index.read().get(addr);
        let node = match cached {
            Some(node) => node,
            None => {
                let data = self.store.read_node(addr)?;
                self.stats.inc_node_loads();
                if data.level != level {
                    tracing::error!(addr = %addr, expected = level, found = data.level, "node level mismatch");
                    return Err(TreeError::Corruption("node level does not match its parent"));
                }
                let node = Arc::new(TreeNode::new(addr, data, self.options.convoy_size));
                let node = self.index.write().insert(node);
                tracing::trace!(addr = %addr, level, "node loaded");
                node
            }
        };
        if node.level() != level {
            return Err(TreeError::Corruption("node level does not match its parent"));
        }
        if let Some((parent, pos)) = parent {
            let current = self.index.read().parent(addr);
            let stale = current
                .map(|link| !Arc::ptr_eq(&link.node, parent) || link.pos_hint != pos)
                .unwrap_or(true);
            if stale {
                self.index.write().set_parent(addr, parent, pos);
            }
        }
        Ok(node)
    }

    /// Loaded node at `addr`, if any.
    pub fn node(&self, addr: BlockAddr) -> Option<Arc<TreeNode>> {
        self.index.read().get(addr)
    }

    /// Number of loaded nodes.
    pub fn loaded_nodes(&self) -> usize {
        self.index.read().len()
    }

    /// Drops loaded nodes that nobody references. Returns how many were dropped.
    ///
    /// Parents stay pinned by their loaded children, so eviction proceeds
    /// bottom-up over repeated calls.
    pub fn evict_unused(&self) -> usize {
        let root = self.root.lock().addr;
        let evicted = {
            // A node reloaded right after eviction must not find its old range.
            let mut index = self.index.write();
            let mut dk = self.dk.write();
            let unused = index.unused(root);
            for addr in &unused {
                index.remove(*addr);
                dk.remove(addr);
            }
            unused
        };
        for addr in &evicted {
            self.cache.invalidate(*addr);
        }
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted unused nodes");
        }
        evicted.len()
    }

    /// Delimiting keys of a loaded node.
    pub fn delimiting_keys(&self, addr: BlockAddr) -> Option<DelimitingKeys> {
        self.dk.read().get(&addr).copied()
    }

    pub(crate) fn set_delimiting_keys(&self, addr: BlockAddr, keys: DelimitingKeys) {
        self.dk.write().insert(addr, keys);
    }

    /// Sibling link state of a loaded node.
    pub fn sibling_link(&self, addr: BlockAddr, side: Side) -> Option<LinkState> {
        self.index.read().link_state(addr, side)
    }

    /// Addresses in the result cache, most recently used first.
    pub fn cached_nodes(&self) -> Vec<BlockAddr> {
        self.cache.addrs()
    }

    /// Describes every loaded node, sorted by level (top first) then by left key.
    pub fn loaded_node_info(&self) -> Vec<NodeInfo> {
        let nodes: Vec<Arc<TreeNode>> = {
            let index = self.index.read();
            index.addrs().into_iter().filter_map(|a| index.get(a)).collect()
        };
        let mut infos: Vec<NodeInfo> = nodes
            .iter()
            .map(|node| {
                let addr = node.addr();
                NodeInfo {
                    addr,
                    level: node.level(),
                    items: node.len(),
                    dk: self.delimiting_keys(addr).map(|dk| (dk.left, dk.right)),
                    left: self.sibling_link(addr, Side::Left).unwrap_or(LinkState::Unknown),
                    right: self.sibling_link(addr, Side::Right).unwrap_or(LinkState::Unknown),
                    locked: node.lock().is_locked(),
                }
            })
            .collect();
        infos.sort_by(|a, b| b.level.cmp(&a.level).then(a.dk.cmp(&b.dk)).then(a.addr.cmp(&b.addr)));
        infos
    }

    /// Checks link invariants over the loaded part of the tree.
    ///
    /// Connected siblings must point back at each other and their ranges must
    /// not overlap. The ranges touch unless unformatted extents lie between.
    pub fn check_links(&self) -> Result<()> {
        let index = self.index.read();
        let dk = self.dk.read();
        for addr in index.addrs() {
            let Some(LinkState::Present(right)) = index.link_state(addr, Side::Right) else {
                continue;
            };
            if index.link_state(right, Side::Left) != Some(LinkState::Present(addr)) {
                tracing::error!(left = %addr, right = %right, "sibling links disagree");
                return Err(TreeError::Corruption("sibling links are not symmetric"));
            }
            if let (Some(l), Some(r)) = (dk.get(&addr), dk.get(&right)) {
                // A node holding nothing but duplicates of its neighbor's
                // left key has an empty range.
                let empty = l.left == l.right;
                if l.right > r.left || (l.left >= r.left && !empty) {
                    tracing::error!(left = %addr, right = %right, "delimiting keys disagree");
                    return Err(TreeError::Corruption("neighbor delimiting keys do not match"));
                }
            }
        }
        Ok(())
    }

    /// Reads the whole tree under read locks, bypassing the cache. Used by dumps.
    pub fn collect_nodes(&self, stack: &LockStack) -> Result<Vec<(BlockAddr, NodeData)>> {
        let uber = self.lock_uber(stack, LockRequest::read())?;
        let root = *self.root.lock();
        let mut out = Vec::new();
        let mut pending = vec![(root.addr, root.height, None::<(Arc<TreeNode>, usize)>)];
        while let Some((addr, level, parent)) = pending.pop() {
            let node = self.load_node(addr, level, parent.as_ref().map(|(p, pos)| (p, *pos)))?;
            let locked = self.lock_node(stack, &node, LockRequest::new(LockMode::Read))?;
            let data = locked.data().clone();
            for pos in (0..data.len()).rev() {
                if let Some(child) = self.layout.child_pointer(&data, pos) {
                    pending.push((child, level - 1, Some((Arc::clone(&node), pos))));
                }
            }
            out.push((addr, data));
        }
        drop(uber);
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn hooks(&self) -> &hooks::SearchHooks {
        &self.hooks
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = *self.root.lock();
        f.debug_struct("Tree")
            .field("root", &root.addr)
            .field("height", &root.height)
            .field("loaded", &self.loaded_nodes())
            .finish()
    }
}
