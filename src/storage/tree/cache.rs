use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use crate::types::{BlockAddr, Key, Level};

use super::node::TreeNode;
use super::DkTable;

/// Small LRU of recently resolved nodes, probed before a full descent.
///
/// Slots hold weak references so a cached node can still be evicted from the
/// node index. Hits are only hints: the caller locks the node and re-checks
/// its delimiting keys before trusting it.
pub(crate) struct ResultCache {
    slots: Option<Mutex<LruCache<BlockAddr, Weak<TreeNode>>>>,
}

impl ResultCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.slots.is_some()
    }

    /// Finds a cached node at `level` whose range strictly contains `key`.
    ///
    /// Scans from most to least recently used and promotes the hit. The
    /// delimiting-key table is consulted under the cache mutex.
    pub(crate) fn find(
        &self,
        dk: &DkTable,
        key: &Key,
        level: Level,
        unique: bool,
    ) -> Option<Arc<TreeNode>> {
        let slots = self.slots.as_ref()?;
        let mut slots = slots.lock();
        let mut dead = Vec::new();
        let mut hit = None;
        {
            let dk = dk.read();
            for (addr, weak) in slots.iter() {
                let Some(node) = weak.upgrade() else {
                    dead.push(*addr);
                    continue;
                };
                if node.level() != level || node.is_removed() {
                    continue;
                }
                if dk
                    .get(addr)
                    .map(|range| range.contains_strict(key, unique))
                    .unwrap_or(false)
                {
                    hit = Some(node);
                    break;
                }
            }
        }
        for addr in dead {
            slots.pop(&addr);
        }
        if let Some(node) = hit.as_ref() {
            slots.promote(&node.addr());
        }
        hit
    }

    pub(crate) fn add(&self, node: &Arc<TreeNode>) {
        if let Some(slots) = self.slots.as_ref() {
            slots.lock().put(node.addr(), Arc::downgrade(node));
        }
    }

    pub(crate) fn invalidate(&self, addr: BlockAddr) {
        if let Some(slots) = self.slots.as_ref() {
            slots.lock().pop(&addr);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.as_ref().map(|slots| slots.lock().len()).unwrap_or(0)
    }

    /// Cached addresses from most to least recently used.
    pub(crate) fn addrs(&self) -> Vec<BlockAddr> {
        self.slots
            .as_ref()
            .map(|slots| slots.lock().iter().map(|(addr, _)| *addr).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::node::{DelimitingKeys, NodeData};
    use parking_lot::RwLock;

    fn node(addr: u64, level: Level) -> Arc<TreeNode> {
        Arc::new(TreeNode::new(BlockAddr(addr), NodeData::new(level, Vec::new()), 2))
    }

    fn table(entries: &[(u64, (u64, u64))]) -> DkTable {
        RwLock::new(
            entries
                .iter()
                .map(|&(addr, (l, r))| {
                    (BlockAddr(addr), DelimitingKeys::new(Key::new(l, 0), Key::new(r, 0)))
                })
                .collect(),
        )
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResultCache::new(0);
        let a = node(1, 1);
        cache.add(&a);
        assert!(!cache.enabled());
        assert!(cache.find(&table(&[(1, (0, 10))]), &Key::new(5, 0), 1, true).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn hit_requires_strict_containment_and_level() {
        let cache = ResultCache::new(4);
        let a = node(1, 1);
        let b = node(2, 2);
        cache.add(&a);
        cache.add(&b);
        let dk = table(&[(1, (10, 20)), (2, (0, 100))]);
        let hit = cache.find(&dk, &Key::new(15, 0), 1, false).unwrap();
        assert_eq!(hit.addr(), BlockAddr(1));
        // Boundary key with possible duplicates on the left.
        assert!(cache.find(&dk, &Key::new(10, 0), 1, false).is_none());
        assert!(cache.find(&dk, &Key::new(10, 0), 1, true).is_some());
        assert!(cache.find(&dk, &Key::new(20, 0), 1, true).is_none());
        assert_eq!(cache.addrs().first(), Some(&BlockAddr(1)));
    }

    #[test]
    fn dead_and_invalidated_slots_drop_out() {
        let cache = ResultCache::new(2);
        let a = node(1, 1);
        cache.add(&a);
        cache.add(&node(2, 1));
        let dk = table(&[(1, (0, 5)), (2, (5, 9))]);
        assert!(cache.find(&dk, &Key::new(6, 0), 1, true).is_none());
        assert_eq!(cache.len(), 1);
        cache.invalidate(BlockAddr(1));
        assert_eq!(cache.len(), 0);
        drop(a);
    }

    #[test]
    fn least_recently_used_slot_is_recycled() {
        let cache = ResultCache::new(2);
        let (a, b, c) = (node(1, 1), node(2, 1), node(3, 1));
        cache.add(&a);
        cache.add(&b);
        let dk = table(&[(1, (0, 5)), (2, (5, 9)), (3, (9, 12))]);
        assert!(cache.find(&dk, &Key::new(1, 0), 1, true).is_some());
        cache.add(&c);
        assert_eq!(cache.addrs(), vec![BlockAddr(3), BlockAddr(1)]);
    }
}
