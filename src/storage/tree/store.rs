use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::types::{BlockAddr, Result, TreeError};

use super::node::NodeData;

/// Source of node images. Reads and writes whole nodes by address.
pub trait BlockStore: Send + Sync {
    /// Reads the node stored at `addr`.
    fn read_node(&self, addr: BlockAddr) -> Result<NodeData>;
    /// Stores `data` at `addr`.
    fn write_node(&self, addr: BlockAddr, data: &NodeData) -> Result<()>;
    /// Reserves a fresh address.
    fn allocate(&self) -> Result<BlockAddr>;
    /// Returns `addr` to the free pool.
    fn free(&self, addr: BlockAddr) -> Result<()>;
    /// Number of addressable blocks; real addresses must be below this.
    fn block_count(&self) -> u64;
}

/// Block store keeping node images in memory.
pub struct MemStore {
    blocks: RwLock<FxHashMap<BlockAddr, NodeData>>,
    next: AtomicU64,
    capacity: u64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemStore {
    /// Creates a store able to address `capacity` blocks. Address 0 is never handed out.
    pub fn new(capacity: u64) -> Self {
        Self {
            blocks: RwLock::new(FxHashMap::default()),
            next: AtomicU64::new(1),
            capacity,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Places a node image at a chosen address, e.g. to build a tree by hand.
    pub fn put(&self, addr: BlockAddr, data: NodeData) -> Result<()> {
        if addr.0 >= self.capacity {
            return Err(TreeError::InvalidArgument("block address out of range"));
        }
        self.next.fetch_max(addr.0 + 1, Ordering::AcqRel);
        self.blocks.write().insert(addr, data);
        Ok(())
    }

    /// Number of node reads served so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of node writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of blocks currently stored.
    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemStore {
    fn read_node(&self, addr: BlockAddr) -> Result<NodeData> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.blocks
            .read()
            .get(&addr)
            .cloned()
            .ok_or(TreeError::Corruption("reference to an unallocated block"))
    }

    fn write_node(&self, addr: BlockAddr, data: &NodeData) -> Result<()> {
        if addr.is_fake() || addr.0 >= self.capacity {
            return Err(TreeError::InvalidArgument("cannot write to this address"));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.blocks.write().insert(addr, data.clone());
        Ok(())
    }

    fn allocate(&self) -> Result<BlockAddr> {
        let addr = self.next.fetch_add(1, Ordering::AcqRel);
        if addr >= self.capacity {
            return Err(TreeError::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "block store is full",
            )));
        }
        Ok(BlockAddr(addr))
    }

    fn free(&self, addr: BlockAddr) -> Result<()> {
        self.blocks.write().remove(&addr);
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tree::node::Item;
    use crate::types::Key;

    #[test]
    fn allocate_write_read() -> Result<()> {
        let store = MemStore::new(8);
        let addr = store.allocate()?;
        assert_eq!(addr, BlockAddr(1));
        let data = NodeData::new(1, vec![Item::data(Key::new(1, 0), &b"a"[..])]);
        store.write_node(addr, &data)?;
        assert_eq!(store.read_node(addr)?, data);
        assert_eq!(store.reads(), 1);
        store.free(addr)?;
        assert!(matches!(store.read_node(addr), Err(TreeError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn put_moves_allocation_cursor() -> Result<()> {
        let store = MemStore::new(16);
        store.put(BlockAddr(9), NodeData::new(1, Vec::new()))?;
        assert_eq!(store.allocate()?, BlockAddr(10));
        assert!(store.put(BlockAddr(16), NodeData::default()).is_err());
        Ok(())
    }

    #[test]
    fn full_store_reports_io_error() {
        let store = MemStore::new(2);
        assert!(store.allocate().is_ok());
        assert!(matches!(store.allocate(), Err(TreeError::Io(_))));
    }
}
