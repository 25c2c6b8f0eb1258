//! Shared identifiers, keys, lock modes and the crate-wide error type.

use std::fmt;

use serde::Serialize;

/// Tree level of a node. Leaves live at [`LEAF_LEVEL`]; the root has the largest level.
pub type Level = u8;

/// Level of formatted leaf nodes.
pub const LEAF_LEVEL: Level = 1;
/// Level of the nodes directly above the leaves.
pub const TWIG_LEVEL: Level = 2;
/// Maximal supported tree height.
pub const MAX_TREE_HEIGHT: Level = 8;

const FAKE_BIT: u64 = 1 << 63;

/// Disk address of a tree node.
///
/// Nodes created by balancing before block allocation carry a placeholder
/// ("fake") address with the top bit set.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    /// Address of the uber node, the fake parent of the tree root.
    pub const UBER: BlockAddr = BlockAddr(u64::MAX);

    /// Builds a placeholder address for a not yet allocated node.
    pub const fn fake(seq: u64) -> Self {
        BlockAddr(seq | FAKE_BIT)
    }

    /// Returns true for placeholder addresses (including the uber node).
    pub const fn is_fake(self) -> bool {
        self.0 & FAKE_BIT != 0
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == BlockAddr::UBER {
            write!(f, "uber")
        } else if self.is_fake() {
            write!(f, "fake:{}", self.0 & !FAKE_BIT)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Search key. Keys order by object id first, then by offset within the object.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct Key {
    /// Object the key belongs to.
    pub object: u64,
    /// Offset of the item within the object.
    pub offset: u64,
}

impl Key {
    /// Smallest possible key.
    pub const MIN: Key = Key {
        object: 0,
        offset: 0,
    };
    /// Largest possible key.
    pub const MAX: Key = Key {
        object: u64::MAX,
        offset: u64::MAX,
    };

    /// Creates a key.
    pub const fn new(object: u64, offset: u64) -> Self {
        Key { object, offset }
    }

    /// The key right before this one, or `None` for [`Key::MIN`].
    pub fn prev(self) -> Option<Key> {
        match (self.object, self.offset) {
            (0, 0) => None,
            (object, 0) => Some(Key::new(object - 1, u64::MAX)),
            (object, offset) => Some(Key::new(object, offset - 1)),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object, self.offset)
    }
}

/// Mode of a long-term node lock.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockMode {
    /// Shared lock; any number of readers may hold it together.
    Read,
    /// Exclusive lock; recursive for the owning lock stack.
    Write,
}

/// Priority of a lock request.
///
/// Low-priority owners are asked to yield their locks when a high-priority
/// request cannot be served on a node without any high-priority owner.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum LockPriority {
    /// Requests issued in the natural (top-down) order.
    Low,
    /// Requests issued against the natural order, e.g. going up to a parent.
    High,
}

/// Errors surfaced by the locking and traversal engine.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// Lock temporarily unavailable or cached assumptions went stale; retry the step.
    #[error("operation must be repeated")]
    Repeat,
    /// A held lock was asked to yield; release everything and restart.
    #[error("deadlock avoidance: locks must be released and the operation restarted")]
    Deadlock,
    /// The node is being removed from the tree.
    #[error("node is being removed from the tree")]
    Invalid,
    /// A non-blocking lock request could not be granted immediately.
    #[error("lock request would block")]
    WouldBlock,
    /// The requested sibling or parent does not exist.
    #[error("no neighbor")]
    NoNeighbor,
    /// The requested item does not exist.
    #[error("not found")]
    NotFound,
    /// Structural inconsistency detected in the tree.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Error reported by the block store.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Caller supplied arguments that make no sense.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl TreeError {
    /// Returns true for outcomes that are resolved by retrying rather than reported.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TreeError::Repeat | TreeError::Deadlock | TreeError::Invalid | TreeError::WouldBlock
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_addresses_are_tagged() {
        let addr = BlockAddr::fake(7);
        assert!(addr.is_fake());
        assert!(!BlockAddr(7).is_fake());
        assert!(BlockAddr::UBER.is_fake());
        assert_eq!(addr.to_string(), "fake:7");
        assert_eq!(BlockAddr::UBER.to_string(), "uber");
    }

    #[test]
    fn keys_order_by_object_then_offset() {
        assert!(Key::new(1, 100) < Key::new(2, 0));
        assert!(Key::new(2, 0) < Key::new(2, 1));
        assert!(Key::MIN <= Key::new(0, 0));
        assert!(Key::new(u64::MAX, 3) < Key::MAX);
    }

    #[test]
    fn prev_steps_back_across_objects() {
        assert_eq!(Key::new(3, 5).prev(), Some(Key::new(3, 4)));
        assert_eq!(Key::new(3, 0).prev(), Some(Key::new(2, u64::MAX)));
        assert_eq!(Key::MIN.prev(), None);
    }

    #[test]
    fn retryable_classification() {
        assert!(TreeError::Deadlock.is_retryable());
        assert!(TreeError::Repeat.is_retryable());
        assert!(!TreeError::Corruption("x").is_retryable());
        assert!(!TreeError::NoNeighbor.is_retryable());
    }
}
