//! Concurrent lock-coupled tree traversal: per-node priority locks, a
//! coordinate-by-key search engine, sibling connectivity and a generic walker.
//!
//! ```
//! use std::sync::Arc;
//! use treelock::primitives::concurrency::LockStack;
//! use treelock::storage::tree::{Item, MemStore, SortedLayout, Tree};
//! use treelock::storage::TreeOptions;
//! use treelock::types::Key;
//!
//! let tree = Tree::create(
//!     Arc::new(MemStore::new(1024)),
//!     Arc::new(SortedLayout),
//!     TreeOptions::default(),
//! )?;
//! let stack = LockStack::new();
//! tree.insert(&stack, Item::data(Key::new(7, 0), "seven"))?;
//! assert!(tree.get(&stack, &Key::new(7, 0))?.is_some());
//! # Ok::<(), treelock::types::TreeError>(())
//! ```

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::tree::Tree;
pub use storage::TreeOptions;
pub use types::{Key, Result, TreeError};
