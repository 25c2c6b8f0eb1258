//! Node layout plugins: how keys are looked up inside one formatted node.

use crate::types::{BlockAddr, Key};

use super::node::{ItemBody, NodeData};

/// How a key that is not present in a node should be resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Bias {
    /// Position at the leftmost item equal to the key, or at the insertion point.
    #[default]
    Exact,
    /// Position at the rightmost item whose key is not greater than the key.
    MaxNotMoreThan,
}

/// Outcome of a lookup inside one node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeLookup {
    /// An item with exactly the searched key sits at the position.
    Found,
    /// No item with the key; the position is where it would go.
    NotFound,
}

/// Where a coordinate points relative to an item.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Between {
    /// At the item itself.
    AtUnit,
    /// Just before the item.
    BeforeUnit,
    /// Just after the item.
    AfterUnit,
    /// The node has no items.
    EmptyNode,
}

/// Position inside a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Position {
    /// Item index.
    pub pos: usize,
    /// Relation to the item at `pos`.
    pub between: Between,
}

impl Position {
    /// Position at item `pos`.
    pub const fn at(pos: usize) -> Self {
        Self {
            pos,
            between: Between::AtUnit,
        }
    }

    /// Position before item `pos`.
    pub const fn before(pos: usize) -> Self {
        Self {
            pos,
            between: Between::BeforeUnit,
        }
    }

    /// Position after item `pos`.
    pub const fn after(pos: usize) -> Self {
        Self {
            pos,
            between: Between::AfterUnit,
        }
    }

    /// Position in an empty node.
    pub const fn empty() -> Self {
        Self {
            pos: 0,
            between: Between::EmptyNode,
        }
    }

    /// Index at which an item would be inserted to land at this position.
    pub fn insertion_index(&self) -> usize {
        match self.between {
            Between::AtUnit | Between::AfterUnit => self.pos + 1,
            Between::BeforeUnit | Between::EmptyNode => self.pos,
        }
    }
}

/// Per-node-format operations used by the search engine.
pub trait NodeLayout: Send + Sync {
    /// Looks up `key` in `data`.
    fn lookup_in_node(&self, data: &NodeData, key: &Key, bias: Bias) -> (NodeLookup, Position);

    /// Child address stored at `pos`, if the item there is an internal item.
    fn child_pointer(&self, data: &NodeData, pos: usize) -> Option<BlockAddr>;

    /// Returns true if the item at `pos` points at a formatted child.
    fn item_is_internal(&self, data: &NodeData, pos: usize) -> bool {
        self.child_pointer(data, pos).is_some()
    }

    /// Index of the internal item pointing at `child`, if any.
    fn find_child(&self, data: &NodeData, child: BlockAddr, hint: usize) -> Option<usize> {
        if self.child_pointer(data, hint) == Some(child) {
            return Some(hint);
        }
        (0..data.len()).find(|&pos| self.child_pointer(data, pos) == Some(child))
    }
}

/// Layout of nodes whose items are kept sorted in a vector.
#[derive(Copy, Clone, Debug, Default)]
pub struct SortedLayout;

impl NodeLayout for SortedLayout {
    fn lookup_in_node(&self, data: &NodeData, key: &Key, bias: Bias) -> (NodeLookup, Position) {
        let items = &data.items;
        if items.is_empty() {
            return (NodeLookup::NotFound, Position::empty());
        }
        match bias {
            Bias::Exact => {
                let idx = items.partition_point(|item| item.key < *key);
                if idx == items.len() {
                    (NodeLookup::NotFound, Position::after(idx - 1))
                } else if items[idx].key == *key {
                    (NodeLookup::Found, Position::at(idx))
                } else {
                    (NodeLookup::NotFound, Position::before(idx))
                }
            }
            Bias::MaxNotMoreThan => {
                let idx = items.partition_point(|item| item.key <= *key);
                if idx == 0 {
                    return (NodeLookup::NotFound, Position::before(0));
                }
                let pos = idx - 1;
                if items[pos].key == *key {
                    (NodeLookup::Found, Position::at(pos))
                } else {
                    (NodeLookup::NotFound, Position::at(pos))
                }
            }
        }
    }

    fn child_pointer(&self, data: &NodeData, pos: usize) -> Option<BlockAddr> {
        match data.items.get(pos).map(|item| &item.body) {
            Some(ItemBody::Child(addr)) => Some(*addr),
            _ => None,
        }
    }
}
