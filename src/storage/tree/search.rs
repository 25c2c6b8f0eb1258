//! Coordinate-by-key search.
//!
//! A search first probes the result cache, then descends from the root (or
//! from a virtual root) with lock coupling: the child is locked before the
//! parent is released. Every freshly locked node is verified against its
//! delimiting keys; a node whose range moved away while we waited for its
//! lock sends the search back to the start.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::primitives::concurrency::{LockRequest, LockStack};
use crate::types::{BlockAddr, Key, Level, LockMode, Result, TreeError, LEAF_LEVEL};

use super::connect::NeighborFlags;
use super::index::Side;
use super::layout::{Between, Bias, NodeLookup, Position};
use super::node::{DelimitingKeys, Item, LockedNode, TreeNode};
use super::Tree;

/// Local retries of a non-blocking step before the whole search restarts.
const LOCAL_RETRIES: usize = 4;

/// Search modifiers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SearchFlags {
    /// The key is known to be unique; skip the leftmost-duplicate scan.
    pub unique: bool,
    /// Only consult the result cache; a miss reports [`TreeError::NotFound`].
    pub cache_only: bool,
}

/// Key range of one object together with its cached virtual root.
///
/// The virtual root is the lowest node seen so far whose range covers the
/// whole object; searches carrying the range start there instead of at the
/// root.
#[derive(Debug)]
pub struct ObjectRange {
    min: Key,
    max: Key,
    vroot: Mutex<Option<BlockAddr>>,
}

impl ObjectRange {
    /// Range `[min, max]` with no virtual root yet.
    pub fn new(min: Key, max: Key) -> Self {
        Self {
            min,
            max,
            vroot: Mutex::new(None),
        }
    }

    /// All keys of object `object`.
    pub fn object(object: u64) -> Self {
        Self::new(Key::new(object, 0), Key::new(object, u64::MAX))
    }

    /// Smallest key of the range.
    pub fn min(&self) -> Key {
        self.min
    }

    /// Largest key of the range.
    pub fn max(&self) -> Key {
        self.max
    }

    /// Current virtual root.
    pub fn vroot(&self) -> Option<BlockAddr> {
        *self.vroot.lock()
    }

    /// Forgets the virtual root.
    pub fn clear_vroot(&self) {
        *self.vroot.lock() = None;
    }

    fn set_vroot(&self, addr: BlockAddr) {
        *self.vroot.lock() = Some(addr);
    }
}

/// Parameters of one search.
#[derive(Copy, Clone, Debug)]
pub struct SearchRequest<'a> {
    /// Target key.
    pub key: Key,
    /// Lock mode wanted on the returned node.
    pub mode: LockMode,
    /// Resolution of absent keys.
    pub bias: Bias,
    /// Levels at or below this one are locked in `mode`; above it in read mode.
    pub lock_level: Level,
    /// Level at which the search stops.
    pub stop_level: Level,
    /// Modifiers.
    pub flags: SearchFlags,
    /// Object whose virtual root may shortcut the descent.
    pub object: Option<&'a ObjectRange>,
}

impl<'a> SearchRequest<'a> {
    /// Leaf-level search for `key` returning a lock in `mode`.
    pub fn new(key: Key, mode: LockMode) -> Self {
        Self {
            key,
            mode,
            bias: Bias::Exact,
            lock_level: LEAF_LEVEL,
            stop_level: LEAF_LEVEL,
            flags: SearchFlags::default(),
            object: None,
        }
    }

    /// Sets the bias.
    pub fn bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    /// Sets the lock floor level.
    pub fn lock_level(mut self, level: Level) -> Self {
        self.lock_level = level;
        self
    }

    /// Sets the stop level.
    pub fn stop_level(mut self, level: Level) -> Self {
        self.stop_level = level;
        self
    }

    /// Marks the key as unique.
    pub fn unique(mut self) -> Self {
        self.flags.unique = true;
        self
    }

    /// Restricts the search to the result cache.
    pub fn cache_only(mut self) -> Self {
        self.flags.cache_only = true;
        self
    }

    /// Attaches an object range with its virtual root.
    pub fn object(mut self, object: &'a ObjectRange) -> Self {
        self.object = Some(object);
        self
    }

    fn mode_at(&self, level: Level) -> LockMode {
        if level <= self.lock_level {
            self.mode
        } else {
            LockMode::Read
        }
    }
}

/// Location of a search result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Coord {
    /// Node address.
    pub addr: BlockAddr,
    /// Node level.
    pub level: Level,
    /// Position in the node.
    pub position: Position,
}

/// Outcome of a search: the coordinate and the lock held on its node.
#[derive(Debug)]
pub struct SearchResult {
    /// Whether an item with the exact key was found.
    pub lookup: NodeLookup,
    /// Where the search ended.
    pub coord: Coord,
    /// Lock on the node holding the coordinate.
    pub node: LockedNode,
}

impl SearchResult {
    /// Returns true if an item with the exact key sits at the coordinate.
    pub fn is_found(&self) -> bool {
        self.lookup == NodeLookup::Found
    }

    /// Copy of the item at the coordinate, if it points at one.
    pub fn item(&self) -> Option<Item> {
        if self.coord.position.between != Between::AtUnit {
            return None;
        }
        self.node.data().items.get(self.coord.position.pos).cloned()
    }

    fn at(node: LockedNode, lookup: NodeLookup, position: Position) -> Self {
        let coord = Coord {
            addr: node.addr(),
            level: node.level(),
            position,
        };
        Self { lookup, coord, node }
    }
}

struct Descent {
    parent: Option<LockedNode>,
    addr: BlockAddr,
    level: Level,
    pos_in_parent: usize,
    hint: Option<DelimitingKeys>,
    from_vroot: bool,
}

impl Tree {
    /// Leaf-level request for `key` using the configured lock floor level.
    pub fn request(&self, key: Key, mode: LockMode) -> SearchRequest<'static> {
        SearchRequest::new(key, mode).lock_level(self.options.lock_level)
    }

    /// Finds the coordinate of `request.key` and returns it with its node locked.
    ///
    /// Deadlock signals and stale nodes restart the descent. When the caller
    /// still holds other locks on `stack` a deadlock signal is returned to it
    /// instead, since only the caller can release those.
    pub fn search_by_key(&self, stack: &LockStack, request: &SearchRequest<'_>) -> Result<SearchResult> {
        if request.stop_level < LEAF_LEVEL || request.lock_level < request.stop_level {
            return Err(TreeError::InvalidArgument("stop level must lie between the leaves and the lock level"));
        }
        self.stats.inc_searches();
        if self.cache.enabled() {
            if let Some(result) = self.search_cache(stack, request)? {
                self.stats.inc_cache_hits();
                return Ok(result);
            }
            self.stats.inc_cache_misses();
        }
        if request.flags.cache_only {
            return Err(TreeError::NotFound);
        }

        let mut restarts = 0u32;
        loop {
            stack.forget_contention();
            let err = match self.descend(stack, request) {
                Ok(result) => {
                    self.cache.add(result.node.node());
                    return Ok(result);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            if matches!(err, TreeError::Deadlock) && !stack.is_clean() {
                return Err(err);
            }
            self.stats.inc_restarts();
            // Refused try-locks are waited out here and do not count toward the limit.
            if matches!(err, TreeError::Repeat) && stack.wait_out_contention() {
                self.stats.inc_contention_waits();
                tracing::trace!(key = %request.key, "search waited out a contended node");
                continue;
            }
            restarts += 1;
            if restarts == self.options.restart_warn_threshold {
                tracing::warn!(key = %request.key, restarts, "search keeps restarting");
            }
            if restarts >= self.options.restart_limit {
                tracing::error!(key = %request.key, restarts, "search restart limit reached");
                return Err(TreeError::Corruption("too many search restarts"));
            }
            tracing::trace!(key = %request.key, restarts, cause = %err, "search restart");
            if !matches!(err, TreeError::Deadlock) {
                thread::yield_now();
            }
        }
    }

    fn search_cache(&self, stack: &LockStack, request: &SearchRequest<'_>) -> Result<Option<SearchResult>> {
        let key = request.key;
        let Some(node) = self.cache.find(&self.dk, &key, request.stop_level, request.flags.unique) else {
            return Ok(None);
        };
        #[cfg(test)]
        self.hooks.after_cache_probe(node.addr());
        let mode = request.mode_at(node.level());
        let locked = match self.lock_node(stack, &node, LockRequest::new(mode)) {
            Ok(locked) => locked,
            Err(TreeError::Invalid) => {
                self.cache.invalidate(node.addr());
                return Ok(None);
            }
            Err(TreeError::Deadlock) if !stack.is_clean() => return Err(TreeError::Deadlock),
            Err(err) if err.is_retryable() => return Ok(None),
            Err(err) => return Err(err),
        };
        if stack.has_pending_yield() {
            return Ok(None);
        }
        // The node may have been split or emptied between the probe and the lock.
        let still_valid = self
            .delimiting_keys(node.addr())
            .map(|dk| dk.contains_strict(&key, request.flags.unique))
            .unwrap_or(false);
        if !still_valid || node.is_removed() {
            tracing::trace!(node = %node.addr(), key = %key, "stale result cache hit");
            return Ok(None);
        }
        let (lookup, position) = {
            let data = locked.data();
            self.layout.lookup_in_node(&data, &key, request.bias)
        };
        Ok(Some(SearchResult::at(locked, lookup, position)))
    }

    fn start_point(&self, stack: &LockStack, request: &SearchRequest<'_>) -> Result<Descent> {
        if let Some(object) = request.object {
            if let Some(vroot) = object.vroot() {
                match (self.node(vroot), self.delimiting_keys(vroot)) {
                    (Some(node), Some(dk))
                        if !node.is_removed()
                            && node.level() >= request.stop_level
                            && dk.covers(&object.min(), &object.max())
                            && dk.contains(&request.key) =>
                    {
                        return Ok(Descent {
                            parent: None,
                            addr: vroot,
                            level: node.level(),
                            pos_in_parent: 0,
                            hint: Some(dk),
                            from_vroot: true,
                        });
                    }
                    _ => object.clear_vroot(),
                }
            }
        }
        let uber = self.lock_uber(stack, LockRequest::read())?;
        let root = *self.root.lock();
        if request.stop_level > root.height {
            return Err(TreeError::InvalidArgument("stop level above the root"));
        }
        Ok(Descent {
            parent: Some(uber),
            addr: root.addr,
            level: root.height,
            pos_in_parent: 0,
            hint: Some(DelimitingKeys::FULL),
            from_vroot: false,
        })
    }

    /// One descent attempt. Every lock taken here is released on error.
    fn descend(&self, stack: &LockStack, request: &SearchRequest<'_>) -> Result<SearchResult> {
        let key = request.key;
        let mut at = self.start_point(stack, request)?;
        loop {
            #[cfg(test)]
            self.hooks.before_lock_node(at.addr);
            let parent_node = at.parent.as_ref().map(|p| Arc::clone(p.node()));
            let node = self.load_node(
                at.addr,
                at.level,
                parent_node
                    .as_ref()
                    .filter(|p| p.addr() != BlockAddr::UBER)
                    .map(|p| (p, at.pos_in_parent)),
            )?;
            let locked = self.lock_node(stack, &node, LockRequest::new(request.mode_at(at.level)))?;
            if stack.has_pending_yield() {
                return Err(TreeError::Deadlock);
            }
            let dk = self.resolve_dk(&node, at.hint)?;
            if let Some(parent) = at.parent.as_ref() {
                self.connect(stack, &locked, parent, at.pos_in_parent)?;
            }
            if node.is_removed() {
                return Err(TreeError::Invalid);
            }
            if !dk.contains(&key) {
                self.stats.inc_stale_nodes();
                tracing::debug!(node = %node.addr(), key = %key, range = %dk, "key moved out of node while waiting");
                if at.from_vroot {
                    if let Some(object) = request.object {
                        object.clear_vroot();
                    }
                }
                return Err(TreeError::Repeat);
            }
            if let Some(object) = request.object {
                if dk.covers(&object.min(), &object.max()) {
                    object.set_vroot(node.addr());
                }
            }
            drop(at.parent.take());

            if at.level == request.stop_level {
                return self.finish_at_stop_level(stack, request, locked, &dk);
            }
            let step = {
                let data = locked.data();
                let (_, position) = self.layout.lookup_in_node(&data, &key, Bias::MaxNotMoreThan);
                let pos = match position.between {
                    Between::EmptyNode => None,
                    _ => Some(position.pos),
                };
                pos.map(|pos| {
                    let child = self.layout.child_pointer(&data, pos);
                    let left = if pos == 0 { dk.left } else { data.items[pos].key.max(dk.left) };
                    let right = data.items.get(pos + 1).map(|item| item.key).unwrap_or(dk.right);
                    (pos, child, DelimitingKeys::new(left, right))
                })
            };
            match step {
                Some((pos, Some(child), hint)) => {
                    at = Descent {
                        parent: Some(locked),
                        addr: child,
                        level: at.level - 1,
                        pos_in_parent: pos,
                        hint: Some(hint),
                        from_vroot: false,
                    };
                }
                Some((_, None, _)) => {
                    // An extent above the stop level: this is as deep as the key goes.
                    let (lookup, position) = {
                        let data = locked.data();
                        self.layout.lookup_in_node(&data, &key, request.bias)
                    };
                    return Ok(SearchResult::at(locked, lookup, position));
                }
                None => {
                    tracing::error!(node = %node.addr(), "empty internal node on search path");
                    return Err(TreeError::Corruption("empty internal node"));
                }
            }
        }
    }

    /// Delimiting keys of a freshly locked node; adopts the parent's hint if none are known.
    fn resolve_dk(&self, node: &TreeNode, hint: Option<DelimitingKeys>) -> Result<DelimitingKeys> {
        if let Some(dk) = self.delimiting_keys(node.addr()) {
            return Ok(dk);
        }
        let Some(hint) = hint else {
            return Err(TreeError::Repeat);
        };
        let mut table = self.dk.write();
        Ok(*table.entry(node.addr()).or_insert(hint))
    }

    fn finish_at_stop_level(
        &self,
        stack: &LockStack,
        request: &SearchRequest<'_>,
        locked: LockedNode,
        dk: &DelimitingKeys,
    ) -> Result<SearchResult> {
        let (lookup, position) = {
            let data = locked.data();
            self.layout.lookup_in_node(&data, &request.key, request.bias)
        };
        let result = SearchResult::at(locked, lookup, position);
        let on_left_boundary = lookup == NodeLookup::Found
            && request.bias == Bias::Exact
            && !request.flags.unique
            && position.pos == 0
            && dk.left == request.key;
        if on_left_boundary {
            return self.leftmost_duplicate(stack, request, result);
        }
        Ok(result)
    }

    /// Moves a result sitting on the left delimiting key to the leftmost
    /// duplicate, scanning left neighbors with non-blocking locks.
    fn leftmost_duplicate(
        &self,
        stack: &LockStack,
        request: &SearchRequest<'_>,
        mut current: SearchResult,
    ) -> Result<SearchResult> {
        let key = request.key;
        loop {
            let mode = current.node.mode();
            let left = self.left_neighbor_for_scan(stack, &current.node, mode)?;
            let Some(left) = left else {
                return Ok(current);
            };
            if stack.has_pending_yield() {
                return Err(TreeError::Deadlock);
            }
            let (lookup, position) = {
                let data = left.data();
                self.layout.lookup_in_node(&data, &key, Bias::Exact)
            };
            if lookup != NodeLookup::Found {
                return Ok(current);
            }
            let candidate = SearchResult::at(left, lookup, position);
            drop(current);
            current = candidate;
            // A run of duplicates filling the whole neighbor may continue further left.
            if position.pos != 0 {
                return Ok(current);
            }
        }
    }

    fn left_neighbor_for_scan(
        &self,
        stack: &LockStack,
        node: &LockedNode,
        mode: LockMode,
    ) -> Result<Option<LockedNode>> {
        let flags = NeighborFlags::through_parent().non_blocking();
        for attempt in 0..LOCAL_RETRIES {
            match self.get_neighbor(stack, node, Side::Left, mode, flags) {
                Ok(left) => return Ok(Some(left)),
                Err(TreeError::NoNeighbor) => return Ok(None),
                Err(TreeError::Repeat) if attempt + 1 < LOCAL_RETRIES => thread::yield_now(),
                Err(err) => return Err(err),
            }
        }
        Err(TreeError::Repeat)
    }
}
