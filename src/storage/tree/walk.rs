//! Parent-first tree walks.
//!
//! A walk runs along the twig level (or the leaf level of a one-level tree).
//! Each twig item is visited before the leaf it points to; leaves are visited
//! item by item and then the walk climbs back to the twig. Twig nodes are
//! crossed through sibling links, which are renewed through upper levels when
//! needed.
//!
//! A walk restarts on the same signals as a search. Progress is tracked as
//! "last key visited plus how many items with that key were visited" per
//! level, so a restarted walk resumes without visiting any item twice.

use std::cmp::Ordering;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::primitives::concurrency::{LockRequest, LockStack};
use crate::types::{BlockAddr, Key, Level, LockMode, Result, TreeError, LEAF_LEVEL, TWIG_LEVEL};

use super::connect::NeighborFlags;
use super::index::Side;
use super::layout::{Between, Bias, Position};
use super::node::{Item, ItemBody, LockedNode, TreeNode};
use super::search::SearchRequest;
use super::Tree;

/// Order in which a walk visits keys.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum WalkDirection {
    /// Ascending keys.
    #[default]
    Rightward,
    /// Descending keys.
    Leftward,
}

impl WalkDirection {
    fn side(self) -> Side {
        match self {
            WalkDirection::Rightward => Side::Right,
            WalkDirection::Leftward => Side::Left,
        }
    }

    /// Orders `a` against `b` in walk order.
    fn cmp(self, a: &Key, b: &Key) -> Ordering {
        match self {
            WalkDirection::Rightward => a.cmp(b),
            WalkDirection::Leftward => b.cmp(a),
        }
    }

    fn first(self, len: usize) -> Option<usize> {
        match self {
            WalkDirection::Rightward => (len > 0).then_some(0),
            WalkDirection::Leftward => len.checked_sub(1),
        }
    }

    fn next(self, pos: usize) -> Option<usize> {
        match self {
            WalkDirection::Rightward => Some(pos + 1),
            WalkDirection::Leftward => pos.checked_sub(1),
        }
    }

    fn from_position(self, position: Position) -> Option<usize> {
        match (self, position.between) {
            (_, Between::EmptyNode) => None,
            (WalkDirection::Rightward, Between::AfterUnit) => Some(position.pos + 1),
            (WalkDirection::Rightward, _) => Some(position.pos),
            (WalkDirection::Leftward, Between::BeforeUnit) => position.pos.checked_sub(1),
            (WalkDirection::Leftward, _) => Some(position.pos),
        }
    }
}

/// Visitor decision after each callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkControl {
    /// Keep walking.
    Continue,
    /// End the walk successfully.
    Stop,
}

/// Where a walk begins.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkStart {
    /// At the first key in walk order.
    Edge,
    /// At the first item not before this key in walk order.
    Key(Key),
}

/// One visited item.
#[derive(Debug)]
pub struct WalkItem<'a> {
    /// Node holding the item.
    pub addr: BlockAddr,
    /// Level of that node.
    pub level: Level,
    /// Position inside the node.
    pub pos: usize,
    /// The item itself.
    pub item: &'a Item,
}

/// Callbacks invoked by [`Tree::walk`].
pub trait TreeVisitor {
    /// Called when the walk enters a node, before its items.
    fn visit_node(&mut self, _node: &TreeNode) -> Result<WalkControl> {
        Ok(WalkControl::Continue)
    }

    /// Called for every item, twig items before the leaf they point to.
    fn visit_item(&mut self, item: &WalkItem<'_>) -> Result<WalkControl>;
}

impl<F> TreeVisitor for F
where
    F: FnMut(&WalkItem<'_>) -> Result<WalkControl>,
{
    fn visit_item(&mut self, item: &WalkItem<'_>) -> Result<WalkControl> {
        self(item)
    }
}

/// Counters of a finished walk.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WalkSummary {
    /// Node entries (a node re-entered after a restart counts again).
    pub nodes: u64,
    /// Items visited.
    pub items: u64,
    /// Restarts taken.
    pub restarts: u32,
    /// Restarts that first waited for a node held by another operation.
    pub contention_waits: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Mark {
    key: Key,
    seen: usize,
}

fn record(mark: &mut Option<Mark>, key: Key) {
    match mark {
        Some(m) if m.key == key => m.seen += 1,
        _ => *mark = Some(Mark { key, seen: 1 }),
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Visit {
    Done,
    InProgress,
    Fresh,
}

/// Classifies items of a pass against the progress recorded before it.
struct Resume {
    mark: Option<Mark>,
    equal: usize,
    caught_up: bool,
}

impl Resume {
    fn new(mark: Option<Mark>) -> Self {
        Self {
            mark,
            equal: 0,
            caught_up: mark.is_none(),
        }
    }

    fn classify(&mut self, key: &Key, direction: WalkDirection) -> Visit {
        if self.caught_up {
            return Visit::Fresh;
        }
        let Some(mark) = self.mark else {
            return Visit::Fresh;
        };
        match direction.cmp(key, &mark.key) {
            Ordering::Less => Visit::Done,
            Ordering::Equal => {
                self.equal += 1;
                match self.equal.cmp(&mark.seen) {
                    Ordering::Less => Visit::Done,
                    Ordering::Equal => Visit::InProgress,
                    Ordering::Greater => {
                        self.caught_up = true;
                        Visit::Fresh
                    }
                }
            }
            Ordering::Greater => {
                self.caught_up = true;
                Visit::Fresh
            }
        }
    }
}

struct Progress {
    level: Level,
    upper: Option<Mark>,
    /// Last leaf item visited by any pass.
    leaf: Option<Mark>,
    in_child: bool,
}

struct Pass<'w, 'v> {
    stack: &'w LockStack,
    direction: WalkDirection,
    visitor: &'w mut (dyn TreeVisitor + 'v),
    summary: &'w mut WalkSummary,
    /// Items before this key (in walk order) are not visited.
    floor: Option<Key>,
    /// Leaf items already handed to the visitor by earlier passes.
    leaf_resume: Resume,
}

impl Pass<'_, '_> {
    fn before_floor(&self, key: &Key) -> bool {
        self.floor
            .map(|floor| self.direction.cmp(key, &floor) == Ordering::Less)
            .unwrap_or(false)
    }
}

impl Tree {
    /// Walks the tree in the configured default direction.
    pub fn walk_default(
        &self,
        stack: &LockStack,
        start: WalkStart,
        visitor: &mut dyn TreeVisitor,
    ) -> Result<WalkSummary> {
        self.walk(stack, start, self.options.walk_direction, visitor)
    }

    /// Visits items from `start` in `direction` until the visitor stops or
    /// the edge of the tree is reached.
    ///
    /// Holds at most one twig and one leaf lock at a time, plus a neighbor
    /// while stepping. Callers should not hold other locks on `stack`; if they
    /// do, a deadlock signal is returned instead of restarting.
    pub fn walk(
        &self,
        stack: &LockStack,
        start: WalkStart,
        direction: WalkDirection,
        visitor: &mut dyn TreeVisitor,
    ) -> Result<WalkSummary> {
        let level = if self.height() >= TWIG_LEVEL { TWIG_LEVEL } else { LEAF_LEVEL };
        let mut progress = Progress {
            level,
            upper: None,
            leaf: None,
            in_child: false,
        };
        let mut summary = WalkSummary::default();
        loop {
            let mut pass = Pass {
                stack,
                direction,
                visitor: &mut *visitor,
                summary: &mut summary,
                floor: match start {
                    WalkStart::Key(key) => Some(key),
                    WalkStart::Edge => None,
                },
                leaf_resume: Resume::new(progress.leaf),
            };
            stack.forget_contention();
            let err = match self.walk_pass(&mut pass, start, &mut progress) {
                Ok(()) => {
                    self.stats.inc_walks();
                    tracing::debug!(
                        items = summary.items,
                        nodes = summary.nodes,
                        restarts = summary.restarts,
                        "walk finished"
                    );
                    return Ok(summary);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            if matches!(err, TreeError::Deadlock) && !stack.is_clean() {
                return Err(err);
            }
            self.stats.inc_restarts();
            if matches!(err, TreeError::Repeat) && stack.wait_out_contention() {
                summary.contention_waits += 1;
                self.stats.inc_contention_waits();
                continue;
            }
            summary.restarts += 1;
            if summary.restarts == self.options.restart_warn_threshold {
                tracing::warn!(restarts = summary.restarts, "walk keeps restarting");
            }
            if summary.restarts >= self.options.restart_limit {
                tracing::error!(restarts = summary.restarts, "walk restart limit reached");
                return Err(TreeError::Corruption("too many walk restarts"));
            }
            thread::yield_now();
        }
    }

    fn walk_pass(&self, pass: &mut Pass<'_, '_>, start: WalkStart, progress: &mut Progress) -> Result<()> {
        let direction = pass.direction;
        let key = match (progress.upper, start) {
            (Some(mark), _) => mark.key,
            (None, WalkStart::Key(key)) => key,
            (None, WalkStart::Edge) => match direction {
                WalkDirection::Rightward => Key::MIN,
                WalkDirection::Leftward => Key::MAX,
            },
        };
        // The child of the last item below the start key may hold duplicates
        // of it, so a rightward walk from a key begins at that item.
        let below_start = match (progress.upper, start) {
            (None, WalkStart::Key(key)) if direction == WalkDirection::Rightward && progress.level > LEAF_LEVEL => {
                key.prev()
            }
            _ => None,
        };
        let request = SearchRequest::new(below_start.unwrap_or(key), LockMode::Read)
            .stop_level(progress.level)
            .lock_level(progress.level);
        let request = match (direction, below_start) {
            (WalkDirection::Leftward, _) => request.bias(Bias::MaxNotMoreThan),
            (WalkDirection::Rightward, Some(_)) => request.bias(Bias::MaxNotMoreThan).unique(),
            (WalkDirection::Rightward, None) => request.bias(Bias::Exact),
        };
        let found = self.search_by_key(pass.stack, &request)?;
        let mut cursor = direction.from_position(found.coord.position);
        let mut node = found.node;
        let mut resume = Resume::new(progress.upper);
        let resume_in_child = progress.in_child;

        if self.enter_node(pass, &node)? {
            return Ok(());
        }
        loop {
            while let Some(pos) = cursor {
                let item = {
                    let data = node.data();
                    match data.items.get(pos) {
                        Some(item) => item.clone(),
                        None => break,
                    }
                };
                match resume.classify(&item.key, direction) {
                    Visit::Done => {}
                    Visit::InProgress => {
                        if resume_in_child {
                            if let ItemBody::Child(child) = item.body {
                                if self.walk_child(pass, &node, child, pos, progress)? {
                                    return Ok(());
                                }
                            }
                            progress.in_child = false;
                        }
                    }
                    Visit::Fresh if pass.before_floor(&item.key) => {
                        // Covering item of the start key: enter its child without visiting it.
                        record(&mut progress.upper, item.key);
                        if let (true, ItemBody::Child(child)) = (node.level() > LEAF_LEVEL, &item.body) {
                            progress.in_child = true;
                            if self.walk_child(pass, &node, *child, pos, progress)? {
                                return Ok(());
                            }
                            progress.in_child = false;
                        }
                    }
                    Visit::Fresh => {
                        let visit = WalkItem {
                            addr: node.addr(),
                            level: node.level(),
                            pos,
                            item: &item,
                        };
                        pass.summary.items += 1;
                        let control = pass.visitor.visit_item(&visit)?;
                        record(&mut progress.upper, item.key);
                        if control == WalkControl::Stop {
                            return Ok(());
                        }
                        if let (true, ItemBody::Child(child)) = (node.level() > LEAF_LEVEL, &item.body) {
                            progress.in_child = true;
                            if self.walk_child(pass, &node, *child, pos, progress)? {
                                return Ok(());
                            }
                            progress.in_child = false;
                        }
                    }
                }
                cursor = direction.next(pos);
            }

            let next = match self.get_neighbor(
                pass.stack,
                &node,
                direction.side(),
                LockMode::Read,
                NeighborFlags::through_parent(),
            ) {
                Ok(next) => next,
                Err(TreeError::NoNeighbor) => return Ok(()),
                Err(err) => return Err(err),
            };
            if pass.stack.has_pending_yield() {
                return Err(TreeError::Deadlock);
            }
            drop(node);
            node = next;
            cursor = direction.first(node.len());
            if self.enter_node(pass, &node)? {
                return Ok(());
            }
        }
    }

    /// Returns true if the visitor asked to stop.
    fn enter_node(&self, pass: &mut Pass<'_, '_>, node: &LockedNode) -> Result<bool> {
        pass.summary.nodes += 1;
        Ok(pass.visitor.visit_node(node.node())? == WalkControl::Stop)
    }

    /// Visits the leaf `child` hanging off `twig` at `pos`. Returns true if
    /// the visitor asked to stop.
    fn walk_child(
        &self,
        pass: &mut Pass<'_, '_>,
        twig: &LockedNode,
        child: BlockAddr,
        pos: usize,
        progress: &mut Progress,
    ) -> Result<bool> {
        let node = self.load_node(child, LEAF_LEVEL, Some((twig.node(), pos)))?;
        let leaf = self.lock_node(pass.stack, &node, LockRequest::read())?;
        if pass.stack.has_pending_yield() {
            return Err(TreeError::Deadlock);
        }
        if self.enter_node(pass, &leaf)? {
            return Ok(true);
        }
        let items = leaf.data().items.clone();
        let mut cursor = pass.direction.first(items.len());
        while let Some(at) = cursor.filter(|at| *at < items.len()) {
            let item = &items[at];
            // Leaf items come in key order across the whole walk, so one mark
            // filters out what a split moved behind the resume point.
            let fresh = pass.leaf_resume.classify(&item.key, pass.direction) == Visit::Fresh;
            if fresh && !pass.before_floor(&item.key) {
                pass.summary.items += 1;
                let visit = WalkItem {
                    addr: leaf.addr(),
                    level: LEAF_LEVEL,
                    pos: at,
                    item,
                };
                let control = pass.visitor.visit_item(&visit)?;
                record(&mut progress.leaf, item.key);
                if control == WalkControl::Stop {
                    return Ok(true);
                }
            }
            cursor = pass.direction.next(at);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_skips_visited_duplicates() {
        let key = Key::new(5, 0);
        let mut resume = Resume::new(Some(Mark { key, seen: 2 }));
        let dir = WalkDirection::Rightward;
        assert_eq!(resume.classify(&Key::new(4, 0), dir), Visit::Done);
        assert_eq!(resume.classify(&key, dir), Visit::Done);
        assert_eq!(resume.classify(&key, dir), Visit::InProgress);
        assert_eq!(resume.classify(&key, dir), Visit::Fresh);
        assert_eq!(resume.classify(&Key::new(4, 0), dir), Visit::Fresh);
    }

    #[test]
    fn leftward_resume_orders_keys_descending() {
        let mut resume = Resume::new(Some(Mark {
            key: Key::new(5, 0),
            seen: 1,
        }));
        let dir = WalkDirection::Leftward;
        assert_eq!(resume.classify(&Key::new(6, 0), dir), Visit::Done);
        assert_eq!(resume.classify(&Key::new(5, 0), dir), Visit::InProgress);
        assert_eq!(resume.classify(&Key::new(4, 0), dir), Visit::Fresh);
    }

    #[test]
    fn marks_count_equal_keys() {
        let mut mark = None;
        record(&mut mark, Key::new(1, 0));
        record(&mut mark, Key::new(1, 0));
        assert_eq!(mark, Some(Mark { key: Key::new(1, 0), seen: 2 }));
        record(&mut mark, Key::new(2, 0));
        assert_eq!(mark, Some(Mark { key: Key::new(2, 0), seen: 1 }));
    }

    #[test]
    fn cursor_from_search_position() {
        let r = WalkDirection::Rightward;
        let l = WalkDirection::Leftward;
        assert_eq!(r.from_position(Position::after(3)), Some(4));
        assert_eq!(r.from_position(Position::before(0)), Some(0));
        assert_eq!(l.from_position(Position::before(0)), None);
        assert_eq!(l.from_position(Position::at(2)), Some(2));
        assert_eq!(r.from_position(Position::empty()), None);
    }
}
