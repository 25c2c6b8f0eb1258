use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree traversal statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeStatsSnapshot {
    /// Searches started
    pub searches: u64,
    /// Searches answered from the result cache
    pub cache_hits: u64,
    /// Cache probes that fell back to a full descent
    pub cache_misses: u64,
    /// Descents restarted after a deadlock or stale node
    pub restarts: u64,
    /// Nodes whose delimiting keys no longer covered the searched key
    pub stale_nodes: u64,
    /// Lock requests refused to avoid a deadlock
    pub deadlock_yields: u64,
    /// Restarts that waited for a contended node instead of counting toward the restart limit
    pub contention_waits: u64,
    /// Nodes read from the block store
    pub node_loads: u64,
    /// Node splits performed by balancing
    pub splits: u64,
    /// Empty leaves removed by balancing
    pub removals: u64,
    /// Walks finished
    pub walks: u64,
}

/// Thread-safe statistics tracking for tree operations.
#[derive(Default)]
pub struct TreeStats {
    searches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    restarts: AtomicU64,
    stale_nodes: AtomicU64,
    deadlock_yields: AtomicU64,
    contention_waits: AtomicU64,
    node_loads: AtomicU64,
    splits: AtomicU64,
    removals: AtomicU64,
    walks: AtomicU64,
}

impl TreeStats {
    /// Returns the number of searches started.
    pub fn searches(&self) -> u64 {
        self.searches.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of searches answered from the result cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of cache probes that missed.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of restarted descents.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of restarts that waited out a contended node.
    pub fn contention_waits(&self) -> u64 {
        self.contention_waits.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_restarts(&self) {
        self.restarts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_stale_nodes(&self) {
        self.stale_nodes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_deadlock_yields(&self) {
        self.deadlock_yields.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_loads(&self) {
        self.node_loads.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_removals(&self) {
        self.removals.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_contention_waits(&self) {
        self.contention_waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_walks(&self) {
        self.walks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            searches: self.searches(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            restarts: self.restarts(),
            stale_nodes: self.stale_nodes.load(AtomicOrdering::Relaxed),
            deadlock_yields: self.deadlock_yields.load(AtomicOrdering::Relaxed),
            contention_waits: self.contention_waits.load(AtomicOrdering::Relaxed),
            node_loads: self.node_loads.load(AtomicOrdering::Relaxed),
            splits: self.splits.load(AtomicOrdering::Relaxed),
            removals: self.removals.load(AtomicOrdering::Relaxed),
            walks: self.walks.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "treelock::stats",
            searches = snapshot.searches,
            cache_hits = snapshot.cache_hits,
            cache_misses = snapshot.cache_misses,
            restarts = snapshot.restarts,
            stale_nodes = snapshot.stale_nodes,
            deadlock_yields = snapshot.deadlock_yields,
            contention_waits = snapshot.contention_waits,
            node_loads = snapshot.node_loads,
            splits = snapshot.splits,
            removals = snapshot.removals,
            walks = snapshot.walks,
            "tree stats snapshot"
        );
    }
}
