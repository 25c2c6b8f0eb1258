//! Per-tree test hooks for forcing interleavings.
//!
//! Each hook receives the address of the node the search is about to lock.
//! Hooks are cloned out of their slot before running, so a hook may block
//! while other threads pass the same point.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::BlockAddr;

pub(crate) type TestHook = Arc<dyn Fn(BlockAddr) + Send + Sync>;

#[derive(Default)]
pub(crate) struct SearchHooks {
    /// Fired after a result cache hit, before the cached node is locked.
    after_cache_probe: Mutex<Option<TestHook>>,
    /// Fired during a descent before each node is locked.
    before_lock_node: Mutex<Option<TestHook>>,
}

impl SearchHooks {
    pub(crate) fn set_after_cache_probe(&self, hook: TestHook) {
        *self.after_cache_probe.lock() = Some(hook);
    }

    pub(crate) fn set_before_lock_node(&self, hook: TestHook) {
        *self.before_lock_node.lock() = Some(hook);
    }

    pub(crate) fn clear(&self) {
        *self.after_cache_probe.lock() = None;
        *self.before_lock_node.lock() = None;
    }

    pub(crate) fn after_cache_probe(&self, addr: BlockAddr) {
        let hook = self.after_cache_probe.lock().clone();
        if let Some(hook) = hook {
            hook(addr);
        }
    }

    pub(crate) fn before_lock_node(&self, addr: BlockAddr) {
        let hook = self.before_lock_node.lock().clone();
        if let Some(hook) = hook {
            hook(addr);
        }
    }
}
