use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::types::{LockMode, LockPriority, Result, TreeError};

use super::lock::{HandleLink, LockRequest, NodeLock};

static NEXT_STACK_ID: AtomicU64 = AtomicU64::new(1);

/// Per-operation record of held long-term locks and the current priority.
///
/// A lock stack belongs to one logical operation running on one thread. All
/// locks taken on its behalf are linked to it so that priority changes and
/// yield requests can reach every node it holds.
pub struct LockStack {
    pub(super) shared: Arc<StackShared>,
}

pub(super) struct StackShared {
    id: u64,
    high: AtomicBool,
    nr_signaled: AtomicUsize,
    pub(super) state: Mutex<StackState>,
    woken: Mutex<bool>,
    wakeup: Condvar,
}

#[derive(Default)]
pub(super) struct StackState {
    pub(super) held: SmallVec<[Arc<HandleLink>; 8]>,
    pub(super) request: Option<PendingRequest>,
    /// Node of the last refused non-blocking request, with the refused mode.
    pub(super) contended: Option<(Arc<NodeLock>, LockMode)>,
}

/// Request the owning thread is blocked on.
pub(super) struct PendingRequest {
    pub(super) mode: LockMode,
    pub(super) high: bool,
    pub(super) outcome: Option<Result<Arc<HandleLink>>>,
}

impl LockStack {
    /// Creates an empty lock stack at low priority.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StackShared {
                id: NEXT_STACK_ID.fetch_add(1, Ordering::Relaxed),
                high: AtomicBool::new(false),
                nr_signaled: AtomicUsize::new(0),
                state: Mutex::new(StackState::default()),
                woken: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Identifier used in traces.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current priority.
    pub fn priority(&self) -> LockPriority {
        if self.shared.is_high() {
            LockPriority::High
        } else {
            LockPriority::Low
        }
    }

    /// Changes the priority of the stack and of every lock it holds.
    ///
    /// Raising the priority counts the stack as a high-priority owner of every
    /// held node and withdraws pending yield signals. Lowering it re-checks each
    /// held node and signals the handles on nodes that now meet the deadlock
    /// condition.
    pub fn set_priority(&self, priority: LockPriority) {
        let high = priority == LockPriority::High;
        if self.shared.is_high() == high {
            return;
        }
        // Publish the new priority before touching node counters: a concurrent
        // high-priority requester reads it under the node guard.
        self.shared.high.store(high, Ordering::SeqCst);
        let held: SmallVec<[Arc<HandleLink>; 8]> =
            self.shared.state.lock().held.iter().cloned().collect();
        for link in held {
            let mut state = link.lock.state.lock();
            if high {
                state.hipri_owners.inc();
                if link.signaled.swap(false, Ordering::AcqRel) {
                    self.shared.nr_signaled.fetch_sub(1, Ordering::AcqRel);
                }
            } else {
                state.hipri_owners.dec();
                if state.deadlock_condition() {
                    link.signal();
                }
            }
        }
        tracing::trace!(stack = self.shared.id, ?priority, "lock stack priority changed");
    }

    /// Returns true if some held lock was asked to yield.
    pub fn has_pending_yield(&self) -> bool {
        self.shared.nr_signaled.load(Ordering::Acquire) > 0
    }

    /// Re-checks yield signals right before the owner suspends.
    ///
    /// Returns [`TreeError::Deadlock`] if the owner must release its locks
    /// instead of waiting.
    pub fn prepare_to_sleep(&self) -> Result<()> {
        if self.has_pending_yield() {
            return Err(TreeError::Deadlock);
        }
        Ok(())
    }

    /// Waits until the node that last refused a non-blocking request of this
    /// stack can be locked, then releases it again.
    ///
    /// Only a stack holding no locks waits. Returns false when there was
    /// nothing to wait for or the stack still holds locks.
    pub fn wait_out_contention(&self) -> bool {
        let noted = self.shared.state.lock().contended.take();
        let Some((lock, mode)) = noted else {
            return false;
        };
        if !self.is_clean() {
            return false;
        }
        match lock.acquire(self, LockRequest::new(mode)) {
            Ok(handle) => handle.release(),
            Err(err) => {
                tracing::trace!(node = lock.id(), stack = self.shared.id, cause = %err, "contended node went away");
            }
        }
        true
    }

    /// Drops the note left by a refused non-blocking request.
    pub fn forget_contention(&self) {
        self.shared.state.lock().contended = None;
    }

    /// Number of locks currently held.
    pub fn held(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// Returns true if no locks are held.
    pub fn is_clean(&self) -> bool {
        self.held() == 0
    }

    /// Value of the yield-signal counter.
    pub fn signaled(&self) -> usize {
        self.shared.nr_signaled.load(Ordering::Acquire)
    }

    /// Number of held handles whose signaled flag is set.
    ///
    /// Equals [`LockStack::signaled`] whenever no lock operation is in flight.
    pub fn signaled_handles(&self) -> usize {
        self.shared
            .state
            .lock()
            .held
            .iter()
            .filter(|link| link.signaled.load(Ordering::Acquire))
            .count()
    }
}

impl Default for LockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockStack")
            .field("id", &self.shared.id)
            .field("priority", &self.priority())
            .field("held", &self.held())
            .field("signaled", &self.signaled())
            .finish()
    }
}

impl Drop for LockStack {
    fn drop(&mut self) {
        let held = self.held();
        if held > 0 {
            tracing::warn!(stack = self.shared.id, held, "lock stack dropped while holding locks");
        }
    }
}

impl StackShared {
    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn is_high(&self) -> bool {
        self.high.load(Ordering::SeqCst)
    }

    pub(super) fn add_signal(&self) {
        self.nr_signaled.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn drop_signal(&self) {
        self.nr_signaled.fetch_sub(1, Ordering::AcqRel);
    }

    pub(super) fn pending_request(&self) -> Option<(LockMode, bool)> {
        self.state
            .lock()
            .request
            .as_ref()
            .filter(|req| req.outcome.is_none())
            .map(|req| (req.mode, req.high))
    }

    pub(super) fn note_contention(&self, lock: Arc<NodeLock>, mode: LockMode) {
        self.state.lock().contended = Some((lock, mode));
    }

    pub(super) fn begin_request(&self, mode: LockMode, high: bool) {
        self.state.lock().request = Some(PendingRequest {
            mode,
            high,
            outcome: None,
        });
    }

    pub(super) fn abandon_request(&self) {
        self.state.lock().request = None;
    }

    /// Stores the outcome of the pending request and wakes the owner.
    pub(super) fn finish_request(&self, outcome: Result<Arc<HandleLink>>) {
        {
            let mut state = self.state.lock();
            if let Some(request) = state.request.as_mut() {
                request.outcome = Some(outcome);
            }
        }
        self.wake_up();
    }

    pub(super) fn take_outcome(&self) -> Option<Result<Arc<HandleLink>>> {
        let mut state = self.state.lock();
        let ready = state
            .request
            .as_ref()
            .map(|req| req.outcome.is_some())
            .unwrap_or(false);
        if !ready {
            return None;
        }
        state.request.take().and_then(|req| req.outcome)
    }

    pub(super) fn go_to_sleep(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.wakeup.wait(&mut woken);
        }
        *woken = false;
    }

    pub(super) fn wake_up(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.wakeup.notify_one();
    }
}
