use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::types::{LockMode, LockPriority, Result, TreeError};

use super::counters::{PriorityCount, ReaderCount};
use super::stack::{LockStack, StackShared};

/// Parameters of a long-term lock request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LockRequest {
    /// Requested mode.
    pub mode: LockMode,
    /// Priority the requesting stack switches to.
    pub priority: LockPriority,
    /// Whether the caller may be suspended until the lock is granted.
    pub blocking: bool,
}

impl LockRequest {
    /// Blocking low-priority request in `mode`.
    pub const fn new(mode: LockMode) -> Self {
        Self {
            mode,
            priority: LockPriority::Low,
            blocking: true,
        }
    }

    /// Blocking low-priority read request.
    pub const fn read() -> Self {
        Self::new(LockMode::Read)
    }

    /// Blocking low-priority write request.
    pub const fn write() -> Self {
        Self::new(LockMode::Write)
    }

    /// Sets the request priority.
    pub const fn priority(mut self, priority: LockPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Marks the request as high priority.
    pub const fn high_priority(self) -> Self {
        self.priority(LockPriority::High)
    }

    /// Makes the request fail with [`TreeError::WouldBlock`] instead of waiting.
    pub const fn try_lock(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Long-term lock state embedded in every tree node.
pub struct NodeLock {
    id: u64,
    convoy: usize,
    pub(super) state: Mutex<LockState>,
}

pub(super) struct LockState {
    readers: ReaderCount,
    pub(super) hipri_owners: PriorityCount,
    hipri_requests: PriorityCount,
    owners: SmallVec<[Arc<HandleLink>; 4]>,
    requestors: VecDeque<Arc<StackShared>>,
    invalid: bool,
    write_epoch: u64,
}

/// Relation between one lock stack and one node lock it holds.
pub(super) struct HandleLink {
    pub(super) lock: Arc<NodeLock>,
    pub(super) owner: Arc<StackShared>,
    pub(super) mode: LockMode,
    pub(super) signaled: AtomicBool,
}

/// Snapshot of a node lock for observability and invariant checks.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Signed reader count (negative: write recursion depth).
    pub readers: i32,
    /// Owners currently at high priority.
    pub hipri_owners: u32,
    /// Queued requests at high priority.
    pub hipri_requests: u32,
    /// Number of handles linked to the lock.
    pub owners: usize,
    /// Number of queued requests.
    pub waiters: usize,
    /// Whether the node is being removed.
    pub invalid: bool,
    /// Number of fresh (non-recursive) write grants so far.
    pub write_epoch: u64,
}

enum Admission {
    Grant,
    Busy,
    Invalid,
}

impl NodeLock {
    /// Creates an unlocked node lock.
    ///
    /// `convoy` bounds how many queued readers one release admits together.
    pub fn new(id: u64, convoy: usize) -> Self {
        Self {
            id,
            convoy: convoy.max(1),
            state: Mutex::new(LockState {
                readers: ReaderCount::default(),
                hipri_owners: PriorityCount::default(),
                hipri_requests: PriorityCount::default(),
                owners: SmallVec::new(),
                requestors: VecDeque::new(),
                invalid: false,
                write_epoch: 0,
            }),
        }
    }

    /// Identifier of the lock (the node address).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquires the lock on behalf of `stack`.
    ///
    /// The stack first switches to the request priority. A request is refused
    /// when the mode conflicts with current owners, or when the requester is
    /// low priority and the node has a queued high-priority request but no
    /// high-priority owner. Refused blocking requests are queued (high priority
    /// ahead of low priority) and sleep until granted.
    ///
    /// Errors: [`TreeError::Invalid`] if the node is being removed,
    /// [`TreeError::Deadlock`] if one of the stack's locks was asked to yield
    /// while waiting, [`TreeError::WouldBlock`] for refused non-blocking requests.
    pub fn acquire(self: &Arc<Self>, stack: &LockStack, request: LockRequest) -> Result<LockHandle> {
        let owner = &stack.shared;
        stack.set_priority(request.priority);
        let high = request.priority == LockPriority::High;
        let mut state = self.state.lock();
        match state.admission(owner, request.mode) {
            Admission::Grant => {
                let link = state.lock_object(self, owner, request.mode);
                return Ok(LockHandle::new(link));
            }
            Admission::Invalid => return Err(TreeError::Invalid),
            Admission::Busy => {}
        }
        if !request.blocking {
            drop(state);
            owner.note_contention(Arc::clone(self), request.mode);
            return Err(TreeError::WouldBlock);
        }

        owner.begin_request(request.mode, high);
        state.enqueue(owner, high);
        tracing::trace!(
            node = self.id,
            stack = owner.id(),
            mode = ?request.mode,
            high,
            "long-term lock request queued"
        );
        loop {
            if high {
                state.wake_up_lopri_owners();
            }
            drop(state);
            let ready = stack.prepare_to_sleep();
            if ready.is_ok() {
                owner.go_to_sleep();
            }
            state = self.state.lock();
            if let Some(outcome) = owner.take_outcome() {
                return outcome.map(LockHandle::new);
            }
            if let Err(err) = ready {
                state.remove_request(owner, high);
                owner.abandon_request();
                state.dispatch(self);
                tracing::trace!(node = self.id, stack = owner.id(), "lock request yields");
                return Err(err);
            }
        }
    }

    /// Marks the node as being removed from the tree.
    ///
    /// Consumes the caller's write handle, fails every queued request with
    /// [`TreeError::Invalid`] and forces the reader count to zero. Later
    /// acquisitions fail with [`TreeError::Invalid`].
    pub fn invalidate(handle: LockHandle) -> Result<()> {
        if handle.mode() != LockMode::Write {
            return Err(TreeError::InvalidArgument(
                "node invalidation requires a write lock",
            ));
        }
        let mut handle = handle;
        let Some(link) = handle.link.take() else {
            return Err(TreeError::InvalidArgument("lock handle already released"));
        };
        let lock = Arc::clone(&link.lock);
        let mut state = lock.state.lock();
        state.invalid = true;
        state.unlink(&link);
        state.readers.reset();
        let waiters: Vec<Arc<StackShared>> = state.requestors.drain(..).collect();
        state.hipri_requests.reset();
        tracing::debug!(node = lock.id, waiters = waiters.len(), "node lock invalidated");
        for waiter in waiters {
            waiter.finish_request(Err(TreeError::Invalid));
        }
        Ok(())
    }

    /// Returns true once the node has been invalidated.
    pub fn is_invalid(&self) -> bool {
        self.state.lock().invalid
    }

    /// Returns true if any lock is held on the node.
    pub fn is_locked(&self) -> bool {
        !self.state.lock().readers.is_free()
    }

    /// Returns true if `stack` holds this lock in write mode.
    pub fn is_write_locked_by(&self, stack: &LockStack) -> bool {
        let state = self.state.lock();
        state.readers.is_write_locked() && state.write_owned_by(&stack.shared)
    }

    /// Returns a snapshot of the lock counters.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            readers: state.readers.get(),
            hipri_owners: state.hipri_owners.get(),
            hipri_requests: state.hipri_requests.get(),
            owners: state.owners.len(),
            waiters: state.requestors.len(),
            invalid: state.invalid,
            write_epoch: state.write_epoch,
        }
    }
}

impl fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeLock")
            .field("id", &self.id)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl LockState {
    /// High-priority requests are queued but no owner runs at high priority.
    pub(super) fn deadlock_condition(&self) -> bool {
        self.hipri_requests.get() > 0 && self.hipri_owners.get() == 0
    }

    fn write_owned_by(&self, owner: &Arc<StackShared>) -> bool {
        self.owners
            .first()
            .map(|link| Arc::ptr_eq(&link.owner, owner))
            .unwrap_or(false)
    }

    fn admission(&self, owner: &Arc<StackShared>, mode: LockMode) -> Admission {
        if self.invalid {
            return Admission::Invalid;
        }
        if self.readers.is_write_locked() {
            // Recursive locking by the write owner never queues.
            if self.write_owned_by(owner) {
                return Admission::Grant;
            }
            return Admission::Busy;
        }
        let compatible = match mode {
            LockMode::Read => true,
            LockMode::Write => self.readers.is_free(),
        };
        if !compatible {
            return Admission::Busy;
        }
        if !owner.is_high() && self.deadlock_condition() {
            return Admission::Busy;
        }
        Admission::Grant
    }

    fn lock_object(
        &mut self,
        lock: &Arc<NodeLock>,
        owner: &Arc<StackShared>,
        mode: LockMode,
    ) -> Arc<HandleLink> {
        let granted = if self.readers.is_write_locked() {
            LockMode::Write
        } else {
            mode
        };
        match granted {
            LockMode::Read => self.readers.add_reader(),
            LockMode::Write => {
                if self.readers.is_free() {
                    self.write_epoch += 1;
                }
                self.readers.add_writer();
            }
        }
        if owner.is_high() {
            self.hipri_owners.inc();
        }
        let link = Arc::new(HandleLink {
            lock: Arc::clone(lock),
            owner: Arc::clone(owner),
            mode: granted,
            signaled: AtomicBool::new(false),
        });
        self.owners.push(Arc::clone(&link));
        owner.state.lock().held.push(Arc::clone(&link));
        if !owner.is_high() && self.deadlock_condition() {
            link.signal();
        }
        tracing::trace!(node = lock.id, stack = owner.id(), mode = ?granted, "long-term lock granted");
        link
    }

    fn enqueue(&mut self, owner: &Arc<StackShared>, high: bool) {
        if high {
            // High-priority requests stay ahead of low-priority ones, FIFO among themselves.
            let at = (self.hipri_requests.get() as usize).min(self.requestors.len());
            self.requestors.insert(at, Arc::clone(owner));
            self.hipri_requests.inc();
        } else {
            self.requestors.push_back(Arc::clone(owner));
        }
    }

    fn remove_request(&mut self, owner: &Arc<StackShared>, high: bool) {
        let before = self.requestors.len();
        self.requestors.retain(|waiter| !Arc::ptr_eq(waiter, owner));
        if high && self.requestors.len() != before {
            self.hipri_requests.dec();
        }
    }

    fn wake_up_lopri_owners(&self) {
        if !self.deadlock_condition() {
            return;
        }
        for link in &self.owners {
            if !link.owner.is_high() {
                link.signal();
            }
        }
    }

    fn unlink(&mut self, link: &Arc<HandleLink>) {
        self.owners.retain(|held| !Arc::ptr_eq(held, link));
        if link.owner.is_high() {
            self.hipri_owners.dec();
        }
        if link.signaled.swap(false, Ordering::AcqRel) {
            link.owner.drop_signal();
        }
        link.owner
            .state
            .lock()
            .held
            .retain(|held| !Arc::ptr_eq(held, link));
    }

    /// Grants queued requests that became admissible.
    fn dispatch(&mut self, lock: &Arc<NodeLock>) {
        if self.invalid {
            return;
        }
        let mut readers = 0usize;
        let mut idx = 0usize;
        while idx < self.requestors.len() {
            if self.readers.is_write_locked() {
                break;
            }
            let requestor = Arc::clone(&self.requestors[idx]);
            let Some((mode, high)) = requestor.pending_request() else {
                self.requestors.remove(idx);
                continue;
            };
            match self.admission(&requestor, mode) {
                Admission::Grant => {
                    self.requestors.remove(idx);
                    if high {
                        self.hipri_requests.dec();
                    }
                    let link = self.lock_object(lock, &requestor, mode);
                    let granted = link.mode;
                    requestor.finish_request(Ok(link));
                    if granted == LockMode::Read {
                        readers += 1;
                        if readers >= lock.convoy {
                            break;
                        }
                    }
                }
                Admission::Busy => idx += 1,
                Admission::Invalid => {
                    self.requestors.remove(idx);
                    requestor.finish_request(Err(TreeError::Invalid));
                }
            }
        }
    }

    fn release(&mut self, lock: &Arc<NodeLock>, link: &Arc<HandleLink>) {
        if !self.invalid {
            match link.mode {
                LockMode::Read => self.readers.drop_reader(),
                LockMode::Write => self.readers.drop_writer(),
            }
        }
        self.unlink(link);
        self.dispatch(lock);
    }
}

impl HandleLink {
    /// Asks the owner to yield this lock. Counted once per handle.
    pub(super) fn signal(&self) {
        if !self.signaled.swap(true, Ordering::AcqRel) {
            self.owner.add_signal();
            self.owner.wake_up();
        }
    }
}

/// Long-term lock held by a lock stack on one node. Releases on drop.
///
/// Handles must be released by the thread running the owning operation.
pub struct LockHandle {
    link: Option<Arc<HandleLink>>,
}

impl LockHandle {
    fn new(link: Arc<HandleLink>) -> Self {
        Self { link: Some(link) }
    }

    /// Mode actually granted; recursive requests by a writer are writes.
    pub fn mode(&self) -> LockMode {
        self.link
            .as_ref()
            .map(|link| link.mode)
            .unwrap_or(LockMode::Read)
    }

    /// Returns true if the owner was asked to yield this lock.
    pub fn is_signaled(&self) -> bool {
        self.link
            .as_ref()
            .map(|link| link.signaled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Releases the lock now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(link) = self.link.take() {
            let lock = Arc::clone(&link.lock);
            let mut state = lock.state.lock();
            state.release(&lock, &link);
            tracing::trace!(node = lock.id, stack = link.owner.id(), "long-term lock released");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("node", &self.link.as_ref().map(|link| link.lock.id))
            .field("mode", &self.mode())
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
