//! Long-term node locks with two-priority deadlock avoidance.
//!
//! Tree operations take long-term locks on many nodes without a global lock
//! order: lookups go top-down and left-to-right, balancing goes bottom-up.
//! Instead of ordering, every request carries a priority:
//!
//! * requests in the natural order run at [`LockPriority::Low`](crate::types::LockPriority),
//! * requests against it (child to parent) run at high priority.
//!
//! A node is in the *deadlock condition* when it has at least one queued
//! high-priority request and no high-priority owner. Low-priority requesters
//! are refused on such nodes, and low-priority owners of such nodes are
//! signaled. A signaled stack fails its next wait with
//! [`TreeError::Deadlock`](crate::types::TreeError) and must release its locks
//! and restart, which breaks every wait cycle.
//!
//! Short critical sections (counter updates, queue splicing) use
//! `parking_lot` mutexes that are never held across a wait. Lock order for
//! those mutexes is node state, then stack state, then the stack wake flag.

mod counters;
mod lock;
mod stack;

pub use counters::{PriorityCount, ReaderCount};
pub use lock::{LockHandle, LockRequest, LockSnapshot, NodeLock};
pub use stack::LockStack;
