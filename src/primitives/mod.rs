//! Low-level primitives for building the tree engine.

/// Long-term node locks, lock stacks and the deadlock-avoidance protocol.
pub mod concurrency;
