//! Lock bookkeeping counters.
//!
//! The mutators are visible only inside the concurrency module so that every
//! update flows through the acquire, release and priority-change paths.

/// Per-node reader count.
///
/// Positive values count readers, negative values count the recursion depth
/// of the single write owner, zero means unlocked.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderCount(i32);

impl ReaderCount {
    /// Raw signed value.
    pub fn get(self) -> i32 {
        self.0
    }

    /// Returns true if nobody holds the lock.
    pub fn is_free(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the lock is held by one or more readers.
    pub fn is_read_locked(self) -> bool {
        self.0 > 0
    }

    /// Returns true if the lock is held by a writer.
    pub fn is_write_locked(self) -> bool {
        self.0 < 0
    }

    pub(super) fn add_reader(&mut self) {
        debug_assert!(self.0 >= 0, "reader admitted while write locked");
        self.0 += 1;
    }

    pub(super) fn drop_reader(&mut self) {
        debug_assert!(self.0 > 0, "reader released on a lock without readers");
        self.0 -= 1;
    }

    pub(super) fn add_writer(&mut self) {
        debug_assert!(self.0 <= 0, "writer admitted while read locked");
        self.0 -= 1;
    }

    pub(super) fn drop_writer(&mut self) {
        debug_assert!(self.0 < 0, "writer released on a lock without writer");
        self.0 += 1;
    }

    pub(super) fn reset(&mut self) {
        self.0 = 0;
    }
}

/// Non-negative counter for owners and requests at high priority.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityCount(u32);

impl PriorityCount {
    /// Current value.
    pub fn get(self) -> u32 {
        self.0
    }

    pub(super) fn inc(&mut self) {
        self.0 += 1;
    }

    pub(super) fn dec(&mut self) {
        debug_assert!(self.0 > 0, "priority counter underflow");
        self.0 = self.0.saturating_sub(1);
    }

    pub(super) fn reset(&mut self) {
        self.0 = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_count_encodes_write_recursion() {
        let mut count = ReaderCount::default();
        assert!(count.is_free());
        count.add_writer();
        count.add_writer();
        assert!(count.is_write_locked());
        assert_eq!(count.get(), -2);
        count.drop_writer();
        count.drop_writer();
        assert!(count.is_free());
        count.add_reader();
        assert!(count.is_read_locked());
        count.reset();
        assert!(count.is_free());
    }

    #[test]
    fn priority_count_tracks_inc_dec() {
        let mut count = PriorityCount::default();
        count.inc();
        count.inc();
        count.dec();
        assert_eq!(count.get(), 1);
        count.reset();
        assert_eq!(count.get(), 0);
    }
}
