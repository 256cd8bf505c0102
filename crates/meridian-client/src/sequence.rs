//! Producer sequence ids.
//!
//! Each partition connection of a producer owns one counter, so the ids a
//! partition sends form one gap-free run and every batch covers a contiguous
//! range. Every enqueued message gets the next id from its partition's
//! counter. The counter starts at the configured initial id and only moves
//! forward. A
//! message may carry an explicit id instead; that id is used as-is and does
//! not affect the counter, and the allocator does not detect duplicates or
//! gaps that such overrides create.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct SequenceAllocator {
    initial: u64,
    next: AtomicU64,
}

impl SequenceAllocator {
    pub fn new(initial: u64) -> Self {
        Self {
            initial,
            next: AtomicU64::new(initial),
        }
    }

    /// Hand out the next id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Use `explicit` when present, otherwise allocate.
    pub fn resolve(&self, explicit: Option<u64>) -> u64 {
        explicit.unwrap_or_else(|| self.next())
    }

    /// Last id handed out by the counter, if any.
    pub fn last_allocated(&self) -> Option<u64> {
        let next = self.next.load(Ordering::Acquire);
        (next > self.initial).then(|| next - 1)
    }
}
