use std::sync::atomic::{AtomicU64, Ordering};

use crate::message::Ref;

/// Hands out correlation refs for one client.
///
/// Refs are decimal counters starting at 1 and are never reused, including
/// across reconnects.
#[derive(Debug)]
pub struct RefAllocator {
    counter: AtomicU64,
}

impl RefAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_ref(&self) -> Ref {
        Ref::new(self.counter.fetch_add(1, Ordering::Relaxed).to_string())
    }
}

impl Default for RefAllocator {
    fn default() -> Self {
        Self::new()
    }
}
