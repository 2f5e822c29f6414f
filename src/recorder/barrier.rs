//! Completion barrier
//!
//! Counts down independent completions; exactly one arrival, the last,
//! observes the barrier opening.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct CompletionBarrier {
    remaining: AtomicUsize,
}

impl CompletionBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(parties),
        }
    }

    /// Record one completion
    ///
    /// Returns `true` for the arrival that brings the count to zero and
    /// `false` for every other one, including arrivals past zero.
    pub fn arrive(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.remaining() == 0
    }
}
