//! Ordering signal for envelopes.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Produces the `sequence` stamped on every envelope.
///
/// Values are microseconds since the Unix epoch, bumped by one whenever the
/// wall clock has not advanced (or went backwards) since the previous call, so
/// the output of one clock is strictly increasing. Consumers compare it against
/// `last_applied_sequence` and never look at payload content for ordering.
///
/// Zero is never produced; the consumer treats it as invalid.
#[derive(Debug, Default)]
pub struct SequenceClock {
    last: AtomicU64,
}

impl SequenceClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose next value is strictly greater than `last`.
    pub fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    pub fn next(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Move the clock past a sequence seen elsewhere (e.g. the log's high
    /// water for a key), so the next value is strictly greater than `seen`.
    pub fn observe(&self, seen: u64) {
        self.last.fetch_max(seen, Ordering::AcqRel);
    }
}
