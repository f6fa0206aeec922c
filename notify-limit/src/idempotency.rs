use std::fmt::Debug;
use std::time::Duration;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;

use crate::SweepGuard;
use crate::sweep::DEFAULT_SWEEP_INTERVAL;

/// Remembers which logical messages were already delivered.
///
/// Duplicate suppression is best-effort: two concurrent callers may both
/// observe `seen == false` before either marks the key.
pub trait IdempotencyStore: Debug + Send + Sync {
    /// True if `key` was marked within the TTL. An expired mark is removed.
    fn seen(&self, key: &str) -> bool;

    /// Records `key` as delivered now, replacing any earlier mark.
    fn mark(&self, key: &str);
}

/// Process-local [`IdempotencyStore`]; state does not survive a restart.
#[derive(Debug)]
pub struct InMemoryIdempotencyStore {
    ttl: Duration,
    cleanup_threshold: usize,
    clock: Clock,
    marks: DashMap<String, Instant>,
    sweep: SweepGuard,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl InMemoryIdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Clock::new())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            ttl,
            cleanup_threshold: 10_000,
            clock,
            marks: DashMap::new(),
            sweep: SweepGuard::with_interval(DEFAULT_SWEEP_INTERVAL),
        }
    }

    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.cleanup_threshold = threshold;
        self
    }

    /// Minimum time between two threshold-triggered sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep = SweepGuard::with_interval(interval);
        self
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    fn expired(&self, marked_at: Instant, now: Instant) -> bool {
        now.duration_since(marked_at) > self.ttl
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn seen(&self, key: &str) -> bool {
        let now = self.clock.now();
        let Some(marked_at) = self.marks.get(key).map(|entry| *entry) else {
            return false;
        };
        if !self.expired(marked_at, now) {
            return true;
        }
        // A concurrent mark may have refreshed the entry since it was read.
        self.marks
            .remove_if(key, |_, marked_at| self.expired(*marked_at, now));
        false
    }

    fn mark(&self, key: &str) {
        let now = self.clock.now();
        self.marks.insert(key.to_owned(), now);

        if self.marks.len() < self.cleanup_threshold {
            return;
        }
        self.sweep.try_sweep_due(now, || {
            self.marks
                .retain(|_, marked_at| !self.expired(*marked_at, now));
        });
    }
}
