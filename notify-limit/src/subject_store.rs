use std::borrow::Borrow;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quanta::Clock;
use quanta::Instant;

use crate::Reason;
use crate::Strategy;
use crate::SweepGuard;
use crate::TokenBucket;
use crate::sweep::DEFAULT_SWEEP_INTERVAL;

/// Per-subject token buckets with idle eviction.
///
/// A bucket is created the first time a subject is seen, using the store's
/// `(capacity, refill_per_sec)`. Subjects idle for longer than `ttl` are dropped by
/// a sweep that runs when an access leaves the map at or above
/// `cleanup_threshold` entries and the previous such sweep started at least
/// one sweep interval (60 s by default) earlier.
#[derive(Debug)]
pub struct SubjectBucketStore<K = String>
where
    K: Eq + Hash,
{
    capacity: f64,
    refill_per_sec: f64,
    ttl: Duration,
    cleanup_threshold: usize,
    clock: Clock,
    map: DashMap<K, SubjectEntry>,
    sweep: SweepGuard,
}

#[derive(Debug)]
struct SubjectEntry {
    bucket: Arc<TokenBucket>,
    last_access: Instant,
}

impl<K> SubjectBucketStore<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: f64, refill_per_sec: f64, ttl: Duration) -> Self {
        Self::with_clock(capacity, refill_per_sec, ttl, Clock::new())
    }

    pub fn with_clock(capacity: f64, refill_per_sec: f64, ttl: Duration, clock: Clock) -> Self {
        Self {
            capacity,
            refill_per_sec,
            ttl,
            cleanup_threshold: 10_000,
            clock,
            map: DashMap::new(),
            sweep: SweepGuard::with_interval(DEFAULT_SWEEP_INTERVAL),
        }
    }

    /// Set the map size at which accesses start triggering sweeps.
    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.cleanup_threshold = threshold;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep = SweepGuard::with_interval(interval);
        self
    }

    /// Attempts to take one token from `key`'s bucket.
    pub fn acquire<Q>(&self, key: &Q) -> ControlFlow<Reason>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let now = self.clock.now();
        let bucket = self.touch(key, now);
        self.maybe_sweep(now);
        bucket.process()
    }

    pub fn try_acquire<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire(key).is_continue()
    }

    /// Rejects every request for `key` until `until`, creating its bucket if
    /// the subject has not been seen yet.
    pub fn block_until<Q>(&self, key: &Q, until: Instant)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let now = self.clock.now();
        self.touch(key, now).block_until(until);
        self.maybe_sweep(now);
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Removes every subject idle for longer than `ttl`.
    ///
    /// Returns `None` if another sweep was already running.
    pub fn sweep_expired(&self) -> Option<usize> {
        let now = self.clock.now();
        self.sweep.try_sweep(|| {
            let before = self.map.len();
            self.map
                .retain(|_, entry| now.duration_since(entry.last_access) <= self.ttl);
            before.saturating_sub(self.map.len())
        })
    }

    fn touch<Q>(&self, key: &Q, now: Instant) -> Arc<TokenBucket>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        // The shard lock is released before the bucket lock is taken.
        if let Some(mut entry) = self.map.get_mut(key) {
            entry.last_access = now;
            return Arc::clone(&entry.bucket);
        }

        let mut entry = self.map.entry(key.to_owned()).or_insert_with(|| SubjectEntry {
            bucket: Arc::new(TokenBucket::with_clock(
                self.capacity,
                self.refill_per_sec,
                self.clock.clone(),
            )),
            last_access: now,
        });
        entry.last_access = now;
        Arc::clone(&entry.bucket)
    }

    fn maybe_sweep(&self, now: Instant) {
        if self.map.len() < self.cleanup_threshold {
            return;
        }
        self.sweep.try_sweep_due(now, || {
            self.map
                .retain(|_, entry| now.duration_since(entry.last_access) <= self.ttl);
        });
    }
}
