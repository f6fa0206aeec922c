use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Instant;

/// Minimum spacing of threshold-triggered sweeps in the stores.
pub(crate) const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A non-blocking flag that lets at most one caller run a cleanup sweep.
///
/// Callers that lose the race skip the sweep. A skipped sweep is always
/// safe: the next write past the threshold triggers it again, so stale
/// entries live at most one sweep interval longer than their TTL.
#[derive(Debug, Default)]
pub struct SweepGuard {
    running: AtomicBool,
    interval: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl SweepGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard whose [`SweepGuard::try_sweep_due`] runs at most once per
    /// `interval`.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs `sweep` unless one is in progress or the last due sweep started
    /// less than `interval` before `now`.
    ///
    /// Returns `None` when the sweep was skipped.
    pub fn try_sweep_due<R>(&self, now: Instant, sweep: impl FnOnce() -> R) -> Option<R> {
        self.try_sweep(|| {
            let mut last_run = self.last_run.lock();
            if last_run.is_some_and(|last| now.duration_since(last) < self.interval) {
                return None;
            }
            *last_run = Some(now);
            drop(last_run);
            Some(sweep())
        })
        .flatten()
    }

    /// Runs `sweep` if no other sweep is in progress.
    ///
    /// Returns `None` when the sweep was skipped.
    pub fn try_sweep<R>(&self, sweep: impl FnOnce() -> R) -> Option<R> {
        if self
            .running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        struct Release<'a>(&'a AtomicBool);
        impl Drop for Release<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }

        let _release = Release(&self.running);
        Some(sweep())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
