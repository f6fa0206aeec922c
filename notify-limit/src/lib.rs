//! # notify-limit
//!
//! `notify-limit` provides the in-memory admission primitives used when pushing
//! notifications to a rate-limited messaging endpoint.
//!
//! ## Core Philosophy
//!
//! Every bucket owns its own lock, so contention is scoped to a single
//! subject. The maps that hold per-subject buckets and idempotency marks are
//! sharded (`DashMap`), and the only globally serialized step, the cleanup
//! sweep, is guarded by a non-blocking flag that callers skip rather than
//! wait on.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: Tokens are refilled at the moment of the request,
//!   eliminating the need for background worker threads or timers.
//! * **Opportunistic Cleanup**: Idle subjects and expired idempotency marks
//!   are swept on writes once a map grows past its threshold, at most once
//!   per sweep interval.
//! * **Injectable Time**: All state reads a `quanta::Clock`, so tests can
//!   drive time with `Clock::mock()`.
//!
//! ## Example
//!
//! ```rust
//! use notify_limit::TokenBucket;
//! use notify_limit::Strategy;
//!
//! let bucket = TokenBucket::new(2.0, 1.0);
//!
//! if bucket.process().is_continue() {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod idempotency;
mod rate_policy;
mod subject_store;
mod sweep;
mod token_bucket;

pub use idempotency::IdempotencyStore;
pub use idempotency::InMemoryIdempotencyStore;
pub use rate_policy::ChatId;
pub use rate_policy::MAX_COOLDOWN;
pub use rate_policy::RatePolicy;
pub use subject_store::SubjectBucketStore;
pub use sweep::SweepGuard;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, PartialEq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The core trait for all rate-limiting algorithms.
///
/// Strategies are `Send` and `Sync` so they can be shared across threads
/// behind an `Arc`.
pub trait Strategy: Debug + Send + Sync {
    /// Attempts to process a single request.
    ///
    /// This method never blocks for longer than the strategy's own
    /// critical section.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit has been reached.
    fn process(&self) -> ControlFlow<Reason>;
}

/// Outcome of a single admission check.
///
/// A denied decision always carries a hint of how long the caller should
/// wait before trying again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub granted: bool,
    pub retry_after_ms: u64,
}

impl RateDecision {
    pub fn granted() -> Self {
        Self {
            granted: true,
            retry_after_ms: 0,
        }
    }

    pub fn denied(retry_after: Duration) -> Self {
        Self {
            granted: false,
            retry_after_ms: duration_to_millis(retry_after),
        }
    }
}

impl From<ControlFlow<Reason>> for RateDecision {
    fn from(flow: ControlFlow<Reason>) -> Self {
        match flow {
            ControlFlow::Continue(()) => RateDecision::granted(),
            ControlFlow::Break(Reason::Overloaded { retry_after }) => {
                RateDecision::denied(retry_after)
            }
        }
    }
}

/// Milliseconds in `d`, rounded up and saturated at `u64::MAX`.
pub(crate) fn duration_to_millis(d: Duration) -> u64 {
    let millis = d.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_from_control_flow() {
        assert_eq!(
            RateDecision::from(ControlFlow::Continue(())),
            RateDecision::granted()
        );

        let denied = RateDecision::from(ControlFlow::Break(Reason::Overloaded {
            retry_after: Duration::from_micros(1_500),
        }));
        assert!(!denied.granted);
        assert_eq!(denied.retry_after_ms, 2);
    }

    #[test]
    fn unbounded_wait_saturates() {
        assert_eq!(duration_to_millis(Duration::MAX), u64::MAX);
    }
}
