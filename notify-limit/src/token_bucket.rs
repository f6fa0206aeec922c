use std::ops::ControlFlow;
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;

const TOKEN_COST: f64 = 1.0;
const MIN_CAPACITY: f64 = 1.0;

/// A continuously refilled token bucket.
///
/// Holds at most `capacity` tokens and gains `refill_per_sec` tokens per
/// second of elapsed time. The refill-then-debit sequence runs under a lock
/// owned by this bucket alone, so two buckets never contend with each other.
///
/// A bucket can also be put into a cool-down with [`TokenBucket::block_until`],
/// during which every request is rejected regardless of the tokens held.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    clock: Clock,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

impl Strategy for TokenBucket {
    fn process(&self) -> ControlFlow<Reason> {
        self.take(TOKEN_COST)
    }
}

impl TokenBucket {
    /// Creates a full bucket reading the system clock.
    ///
    /// `capacity` is clamped to at least one token and `refill_per_sec` to
    /// be non-negative. A zero refill rate gives a bucket that never
    /// recovers once drained.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::with_clock(capacity, refill_per_sec, Clock::new())
    }

    pub fn with_clock(capacity: f64, refill_per_sec: f64, clock: Clock) -> Self {
        let capacity = if capacity.is_nan() {
            MIN_CAPACITY
        } else {
            capacity.max(MIN_CAPACITY)
        };
        let refill_per_sec = if refill_per_sec.is_nan() {
            0.0
        } else {
            refill_per_sec.max(0.0)
        };
        let now = clock.now();

        Self {
            capacity,
            refill_per_sec,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
                blocked_until: None,
            }),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        self.process().is_continue()
    }

    /// Takes `cost` tokens if all of them are available.
    ///
    /// A cost above the capacity, or a negative one, can never be paid and
    /// is rejected with an unbounded wait.
    pub fn try_acquire_cost(&self, cost: f64) -> bool {
        self.take(cost).is_continue()
    }

    fn take(&self, cost: f64) -> ControlFlow<Reason> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(until) = state.blocked_until {
            if now < until {
                return ControlFlow::Break(Reason::Overloaded {
                    retry_after: until.duration_since(now),
                });
            }
            state.blocked_until = None;
        }

        if !(0.0..=self.capacity).contains(&cost) {
            return ControlFlow::Break(Reason::Overloaded {
                retry_after: Duration::MAX,
            });
        }

        self.refill(&mut state, now);

        if state.tokens >= cost {
            state.tokens -= cost;
            ControlFlow::Continue(())
        } else {
            let shortage = cost - state.tokens;
            ControlFlow::Break(Reason::Overloaded {
                retry_after: self.time_to_refill(shortage),
            })
        }
    }

    /// Rejects every request until `until`.
    ///
    /// An existing cool-down is only ever extended, never shortened.
    pub fn block_until(&self, until: Instant) {
        let mut state = self.state.lock();
        match state.blocked_until {
            Some(current) if current >= until => {}
            _ => state.blocked_until = Some(until),
        }
    }

    /// Time left on the current cool-down, if any.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until.duration_since(now))
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if now <= state.last_refill {
            return;
        }
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    fn time_to_refill(&self, shortage: f64) -> Duration {
        if self.refill_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(shortage / self.refill_per_sec).unwrap_or(Duration::MAX)
    }
}
