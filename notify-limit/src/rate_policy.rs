use std::time::Duration;

use quanta::Clock;

use crate::RateDecision;
use crate::Strategy;
use crate::SubjectBucketStore;
use crate::TokenBucket;

/// Recipient identifier used as the per-subject rate-limit key.
pub type ChatId = i64;

/// Longest cool-down [`RatePolicy::on_429`] records; longer requests are
/// clamped to it.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Global plus per-chat admission for outbound sends.
///
/// Each send consults the global bucket first and then the chat's own
/// bucket; the first denial wins. A remote "retry after" signal recorded
/// with [`RatePolicy::on_429`] takes precedence over both local estimates
/// until it elapses.
#[derive(Debug)]
pub struct RatePolicy {
    global: TokenBucket,
    chats: SubjectBucketStore<ChatId>,
    clock: Clock,
}

impl RatePolicy {
    pub fn new(global: (f64, f64), chat: (f64, f64), chat_ttl: Duration) -> Self {
        Self::with_clock(global, chat, chat_ttl, Clock::new())
    }

    /// Build with an explicit clock, shared by every bucket in the policy.
    pub fn with_clock(
        (global_capacity, global_refill): (f64, f64),
        (chat_capacity, chat_refill): (f64, f64),
        chat_ttl: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            global: TokenBucket::with_clock(global_capacity, global_refill, clock.clone()),
            chats: SubjectBucketStore::with_clock(chat_capacity, chat_refill, chat_ttl, clock.clone()),
            clock,
        }
    }

    pub fn with_cleanup_threshold(mut self, threshold: usize) -> Self {
        self.chats = self.chats.with_cleanup_threshold(threshold);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.chats = self.chats.with_sweep_interval(interval);
        self
    }

    pub fn acquire_global(&self) -> RateDecision {
        self.global.process().into()
    }

    pub fn acquire_chat(&self, chat_id: ChatId) -> RateDecision {
        self.chats.acquire(&chat_id).into()
    }

    /// Records a remote rate-limit signal.
    ///
    /// The global bucket is always cooled down; with a chat id the chat's
    /// bucket is cooled down as well. The cool-down is capped at
    /// [`MAX_COOLDOWN`].
    pub fn on_429(&self, chat_id: Option<ChatId>, retry_after_ms: u64) {
        let cooldown = Duration::from_millis(retry_after_ms).min(MAX_COOLDOWN);
        let now = self.clock.now();
        // Only fails for a clock within a year of the end of its range.
        let Some(until) = now.checked_add(cooldown) else {
            return;
        };
        self.global.block_until(until);
        if let Some(chat_id) = chat_id {
            self.chats.block_until(&chat_id, until);
        }
    }

    /// Number of chats currently holding a bucket.
    pub fn tracked_chats(&self) -> usize {
        self.chats.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(clock: Clock) -> RatePolicy {
        RatePolicy::with_clock((25.0, 25.0), (3.0, 1.5), Duration::from_secs(600), clock)
    }

    #[test]
    fn global_gate_denies_after_burst() {
        let (clock, mock) = Clock::mock();
        let rp = RatePolicy::with_clock((2.0, 1.0), (10.0, 10.0), Duration::from_secs(60), clock);

        assert!(rp.acquire_global().granted);
        assert!(rp.acquire_global().granted);
        assert_eq!(
            rp.acquire_global(),
            RateDecision {
                granted: false,
                retry_after_ms: 1_000
            }
        );

        mock.increment(Duration::from_secs(1));
        assert!(rp.acquire_global().granted);
    }

    #[test]
    fn chats_are_limited_independently() {
        let (clock, _mock) = Clock::mock();
        let rp = policy(clock);

        for _ in 0..3 {
            assert!(rp.acquire_chat(1).granted);
        }
        let denied = rp.acquire_chat(1);
        assert!(!denied.granted);
        // one token at 1.5/s
        assert_eq!(denied.retry_after_ms, 667);

        assert!(rp.acquire_chat(2).granted);
        assert_eq!(rp.tracked_chats(), 2);
    }

    #[test]
    fn remote_cooldown_overrides_free_tokens() {
        let (clock, mock) = Clock::mock();
        let rp = policy(clock);

        rp.on_429(Some(42), 5_000);
        mock.increment(Duration::from_millis(1_200));

        let decision = rp.acquire_chat(42);
        assert!(!decision.granted);
        assert_eq!(decision.retry_after_ms, 3_800);

        let decision = rp.acquire_global();
        assert!(!decision.granted);
        assert_eq!(decision.retry_after_ms, 3_800);

        mock.increment(Duration::from_millis(3_800));
        assert!(rp.acquire_global().granted);
        assert!(rp.acquire_chat(42).granted);
    }

    #[test]
    fn remote_cooldown_without_chat_only_blocks_global() {
        let (clock, _mock) = Clock::mock();
        let rp = policy(clock);

        rp.on_429(None, 2_000);

        assert!(!rp.acquire_global().granted);
        assert!(rp.acquire_chat(9).granted);
    }

    #[test]
    fn oversized_cooldown_is_capped() {
        let (clock, mock) = Clock::mock();
        let rp = policy(clock);
        let cap_ms = MAX_COOLDOWN.as_millis() as u64;

        rp.on_429(Some(1), u64::MAX);

        let decision = rp.acquire_chat(1);
        assert!(!decision.granted);
        assert_eq!(decision.retry_after_ms, cap_ms);
        assert_eq!(rp.acquire_global().retry_after_ms, cap_ms);

        mock.increment(MAX_COOLDOWN);
        assert!(rp.acquire_global().granted);
        assert!(rp.acquire_chat(1).granted);
    }
}
