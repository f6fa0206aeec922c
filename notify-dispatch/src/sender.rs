use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::Meter;
use tokio::time::Instant;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use notify_limit::ChatId;
use notify_limit::IdempotencyStore;
use notify_limit::InMemoryIdempotencyStore;
use notify_limit::MAX_COOLDOWN;
use notify_limit::RatePolicy;

use crate::backoff::Backoff;
use crate::config::NotifyConfig;
use crate::metrics::SendMetrics;
use crate::outcome::SendOutcome;
use crate::outcome::Verdict;
use crate::outcome::classify;
use crate::request::BotRequest;
use crate::request::BotResponse;
use crate::request::MediaSpec;

const METRIC_PREFIX: &str = "tg.send";

#[derive(Debug)]
enum SendState {
    Attempting { attempt: u32 },
    Backoff { attempt: u32, delay: Duration },
    Terminal(SendOutcome),
}

/// Deduplicating, rate-limited, retrying sender.
///
/// Every logical send passes through the same steps:
///
/// 1. A request carrying a dedup key that was already delivered returns
///    `Ok { already: true }` without touching the transport.
/// 2. The global and per-chat buckets are consulted before each attempt; a
///    denial returns [`SendOutcome::RetryAfter`] immediately.
/// 3. The reply is classified. Transport failures and 5xx replies are
///    retried with capped exponential backoff, explicit throttling feeds the
///    [`RatePolicy`] cool-down, anything else is permanent.
///
/// Sends are cancelled by dropping the returned future; a retry sleeping in
/// backoff stops with it.
#[derive(Debug)]
pub struct NotifySender<T> {
    transport: T,
    policy: Arc<RatePolicy>,
    idempotency: Arc<dyn IdempotencyStore>,
    metrics: Arc<SendMetrics>,
    backoff: Backoff,
    max_attempts: u32,
    retry_after_fallback: Duration,
}

impl<T> NotifySender<T>
where
    T: Service<BotRequest, Response = BotResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send,
{
    pub fn new(transport: T, config: &NotifyConfig) -> Self {
        let policy = RatePolicy::new(config.global_pair(), config.chat_pair(), config.chat.ttl)
            .with_cleanup_threshold(config.chat.cleanup_threshold)
            .with_sweep_interval(config.chat.sweep_interval);
        let idempotency = InMemoryIdempotencyStore::new(config.idempotency.ttl)
            .with_cleanup_threshold(config.idempotency.cleanup_threshold)
            .with_sweep_interval(config.idempotency.sweep_interval);

        Self {
            transport,
            policy: Arc::new(policy),
            idempotency: Arc::new(idempotency),
            metrics: Arc::new(SendMetrics::local()),
            backoff: Backoff::from(&config.backoff),
            max_attempts: config.backoff.max_attempts,
            retry_after_fallback: config.retry_after_fallback,
        }
    }

    /// Share a policy between senders, or supply one with a custom clock.
    pub fn with_rate_policy(mut self, policy: Arc<RatePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SendMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Export counters under `tg.send.*` through `meter`.
    pub fn with_meter(self, meter: &Meter) -> Self {
        self.with_metrics(Arc::new(SendMetrics::with_meter(meter, METRIC_PREFIX)))
    }

    pub fn metrics(&self) -> &SendMetrics {
        &self.metrics
    }

    pub fn rate_policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub async fn send_message(
        &self,
        chat_id: ChatId,
        text: impl Into<String>,
        thread_id: Option<i32>,
        dedup_key: Option<&str>,
    ) -> SendOutcome {
        self.execute(BotRequest::message(chat_id, text, thread_id), chat_id, dedup_key)
            .await
    }

    pub async fn send_photo(
        &self,
        chat_id: ChatId,
        photo: impl Into<String>,
        caption: Option<String>,
        thread_id: Option<i32>,
        dedup_key: Option<&str>,
    ) -> SendOutcome {
        let request = BotRequest::photo(chat_id, photo, caption, thread_id);
        self.execute(request, chat_id, dedup_key).await
    }

    /// Sends an album, degrading to one photo at a time when the album
    /// itself fails for any reason other than throttling.
    ///
    /// The fallback stops at the first photo that is not delivered and
    /// returns its outcome. Photos are sent without a dedup key; the
    /// album's key is marked once every photo went through.
    pub async fn send_media_group(
        &self,
        chat_id: ChatId,
        media: &[MediaSpec],
        thread_id: Option<i32>,
        dedup_key: Option<&str>,
    ) -> SendOutcome {
        if media.is_empty() {
            self.metrics.record_permanent();
            return SendOutcome::PermanentError("empty media group".to_string());
        }

        let request = BotRequest::media_group(chat_id, media, thread_id);
        let failure = match self.execute(request, chat_id, dedup_key).await {
            outcome @ (SendOutcome::Ok { .. } | SendOutcome::RetryAfter { .. }) => return outcome,
            failure => failure,
        };

        warn!(
            chat_id,
            items = media.len(),
            outcome = failure.kind(),
            "media group failed, sending photos individually"
        );
        for spec in media {
            let outcome = self
                .send_photo(
                    chat_id,
                    spec.file_id_or_url.as_str(),
                    spec.caption.clone(),
                    thread_id,
                    None,
                )
                .await;
            if !outcome.is_ok() {
                return outcome;
            }
        }

        if let Some(key) = dedup_key {
            self.idempotency.mark(key);
        }
        SendOutcome::delivered(None)
    }

    /// Runs one logical send to completion.
    ///
    /// `chat_id` selects the per-chat bucket and receives any remote
    /// cool-down.
    pub async fn execute(
        &self,
        request: BotRequest,
        chat_id: ChatId,
        dedup_key: Option<&str>,
    ) -> SendOutcome {
        if let Some(key) = dedup_key
            && self.idempotency.seen(key)
        {
            debug!(chat_id, dedup_key = key, "duplicate send suppressed");
            self.metrics.record_ok(true);
            return SendOutcome::duplicate();
        }

        let mut state = SendState::Attempting { attempt: 0 };
        loop {
            state = match state {
                SendState::Attempting { attempt } => {
                    self.attempt(&request, chat_id, dedup_key, attempt).await
                }
                SendState::Backoff { attempt, delay } => {
                    sleep(delay).await;
                    SendState::Attempting {
                        attempt: attempt + 1,
                    }
                }
                SendState::Terminal(outcome) => return outcome,
            };
        }
    }

    async fn attempt(
        &self,
        request: &BotRequest,
        chat_id: ChatId,
        dedup_key: Option<&str>,
        attempt: u32,
    ) -> SendState {
        if let Some(outcome) = self.gate(chat_id) {
            return SendState::Terminal(outcome);
        }

        self.metrics.record_attempt();
        let started = Instant::now();
        let result = self.transport.clone().oneshot(request.clone()).await;
        self.metrics.record_duration(started.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(err) => return self.transient(chat_id, attempt, format!("IO error: {err}")),
        };

        match classify(&response) {
            Verdict::Delivered { message_id } => {
                if let Some(key) = dedup_key {
                    self.idempotency.mark(key);
                }
                self.metrics.record_ok(false);
                info!(chat_id, method = request.method(), message_id, attempt, "sent");
                SendState::Terminal(SendOutcome::delivered(message_id))
            }
            Verdict::Throttled { retry_after_secs } => {
                let retry_after = retry_after_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.retry_after_fallback)
                    .min(MAX_COOLDOWN);
                let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
                self.policy.on_429(Some(chat_id), retry_after_ms);
                self.metrics.record_retry_after(retry_after_ms);
                warn!(chat_id, retry_after_ms, "throttled by endpoint");
                SendState::Terminal(SendOutcome::RetryAfter { retry_after_ms })
            }
            Verdict::ServerError(detail) => self.transient(chat_id, attempt, detail),
            Verdict::ClientError(detail) => {
                self.metrics.record_permanent();
                warn!(chat_id, method = request.method(), %detail, "rejected");
                SendState::Terminal(SendOutcome::PermanentError(detail))
            }
        }
    }

    fn gate(&self, chat_id: ChatId) -> Option<SendOutcome> {
        let decision = self.policy.acquire_global();
        let decision = if decision.granted {
            self.policy.acquire_chat(chat_id)
        } else {
            decision
        };
        if decision.granted {
            return None;
        }

        self.metrics.record_retry_after(decision.retry_after_ms);
        debug!(
            chat_id,
            retry_after_ms = decision.retry_after_ms,
            "rate limited locally"
        );
        Some(SendOutcome::RetryAfter {
            retry_after_ms: decision.retry_after_ms,
        })
    }

    fn transient(&self, chat_id: ChatId, attempt: u32, detail: String) -> SendState {
        if attempt >= self.max_attempts {
            self.metrics.record_retryable();
            warn!(chat_id, attempt, %detail, "giving up after transient failures");
            return SendState::Terminal(SendOutcome::RetryableError(detail));
        }

        let delay = self.backoff.delay(attempt, &mut rand::rng());
        self.metrics.record_retry();
        warn!(
            chat_id,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            %detail,
            "transient failure, backing off"
        );
        SendState::Backoff { attempt, delay }
    }
}
