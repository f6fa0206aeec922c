//! The boundary where the rest of a system hands notifications over.
//!
//! Callers see only [`PortOutcome`]. The Telegram-backed port reports
//! [`PortOutcome::Ok`] for everything it has taken responsibility for, even
//! when delivery was throttled or failed; those results are visible through
//! its [`SendMetrics`] and logs instead.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::metrics::Meter;
use serde_json::Value;
use tower::BoxError;
use tower::Service;
use tracing::debug;
use tracing::info;

use notify_limit::ChatId;

use crate::config::DispatchConfig;
use crate::metrics::SendMetrics;
use crate::outcome::SendOutcome;
use crate::request::BotRequest;
use crate::request::BotResponse;
use crate::sender::NotifySender;

const METRIC_PREFIX: &str = "notify.adapter";

/// Result reported to the caller of a [`SendPort`].
///
/// A caller such as an outbox worker reschedules on `RetryableError` and
/// discards on `FatalError`. Both ports in this crate answer `Ok` only;
/// the error variants are there for other implementations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortOutcome {
    Ok,
    RetryableError(String),
    FatalError(String),
}

/// Something that accepts `(topic, payload)` notifications.
pub trait SendPort: Send + Sync {
    fn send<'a>(&'a self, topic: &'a str, payload: &'a Value) -> BoxFuture<'a, PortOutcome>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Accepts everything and sends nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummySendPort;

impl SendPort for DummySendPort {
    fn send<'a>(&'a self, topic: &'a str, _payload: &'a Value) -> BoxFuture<'a, PortOutcome> {
        debug!(topic, "dispatch disabled, dropping notification");
        futures::future::ready(PortOutcome::Ok).boxed()
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

/// Delivers `{ "chatId": .., "text": .., "dedup": .. }` payloads through a
/// [`NotifySender`].
///
/// `chatId` may be a JSON integer or a numeric string; `dedup` is optional.
#[derive(Debug)]
pub struct NotifySenderSendPort<T> {
    sender: Arc<NotifySender<T>>,
    metrics: Arc<SendMetrics>,
}

impl<T> NotifySenderSendPort<T>
where
    T: Service<BotRequest, Response = BotResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send,
{
    pub fn new(sender: Arc<NotifySender<T>>) -> Self {
        Self {
            sender,
            metrics: Arc::new(SendMetrics::local()),
        }
    }

    /// Export counters under `notify.adapter.*` through `meter`.
    pub fn with_meter(mut self, meter: &Meter) -> Self {
        self.metrics = Arc::new(SendMetrics::with_meter(meter, METRIC_PREFIX));
        self
    }

    pub fn metrics(&self) -> &SendMetrics {
        &self.metrics
    }

    async fn deliver(&self, topic: &str, payload: &Value) {
        self.metrics.record_attempt();

        let Some(chat_id) = payload.get("chatId").and_then(parse_chat_id) else {
            self.metrics.record_permanent();
            debug!(topic, "notification without a usable chatId dropped");
            return;
        };
        let Some(text) = payload.get("text").and_then(Value::as_str) else {
            self.metrics.record_permanent();
            debug!(topic, chat_id, "notification without text dropped");
            return;
        };
        let dedup_key = payload.get("dedup").and_then(Value::as_str);

        let send = self.sender.send_message(chat_id, text, None, dedup_key);
        match AssertUnwindSafe(send).catch_unwind().await {
            Ok(outcome) => {
                self.metrics.record_outcome(&outcome);
                if !matches!(outcome, SendOutcome::Ok { .. }) {
                    debug!(topic, chat_id, outcome = outcome.kind(), "notification not delivered");
                }
            }
            Err(_) => {
                self.metrics.record_retryable();
                debug!(topic, chat_id, "sender panicked");
            }
        }
    }
}

impl<T> SendPort for NotifySenderSendPort<T>
where
    T: Service<BotRequest, Response = BotResponse, Error = BoxError> + Clone + Send + Sync + 'static,
    T::Future: Send,
{
    fn send<'a>(&'a self, topic: &'a str, payload: &'a Value) -> BoxFuture<'a, PortOutcome> {
        async move {
            self.deliver(topic, payload).await;
            PortOutcome::Ok
        }
        .boxed()
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

fn parse_chat_id(value: &Value) -> Option<ChatId> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Picks the live port when dispatch is active, the dummy otherwise.
///
/// `build` receives the bot token and is only called for the live port.
pub fn select_port<F>(config: &DispatchConfig, build: F) -> Arc<dyn SendPort>
where
    F: FnOnce(&str) -> Arc<dyn SendPort>,
{
    let port = match config.bot_token.as_deref() {
        Some(token) if config.is_dispatch_active() => build(token),
        _ => Arc::new(DummySendPort) as Arc<dyn SendPort>,
    };
    info!(
        enabled = config.enabled,
        token_present = config.bot_token.is_some(),
        port = port.name(),
        "notification port selected"
    );
    port
}
