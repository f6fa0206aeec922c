//! # Notify Dispatch
//!
//! `notify-dispatch` delivers outbound notifications to the Telegram bot API
//! without flooding it, without sending the same thing twice and without
//! losing messages to transient failures.
//!
//! ## The Send Path
//! [`NotifySender`] wraps any [`tower::Service`] transport and runs each send
//! through the same pipeline:
//!
//! 1. **Deduplication**: a dedup key that was already delivered returns
//!    `Ok { already: true }` without touching the transport.
//! 2. **Admission**: a global and a per-chat token bucket
//!    ([`notify_limit::RatePolicy`]) must both grant; otherwise the caller
//!    gets [`SendOutcome::RetryAfter`] immediately.
//! 3. **Classification**: transport errors and 5xx replies are retried with
//!    capped exponential backoff, throttling replies cool down the rate
//!    policy, everything else is permanent.
//!
//! Albums that fail are re-sent one photo at a time.
//!
//! ## The Port
//! [`SendPort`] is the narrow interface the rest of a system depends on.
//! [`select_port`] chooses between [`NotifySenderSendPort`] and
//! [`DummySendPort`] based on [`DispatchConfig`].

mod backoff;
mod config;
mod error;
mod metrics;
mod outcome;
mod port;
mod request;
mod sender;
mod transport;

#[cfg(test)]
mod tests;

pub use backoff::Backoff;
pub use config::BackoffConfig;
pub use config::BucketConfig;
pub use config::ChatBucketConfig;
pub use config::DispatchConfig;
pub use config::IdempotencyConfig;
pub use config::NotifyConfig;
pub use config::TransportConfig;
pub use error::ConfigError;
pub use error::TransportError;
pub use metrics::CounterSnapshot;
pub use metrics::SendMetrics;
pub use outcome::SendOutcome;
pub use port::DummySendPort;
pub use port::NotifySenderSendPort;
pub use port::PortOutcome;
pub use port::SendPort;
pub use port::select_port;
pub use request::BotRequest;
pub use request::BotResponse;
pub use request::InputMediaPhoto;
pub use request::MediaSpec;
pub use request::ResponseParameters;
pub use request::SendMediaGroup;
pub use request::SendMessage;
pub use request::SendPhoto;
pub use sender::NotifySender;
pub use transport::TelegramTransport;
