//! Dispatch configuration.
//!
//! Every field has a named default so a partial document (or none at all)
//! yields a working setup. Durations are given in milliseconds.

use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;

use crate::error::ConfigError;

fn deserialize_duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn default_base_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> Duration {
    Duration::from_millis(250)
}

fn default_max_shift() -> u32 {
    16
}

fn default_max_attempts() -> u32 {
    3
}

fn default_global_bucket() -> BucketConfig {
    BucketConfig {
        capacity: 25.0,
        refill_per_sec: 25.0,
    }
}

fn default_chat_capacity() -> f64 {
    3.0
}

fn default_chat_refill() -> f64 {
    1.5
}

fn default_chat_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_idempotency_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_cleanup_threshold() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_after_fallback() -> Duration {
    Duration::from_secs(1)
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(
        rename = "base_backoff_ms",
        default = "default_base_backoff",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub base: Duration,
    #[serde(
        rename = "max_backoff_ms",
        default = "default_max_backoff",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub max: Duration,
    #[serde(
        rename = "jitter_ms",
        default = "default_jitter",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub jitter: Duration,
    /// Largest exponent applied to `base`.
    #[serde(default = "default_max_shift")]
    pub max_shift: u32,
    /// Retries allowed after the first attempt for transient failures.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: default_base_backoff(),
            max: default_max_backoff(),
            jitter: default_jitter(),
            max_shift: default_max_shift(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketConfig {
    fn validate(&self, bucket: &'static str) -> Result<(), ConfigError> {
        if self.capacity.is_nan()
            || self.capacity < 1.0
            || self.refill_per_sec.is_nan()
            || self.refill_per_sec < 0.0
        {
            return Err(ConfigError::Bucket {
                bucket,
                capacity: self.capacity,
                refill_per_sec: self.refill_per_sec,
            });
        }
        Ok(())
    }

    fn as_pair(&self) -> (f64, f64) {
        (self.capacity, self.refill_per_sec)
    }
}

/// Per-chat buckets and their idle eviction.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ChatBucketConfig {
    #[serde(default = "default_chat_capacity")]
    pub capacity: f64,
    #[serde(default = "default_chat_refill")]
    pub refill_per_sec: f64,
    #[serde(
        rename = "ttl_ms",
        default = "default_chat_ttl",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub ttl: Duration,
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: usize,
    /// Minimum time between two threshold-triggered sweeps.
    #[serde(
        rename = "sweep_interval_ms",
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub sweep_interval: Duration,
}

impl Default for ChatBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_chat_capacity(),
            refill_per_sec: default_chat_refill(),
            ttl: default_chat_ttl(),
            cleanup_threshold: default_cleanup_threshold(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IdempotencyConfig {
    #[serde(
        rename = "ttl_ms",
        default = "default_idempotency_ttl",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub ttl: Duration,
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: usize,
    /// Minimum time between two threshold-triggered sweeps.
    #[serde(
        rename = "sweep_interval_ms",
        default = "default_sweep_interval",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub sweep_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: default_idempotency_ttl(),
            cleanup_threshold: default_cleanup_threshold(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

/// Settings for [`crate::TelegramTransport`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(
        rename = "request_timeout_ms",
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub request_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Everything [`crate::NotifySender`] needs to be built.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default = "default_global_bucket")]
    pub global: BucketConfig,
    #[serde(default)]
    pub chat: ChatBucketConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Cool-down used when the endpoint rate-limits without saying for how long.
    #[serde(
        rename = "retry_after_fallback_ms",
        default = "default_retry_after_fallback",
        deserialize_with = "deserialize_duration_from_ms"
    )]
    pub retry_after_fallback: Duration,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            global: default_global_bucket(),
            chat: ChatBucketConfig::default(),
            idempotency: IdempotencyConfig::default(),
            retry_after_fallback: default_retry_after_fallback(),
            transport: TransportConfig::default(),
        }
    }
}

impl NotifyConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: NotifyConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.backoff.max < self.backoff.base {
            return Err(ConfigError::BackoffRange {
                base: self.backoff.base,
                max: self.backoff.max,
            });
        }
        self.global.validate("global")?;
        BucketConfig {
            capacity: self.chat.capacity,
            refill_per_sec: self.chat.refill_per_sec,
        }
        .validate("chat")?;
        if self.chat.ttl.is_zero() {
            return Err(ConfigError::ZeroTtl("chat"));
        }
        if self.idempotency.ttl.is_zero() {
            return Err(ConfigError::ZeroTtl("idempotency"));
        }
        Ok(())
    }

    pub(crate) fn global_pair(&self) -> (f64, f64) {
        self.global.as_pair()
    }

    pub(crate) fn chat_pair(&self) -> (f64, f64) {
        (self.chat.capacity, self.chat.refill_per_sec)
    }
}

/// Whether notifications should actually be delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
}

impl DispatchConfig {
    /// Reads `NOTIFY_DISPATCH_ENABLED` and `TELEGRAM_BOT_TOKEN`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("NOTIFY_DISPATCH_ENABLED")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let bot_token = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty());
        Self { enabled, bot_token }
    }

    /// Enabled and holding a non-blank token.
    pub fn is_dispatch_active(&self) -> bool {
        self.enabled
            && self
                .bot_token
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
    }
}
