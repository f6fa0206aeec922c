/// Failures reaching the messaging endpoint.
///
/// These never escape [`crate::NotifySender`]; the sender classifies every
/// one of them as a transient failure.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The HTTP request could not be completed (connect, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint replied with a body that is not a bot API envelope.
    #[error("Undecodable response (status {status}): {source}")]
    Decode {
        status: u16,
        #[source]
        source: serde_json::Error,
    },

    /// The bot token cannot be used to build an endpoint URL.
    #[error("Invalid bot token")]
    InvalidToken,
}

/// Configuration rejected by [`crate::NotifyConfig::validate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("max_backoff ({max:?}) is shorter than base_backoff ({base:?})")]
    BackoffRange {
        base: std::time::Duration,
        max: std::time::Duration,
    },

    /// A bucket has a capacity below one token or a refill rate that is
    /// negative or not a number.
    #[error("Invalid {bucket} bucket: capacity {capacity}, refill {refill_per_sec}/s")]
    Bucket {
        bucket: &'static str,
        capacity: f64,
        refill_per_sec: f64,
    },

    #[error("{0} ttl must be non-zero")]
    ZeroTtl(&'static str),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
