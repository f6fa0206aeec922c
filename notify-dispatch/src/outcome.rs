use crate::request::BotResponse;

/// Terminal result of one logical send.
///
/// Exactly one variant is produced per call to
/// [`crate::NotifySender::execute`]; none of them is an error in the Rust
/// sense, the caller decides what to do with each.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered, or suppressed as a duplicate when `already` is set.
    Ok {
        message_id: Option<i64>,
        already: bool,
    },
    /// Throttled locally or by the endpoint; try again after the delay.
    RetryAfter { retry_after_ms: u64 },
    /// Transient failures persisted through every retry.
    RetryableError(String),
    /// The endpoint refused the request; retrying cannot help.
    PermanentError(String),
}

impl SendOutcome {
    pub fn delivered(message_id: Option<i64>) -> Self {
        SendOutcome::Ok {
            message_id,
            already: false,
        }
    }

    pub fn duplicate() -> Self {
        SendOutcome::Ok {
            message_id: None,
            already: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, SendOutcome::Ok { .. })
    }

    /// Metric label for the outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            SendOutcome::Ok { .. } => "ok",
            SendOutcome::RetryAfter { .. } => "retry_after",
            SendOutcome::RetryableError(_) => "retryable",
            SendOutcome::PermanentError(_) => "permanent",
        }
    }
}

/// What a single endpoint reply means, independent of the attempt count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Delivered { message_id: Option<i64> },
    /// Explicit rate limiting; `retry_after_secs` is set when the endpoint
    /// gave a positive wait.
    Throttled { retry_after_secs: Option<u64> },
    ServerError(String),
    ClientError(String),
}

const TOO_MANY_REQUESTS: u16 = 429;

pub(crate) fn classify(response: &BotResponse) -> Verdict {
    if response.ok {
        return Verdict::Delivered {
            message_id: response.message_id(),
        };
    }

    let retry_after_secs = response
        .retry_after_secs()
        .filter(|secs| *secs > 0)
        .map(|secs| secs as u64);
    let code = response.error_code;

    if code == Some(TOO_MANY_REQUESTS) || retry_after_secs.is_some() {
        return Verdict::Throttled { retry_after_secs };
    }

    let detail = format!(
        "code={} desc={}",
        code.map_or_else(|| "none".to_string(), |c| c.to_string()),
        response.description.as_deref().unwrap_or("unknown")
    );
    match code {
        Some(500..=599) => Verdict::ServerError(detail),
        _ => Verdict::ClientError(detail),
    }
}
