use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::Meter;

use crate::outcome::SendOutcome;

/// Point-in-time copy of the local counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub attempts: u64,
    pub ok: u64,
    /// Subset of `ok` that were duplicate suppressions.
    pub already: u64,
    pub retry_after: u64,
    pub retryable: u64,
    pub permanent: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
struct LocalCounters {
    attempts: AtomicU64,
    ok: AtomicU64,
    already: AtomicU64,
    retry_after: AtomicU64,
    retryable: AtomicU64,
    permanent: AtomicU64,
    retries: AtomicU64,
}

#[derive(Clone, Debug)]
struct Instruments {
    attempts: Counter<u64>,
    ok: Counter<u64>,
    retry_after: Counter<u64>,
    retryable: Counter<u64>,
    permanent: Counter<u64>,
    retries: Counter<u64>,
    duration: Histogram<f64>,
}

impl Instruments {
    fn new(meter: &Meter, prefix: &str) -> Self {
        Self {
            attempts: meter.u64_counter(format!("{prefix}.attempts")).build(),
            ok: meter.u64_counter(format!("{prefix}.ok")).build(),
            retry_after: meter.u64_counter(format!("{prefix}.retry_after")).build(),
            retryable: meter.u64_counter(format!("{prefix}.retryable")).build(),
            permanent: meter.u64_counter(format!("{prefix}.permanent")).build(),
            retries: meter.u64_counter(format!("{prefix}.retries")).build(),
            duration: meter
                .f64_histogram(format!("{prefix}.duration.ms"))
                .with_unit("ms")
                .build(),
        }
    }
}

/// Outcome counters for a sender or a port.
///
/// Local atomic counters are always kept; when built with a [`Meter`] every
/// event is also exported through OpenTelemetry.
#[derive(Debug, Default)]
pub struct SendMetrics {
    local: LocalCounters,
    instruments: Option<Instruments>,
}

impl SendMetrics {
    pub fn local() -> Self {
        Self::default()
    }

    /// Export under `{prefix}.ok`, `{prefix}.retry_after`, and so on.
    pub fn with_meter(meter: &Meter, prefix: &str) -> Self {
        Self {
            local: LocalCounters::default(),
            instruments: Some(Instruments::new(meter, prefix)),
        }
    }

    pub fn record_attempt(&self) {
        self.local.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = &self.instruments {
            i.attempts.add(1, &[]);
        }
    }

    pub fn record_ok(&self, already: bool) {
        self.local.ok.fetch_add(1, Ordering::Relaxed);
        if already {
            self.local.already.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(i) = &self.instruments {
            i.ok.add(1, &[KeyValue::new("already", already)]);
        }
    }

    pub fn record_retry_after(&self, retry_after_ms: u64) {
        self.local.retry_after.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = &self.instruments {
            let seconds = retry_after_ms.div_ceil(1_000);
            i.retry_after.add(
                1,
                &[KeyValue::new(
                    "retry_after_seconds",
                    i64::try_from(seconds).unwrap_or(i64::MAX),
                )],
            );
        }
    }

    pub fn record_retryable(&self) {
        self.local.retryable.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = &self.instruments {
            i.retryable.add(1, &[]);
        }
    }

    pub fn record_permanent(&self) {
        self.local.permanent.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = &self.instruments {
            i.permanent.add(1, &[]);
        }
    }

    /// An internal retry was scheduled; not a terminal outcome.
    pub fn record_retry(&self) {
        self.local.retries.fetch_add(1, Ordering::Relaxed);
        if let Some(i) = &self.instruments {
            i.retries.add(1, &[]);
        }
    }

    pub fn record_duration(&self, elapsed: Duration) {
        if let Some(i) = &self.instruments {
            i.duration.record(elapsed.as_secs_f64() * 1_000.0, &[]);
        }
    }

    /// Counts the terminal counter matching `outcome`.
    pub fn record_outcome(&self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Ok { already, .. } => self.record_ok(*already),
            SendOutcome::RetryAfter { retry_after_ms } => self.record_retry_after(*retry_after_ms),
            SendOutcome::RetryableError(_) => self.record_retryable(),
            SendOutcome::PermanentError(_) => self.record_permanent(),
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            attempts: self.local.attempts.load(Ordering::Relaxed),
            ok: self.local.ok.load(Ordering::Relaxed),
            already: self.local.already.load(Ordering::Relaxed),
            retry_after: self.local.retry_after.load(Ordering::Relaxed),
            retryable: self.local.retryable.load(Ordering::Relaxed),
            permanent: self.local.permanent.load(Ordering::Relaxed),
            retries: self.local.retries.load(Ordering::Relaxed),
        }
    }
}
