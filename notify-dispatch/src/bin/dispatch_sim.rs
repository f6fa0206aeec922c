use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use hdrhistogram::Histogram;
use notify_dispatch::BotRequest;
use notify_dispatch::BotResponse;
use notify_dispatch::NotifyConfig;
use notify_dispatch::NotifySender;
use notify_dispatch::SendOutcome;
use rand::Rng;
use serde_json::json;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tower::BoxError;
use tower::service_fn;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive a NotifySender against a simulated, unreliable bot API.
#[derive(Debug, Parser)]
struct Args {
    /// Logical sends to issue.
    #[arg(long, default_value_t = 500)]
    requests: usize,

    /// Distinct chats the sends are spread over.
    #[arg(long, default_value_t = 20)]
    chats: i64,

    /// Distinct dedup keys; fewer keys than requests produces duplicates.
    #[arg(long, default_value_t = 400)]
    unique_keys: usize,

    /// Probability of a transport error or 5xx reply.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Probability of a 429 reply.
    #[arg(long, default_value_t = 0.02)]
    throttle_rate: f64,

    /// Simulated round-trip latency.
    #[arg(long, default_value_t = 5)]
    latency_ms: u64,

    /// JSON configuration file; defaults apply when omitted.
    #[arg(long, env = "NOTIFY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Tally {
    ok: usize,
    already: usize,
    retry_after: usize,
    retryable: usize,
    permanent: usize,
}

impl Tally {
    fn record(&mut self, outcome: &SendOutcome) {
        match outcome {
            SendOutcome::Ok { already: true, .. } => self.already += 1,
            SendOutcome::Ok { .. } => self.ok += 1,
            SendOutcome::RetryAfter { .. } => self.retry_after += 1,
            SendOutcome::RetryableError(_) => self.retryable += 1,
            SendOutcome::PermanentError(_) => self.permanent += 1,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Flakiness {
    failure_rate: f64,
    throttle_rate: f64,
    latency: Duration,
}

async fn simulated_bot_api(flakiness: Flakiness, req: BotRequest) -> Result<BotResponse, BoxError> {
    let roll: f64 = rand::rng().random();
    sleep(flakiness.latency).await;

    if roll < flakiness.throttle_rate {
        return Ok(BotResponse::error(429, "Too Many Requests").with_retry_after(1));
    }
    if roll < flakiness.throttle_rate + flakiness.failure_rate / 2.0 {
        return Err("connection reset by peer".into());
    }
    if roll < flakiness.throttle_rate + flakiness.failure_rate {
        return Ok(BotResponse::error(502, "Bad Gateway"));
    }
    Ok(BotResponse::ok(json!({ "message_id": req.chat_id().unsigned_abs() })))
}

fn load_config(path: Option<&PathBuf>) -> Result<NotifyConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(NotifyConfig::from_json(&std::fs::read_to_string(path)?)?),
        None => Ok(NotifyConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let flakiness = Flakiness {
        failure_rate: args.failure_rate,
        throttle_rate: args.throttle_rate,
        latency: Duration::from_millis(args.latency_ms),
    };

    let transport = service_fn(move |req: BotRequest| simulated_bot_api(flakiness, req));
    let sender = Arc::new(NotifySender::new(transport, &config));

    info!(?args, "starting simulation");

    let mut latencies = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)?;
    let mut tally = Tally::default();
    let mut tasks = JoinSet::new();
    let barrier = Arc::new(Barrier::new(args.requests));
    let chats = args.chats.max(1);
    let unique_keys = args.unique_keys.max(1);

    let start = Instant::now();
    for i in 0..args.requests {
        let sender = sender.clone();
        let barrier = barrier.clone();
        let chat_id = (i as i64) % chats;
        let key = format!("sim-{}", i % unique_keys);
        tasks.spawn(async move {
            barrier.wait().await;
            let sent = Instant::now();
            let outcome = sender
                .send_message(chat_id, format!("notification {i}"), None, Some(&key))
                .await;
            (outcome, sent.elapsed())
        });
    }

    while let Some(task) = tasks.join_next().await {
        let (outcome, elapsed) = task?;
        tally.record(&outcome);
        latencies.saturating_record(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
    }
    let total = start.elapsed();

    let counters = sender.metrics().snapshot();
    println!("--- dispatch simulation ({} sends in {total:?}) ---", args.requests);
    println!(
        "outcomes: ok={} duplicate={} retry_after={} retryable={} permanent={}",
        tally.ok, tally.already, tally.retry_after, tally.retryable, tally.permanent
    );
    println!(
        "transport: attempts={} retries={} tracked_chats={}",
        counters.attempts,
        counters.retries,
        sender.rate_policy().tracked_chats()
    );
    println!(
        "latency (us): p50={} p90={} p99={} max={}",
        latencies.value_at_quantile(0.5),
        latencies.value_at_quantile(0.9),
        latencies.value_at_quantile(0.99),
        latencies.max()
    );

    Ok(())
}
