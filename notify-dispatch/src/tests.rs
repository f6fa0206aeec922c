use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::Ready;
use futures::future::ready;
use more_asserts::assert_ge;
use more_asserts::assert_le;
use notify_limit::IdempotencyStore;
use notify_limit::InMemoryIdempotencyStore;
use notify_limit::MAX_COOLDOWN;
use notify_limit::RatePolicy;
use quanta::Clock;
use serde_json::json;
use tokio::time::Instant;
use tokio::time::pause;
use tower::BoxError;
use tower::Service;
use tower::service_fn;

use super::*;

/// Replays scripted replies in order, then keeps succeeding.
#[derive(Clone, Default)]
struct ScriptedTransport {
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<BotRequest>>>,
    script: Arc<Mutex<VecDeque<Result<BotResponse, String>>>>,
}

impl ScriptedTransport {
    fn with_script(replies: impl IntoIterator<Item = Result<BotResponse, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(replies.into_iter().collect())),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn methods(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(BotRequest::method).collect()
    }
}

impl Service<BotRequest> for ScriptedTransport {
    type Response = BotResponse;
    type Error = BoxError;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: BotRequest) -> Self::Future {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(BotResponse::ok(json!({ "message_id": n as i64 + 100 }))));
        ready(reply.map_err(BoxError::from))
    }
}

fn config(max_attempts: u32) -> NotifyConfig {
    let mut config = NotifyConfig::default();
    config.backoff.base = Duration::from_millis(100);
    config.backoff.max = Duration::from_secs(10);
    config.backoff.jitter = Duration::ZERO;
    config.backoff.max_attempts = max_attempts;
    config.global = BucketConfig {
        capacity: 1_000.0,
        refill_per_sec: 1_000.0,
    };
    config.chat.capacity = 1_000.0;
    config.chat.refill_per_sec = 1_000.0;
    config
}

fn sender(transport: &ScriptedTransport, max_attempts: u32) -> NotifySender<ScriptedTransport> {
    NotifySender::new(transport.clone(), &config(max_attempts))
}

fn server_error() -> Result<BotResponse, String> {
    Ok(BotResponse::error(502, "Bad Gateway"))
}

mod sender_tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_key_reaches_transport_once() {
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3);

        let first = sender.send_message(1, "hi", None, Some("order-7")).await;
        let second = sender.send_message(1, "hi", None, Some("order-7")).await;

        assert_eq!(first, SendOutcome::delivered(Some(100)));
        assert_eq!(second, SendOutcome::duplicate());
        assert_eq!(transport.calls(), 1);

        let snapshot = sender.metrics().snapshot();
        assert_eq!(snapshot.ok, 2);
        assert_eq!(snapshot.already, 1);
        assert_eq!(snapshot.attempts, 1);
    }

    #[tokio::test]
    async fn sends_without_a_key_are_never_deduplicated() {
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3);

        assert!(sender.send_message(1, "a", None, None).await.is_ok());
        assert!(sender.send_message(1, "a", None, None).await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_backoff() {
        pause();

        let transport =
            ScriptedTransport::with_script([Err("connection reset".to_string()), server_error()]);
        let sender = sender(&transport, 2);

        let start = Instant::now();
        let outcome = sender.send_message(5, "retry me", None, Some("k")).await;

        assert_eq!(outcome, SendOutcome::delivered(Some(102)));
        assert_eq!(transport.calls(), 3);
        // 100ms then 200ms, no jitter; paused sleeps may land a tick late
        let elapsed = start.elapsed();
        assert_ge!(elapsed, Duration::from_millis(300));
        assert_le!(elapsed, Duration::from_millis(305));
        assert_eq!(sender.metrics().snapshot().retries, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_are_retryable() {
        pause();

        let transport = ScriptedTransport::with_script([server_error(), server_error(), server_error()]);
        let sender = sender(&transport, 2);

        let outcome = sender.send_message(5, "down", None, Some("k")).await;

        let SendOutcome::RetryableError(detail) = outcome else {
            panic!("expected retryable, got {outcome:?}");
        };
        assert_eq!(detail, "code=502 desc=Bad Gateway");
        assert_eq!(transport.calls(), 3);

        let snapshot = sender.metrics().snapshot();
        assert_eq!(snapshot.retryable, 1);
        assert_eq!(snapshot.retries, 2);

        // not marked, so a later send goes out again
        assert!(sender.send_message(5, "down", None, Some("k")).await.is_ok());
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn io_error_detail_is_prefixed() {
        pause();

        let transport = ScriptedTransport::with_script([Err("timed out".to_string())]);
        let sender = sender(&transport, 0);

        assert_eq!(
            sender.send_message(5, "x", None, None).await,
            SendOutcome::RetryableError("IO error: timed out".to_string())
        );
    }

    #[tokio::test]
    async fn client_errors_are_permanent_without_retry() {
        let transport =
            ScriptedTransport::with_script([Ok(BotResponse::error(403, "Forbidden: bot was blocked"))]);
        let sender = sender(&transport, 3);

        let outcome = sender.send_message(9, "hello", None, Some("k")).await;

        assert_eq!(
            outcome,
            SendOutcome::PermanentError("code=403 desc=Forbidden: bot was blocked".to_string())
        );
        assert_eq!(transport.calls(), 1);
        let snapshot = sender.metrics().snapshot();
        assert_eq!(snapshot.retries, 0);
        assert_eq!(snapshot.permanent, 1);
    }

    #[tokio::test]
    async fn throttling_reply_cools_down_the_chat() {
        let transport = ScriptedTransport::with_script([Ok(
            BotResponse::error(429, "Too Many Requests").with_retry_after(3)
        )]);
        let (clock, mock) = Clock::mock();
        let policy = Arc::new(RatePolicy::with_clock(
            (100.0, 100.0),
            (100.0, 100.0),
            Duration::from_secs(600),
            clock,
        ));
        let sender = sender(&transport, 3).with_rate_policy(policy);

        let outcome = sender.send_message(42, "flood", None, None).await;
        assert_eq!(
            outcome,
            SendOutcome::RetryAfter {
                retry_after_ms: 3_000
            }
        );
        assert_eq!(transport.calls(), 1);

        mock.increment(Duration::from_millis(1_000));
        let outcome = sender.send_message(42, "again", None, None).await;
        assert_eq!(
            outcome,
            SendOutcome::RetryAfter {
                retry_after_ms: 2_000
            }
        );
        assert_eq!(transport.calls(), 1);

        mock.increment(Duration::from_millis(2_000));
        assert!(sender.send_message(42, "later", None, None).await.is_ok());
        assert_eq!(sender.metrics().snapshot().retry_after, 2);
    }

    #[tokio::test]
    async fn huge_retry_after_is_capped() {
        let transport = ScriptedTransport::with_script([Ok(
            BotResponse::error(429, "Too Many Requests").with_retry_after(i64::MAX)
        )]);
        let (clock, _mock) = Clock::mock();
        let policy = Arc::new(RatePolicy::with_clock(
            (100.0, 100.0),
            (100.0, 100.0),
            Duration::from_secs(600),
            clock,
        ));
        let sender = sender(&transport, 3).with_rate_policy(policy);
        let cap_ms = MAX_COOLDOWN.as_millis() as u64;

        let outcome = sender.send_message(42, "flood", None, None).await;
        assert_eq!(outcome, SendOutcome::RetryAfter { retry_after_ms: cap_ms });

        let outcome = sender.send_message(42, "again", None, None).await;
        assert_eq!(outcome, SendOutcome::RetryAfter { retry_after_ms: cap_ms });
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn throttling_without_a_wait_uses_the_fallback() {
        let transport =
            ScriptedTransport::with_script([Ok(BotResponse::error(429, "Too Many Requests"))]);
        let mut config = config(3);
        config.retry_after_fallback = Duration::from_millis(1_500);
        let sender = NotifySender::new(transport.clone(), &config);

        assert_eq!(
            sender.send_message(1, "x", None, None).await,
            SendOutcome::RetryAfter {
                retry_after_ms: 1_500
            }
        );
    }

    #[tokio::test]
    async fn local_denial_skips_the_transport() {
        let transport = ScriptedTransport::default();
        let mut config = config(3);
        config.global = BucketConfig {
            capacity: 1.0,
            refill_per_sec: 0.0,
        };
        let sender = NotifySender::new(transport.clone(), &config);

        assert!(sender.send_message(1, "first", None, None).await.is_ok());
        let outcome = sender.send_message(2, "second", None, None).await;

        assert!(matches!(outcome, SendOutcome::RetryAfter { .. }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(sender.metrics().snapshot().retry_after, 1);
    }

    #[tokio::test]
    async fn chat_bucket_limits_one_chat_only() {
        let (clock, _mock) = Clock::mock();
        let policy = Arc::new(RatePolicy::with_clock(
            (100.0, 100.0),
            (2.0, 1.0),
            Duration::from_secs(600),
            clock,
        ));
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3).with_rate_policy(policy);

        assert!(sender.send_message(1, "a", None, None).await.is_ok());
        assert!(sender.send_message(1, "b", None, None).await.is_ok());
        assert_eq!(
            sender.send_message(1, "c", None, None).await,
            SendOutcome::RetryAfter {
                retry_after_ms: 1_000
            }
        );
        assert!(sender.send_message(2, "d", None, None).await.is_ok());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn dropping_the_future_cancels_backoff() {
        pause();

        let transport = ScriptedTransport::with_script([server_error(), server_error()]);
        let mut config = config(5);
        config.backoff.base = Duration::from_secs(10);
        config.backoff.max = Duration::from_secs(60);
        let sender = NotifySender::new(transport.clone(), &config);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            sender.send_message(3, "slow", None, Some("k")),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(transport.calls(), 1);
        assert_eq!(sender.metrics().snapshot().retries, 1);
    }

    #[tokio::test]
    async fn external_idempotency_store_is_honoured() {
        let store = Arc::new(InMemoryIdempotencyStore::new(Duration::from_secs(60)));
        store.mark("seeded");

        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3).with_idempotency(store.clone());

        assert_eq!(
            sender.send_message(1, "x", None, Some("seeded")).await,
            SendOutcome::duplicate()
        );
        assert!(sender.send_message(1, "y", None, Some("fresh")).await.is_ok());
        assert!(store.seen("fresh"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_to_many_chats() {
        let transport = ScriptedTransport::default();
        let sender = Arc::new(sender(&transport, 3));

        let mut tasks = tokio::task::JoinSet::new();
        for chat in 0..50_i64 {
            let sender = sender.clone();
            tasks.spawn(async move {
                let key = format!("chat-{chat}");
                sender.send_message(chat, "ping", None, Some(&key)).await
            });
        }

        let mut delivered = 0;
        while let Some(outcome) = tasks.join_next().await {
            if outcome.unwrap().is_ok() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 50);
        assert_eq!(transport.calls(), 50);
        assert_eq!(sender.rate_policy().tracked_chats(), 50);
    }

    #[tokio::test]
    async fn photo_carries_caption_and_thread() {
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3);

        let outcome = sender
            .send_photo(7, "file-1", Some("Table 7".to_string()), Some(11), None)
            .await;
        assert!(outcome.is_ok());

        let seen = transport.seen.lock().unwrap();
        let BotRequest::SendPhoto(photo) = &seen[0] else {
            panic!("expected a photo, got {:?}", seen[0]);
        };
        assert_eq!(photo.caption.as_deref(), Some("Table 7"));
        assert_eq!(photo.message_thread_id, Some(11));
    }
}

mod media_group_tests {
    use super::*;

    fn album() -> Vec<MediaSpec> {
        vec![
            MediaSpec::new("a").with_caption("first"),
            MediaSpec::new("b"),
            MediaSpec::new("c"),
        ]
    }

    #[tokio::test]
    async fn failed_album_falls_back_to_single_photos() {
        let transport = ScriptedTransport::with_script([Ok(BotResponse::error(400, "bad album"))]);
        let sender = sender(&transport, 3);

        let outcome = sender.send_media_group(1, &album(), None, Some("album-1")).await;

        assert_eq!(outcome, SendOutcome::delivered(None));
        assert_eq!(
            transport.methods(),
            ["sendMediaGroup", "sendPhoto", "sendPhoto", "sendPhoto"]
        );

        // the album key now suppresses a resend
        assert_eq!(
            sender.send_media_group(1, &album(), None, Some("album-1")).await,
            SendOutcome::duplicate()
        );
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn album_that_keeps_failing_falls_back_after_retries() {
        pause();

        let transport = ScriptedTransport::with_script([server_error(), server_error()]);
        let sender = sender(&transport, 1);

        let outcome = sender.send_media_group(1, &album(), None, Some("album-3")).await;

        assert_eq!(outcome, SendOutcome::delivered(None));
        assert_eq!(
            transport.methods(),
            ["sendMediaGroup", "sendMediaGroup", "sendPhoto", "sendPhoto", "sendPhoto"]
        );
        let counters = sender.metrics().snapshot();
        assert_eq!(counters.retryable, 1);
        assert_eq!(counters.retries, 1);
    }

    #[tokio::test]
    async fn delivered_album_does_not_fall_back() {
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3);

        let outcome = sender.send_media_group(1, &album(), Some(3), None).await;

        assert_eq!(outcome, SendOutcome::delivered(Some(100)));
        assert_eq!(transport.methods(), ["sendMediaGroup"]);
    }

    #[tokio::test]
    async fn throttled_album_does_not_fall_back() {
        let transport = ScriptedTransport::with_script([Ok(
            BotResponse::error(429, "Too Many Requests").with_retry_after(2)
        )]);
        let sender = sender(&transport, 3);

        let outcome = sender.send_media_group(1, &album(), None, None).await;

        assert_eq!(
            outcome,
            SendOutcome::RetryAfter {
                retry_after_ms: 2_000
            }
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn fallback_stops_at_first_failed_photo() {
        let transport = ScriptedTransport::with_script([
            Ok(BotResponse::error(400, "bad album")),
            Ok(BotResponse::ok(json!({ "message_id": 1 }))),
            Ok(BotResponse::error(400, "bad photo")),
        ]);
        let sender = sender(&transport, 3);

        let outcome = sender.send_media_group(1, &album(), None, Some("album-2")).await;

        assert_eq!(
            outcome,
            SendOutcome::PermanentError("code=400 desc=bad photo".to_string())
        );
        assert_eq!(transport.calls(), 3);
        // not marked after a partial failure
        assert!(sender.send_media_group(1, &album(), None, Some("album-2")).await.is_ok());
    }

    #[tokio::test]
    async fn empty_album_is_rejected() {
        let transport = ScriptedTransport::default();
        let sender = sender(&transport, 3);

        assert!(matches!(
            sender.send_media_group(1, &[], None, None).await,
            SendOutcome::PermanentError(_)
        ));
        assert_eq!(transport.calls(), 0);
    }
}

mod port_tests {
    use super::*;

    fn port(transport: &ScriptedTransport) -> NotifySenderSendPort<ScriptedTransport> {
        NotifySenderSendPort::new(Arc::new(sender(transport, 0)))
    }

    #[tokio::test]
    async fn payload_is_forwarded_to_the_sender() {
        let transport = ScriptedTransport::default();
        let port = port(&transport);
        let payload = json!({ "chatId": 12, "text": "deploy done", "dedup": "deploy-1" });

        assert_eq!(port.send("deploys", &payload).await, PortOutcome::Ok);
        assert_eq!(port.send("deploys", &payload).await, PortOutcome::Ok);

        assert_eq!(transport.calls(), 1);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0], BotRequest::message(12, "deploy done", None));

        let snapshot = port.metrics().snapshot();
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.ok, 2);
        assert_eq!(snapshot.already, 1);
    }

    #[tokio::test]
    async fn numeric_string_chat_id_is_accepted() {
        let transport = ScriptedTransport::default();
        let port = port(&transport);

        let payload = json!({ "chatId": " -100123 ", "text": "hi" });
        assert_eq!(port.send("t", &payload).await, PortOutcome::Ok);
        assert_eq!(transport.seen.lock().unwrap()[0].chat_id(), -100123);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_softly() {
        let transport = ScriptedTransport::default();
        let port = port(&transport);

        for payload in [
            json!({ "text": "no chat" }),
            json!({ "chatId": "abc", "text": "bad chat" }),
            json!({ "chatId": 1 }),
            json!({ "chatId": 1, "text": 5 }),
        ] {
            assert_eq!(port.send("t", &payload).await, PortOutcome::Ok);
        }

        assert_eq!(transport.calls(), 0);
        assert_eq!(port.metrics().snapshot().permanent, 4);
    }

    #[tokio::test]
    async fn failed_delivery_is_still_ok_to_the_caller() {
        let transport = ScriptedTransport::with_script([
            Ok(BotResponse::error(403, "blocked")),
            server_error(),
        ]);
        let port = port(&transport);

        let payload = json!({ "chatId": 1, "text": "x" });
        assert_eq!(port.send("t", &payload).await, PortOutcome::Ok);
        assert_eq!(port.send("t", &payload).await, PortOutcome::Ok);

        let snapshot = port.metrics().snapshot();
        assert_eq!(snapshot.permanent, 1);
        assert_eq!(snapshot.retryable, 1);
    }

    #[tokio::test]
    async fn panicking_transport_is_contained() {
        let transport = service_fn(|_req: BotRequest| async move {
            if true {
                panic!("transport exploded");
            }
            Ok::<_, BoxError>(BotResponse::default())
        });
        let sender = NotifySender::new(transport, &config(3));
        let port = NotifySenderSendPort::new(Arc::new(sender));

        let payload = json!({ "chatId": 1, "text": "x" });
        assert_eq!(port.send("t", &payload).await, PortOutcome::Ok);
        assert_eq!(port.metrics().snapshot().retryable, 1);
    }

    #[tokio::test]
    async fn dummy_port_accepts_everything() {
        let port = DummySendPort;
        assert_eq!(port.send("t", &json!(null)).await, PortOutcome::Ok);
        assert_eq!(port.name(), "dummy");
    }

    #[test]
    fn port_follows_dispatch_config() {
        let built = AtomicUsize::new(0);
        let factory = |token: &str| -> Arc<dyn SendPort> {
            assert_eq!(token, "123:abc");
            built.fetch_add(1, Ordering::SeqCst);
            let transport = ScriptedTransport::default();
            Arc::new(NotifySenderSendPort::new(Arc::new(sender(&transport, 0))))
        };

        let active = DispatchConfig {
            enabled: true,
            bot_token: Some("123:abc".to_string()),
        };
        assert_eq!(select_port(&active, factory).name(), "telegram");

        let disabled = DispatchConfig {
            enabled: false,
            bot_token: Some("123:abc".to_string()),
        };
        assert_eq!(select_port(&disabled, factory).name(), "dummy");

        let tokenless = DispatchConfig {
            enabled: true,
            bot_token: None,
        };
        assert_eq!(select_port(&tokenless, factory).name(), "dummy");

        assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn backoff_stays_within_bounds_with_jitter() {
    pause();

    let transport = ScriptedTransport::with_script([server_error()]);
    let mut config = config(1);
    config.backoff.jitter = Duration::from_millis(50);
    let sender = NotifySender::new(transport.clone(), &config);

    let start = Instant::now();
    assert!(sender.send_message(1, "x", None, None).await.is_ok());
    let elapsed = start.elapsed();
    assert_ge!(elapsed, Duration::from_millis(100));
    assert_le!(elapsed, Duration::from_millis(150));
}
