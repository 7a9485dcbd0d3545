//! Integration tests for update processing: concurrency cap, ordering, timeouts,
//! unhandled hooks, batches and graceful stop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{callback_update, dispatcher, message_update, Events};
use maxbot_core::{HandlerError, MaxbotError};
use maxbot_dispatch::{BatchResult, Dispatcher, DispatcherConfig, FsmStrategy, OrderedBy};
use maxbot_router::{filters, Router};

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn config(max_in_flight: usize, ordered_by: OrderedBy) -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.processing.max_in_flight = max_in_flight;
    config.processing.ordered_by = ordered_by;
    config
}

async fn peak_concurrency(max_in_flight: usize) -> usize {
    let (dispatcher, _bot) = dispatcher(config(max_in_flight, OrderedBy::None));
    let gauge = Arc::new(Gauge::default());
    let g = gauge.clone();
    dispatcher.router().message(move |_ctx| {
        let gauge = g.clone();
        async move {
            gauge.enter();
            tokio::time::sleep(Duration::from_millis(20)).await;
            gauge.exit();
            Ok(())
        }
    });

    let updates = (1..=4)
        .map(|id| message_update(id, &format!("chat{}", id), "u", "hi"))
        .collect();
    let result = dispatcher.handle_updates(updates, true).await.unwrap();
    assert_eq!(result, BatchResult { handled: 4, total: 4 });
    gauge.peak()
}

/// **Test: `max_in_flight` caps concurrently running handlers.**
///
/// **Setup:** Handler sleeping 20ms while a gauge counts concurrent runs.
/// **Action:** Four updates from distinct chats dispatched concurrently.
/// **Expected:** Peak is 1 with a cap of 1, and 3 with a cap of 3.
#[tokio::test(start_paused = true)]
async fn test_max_in_flight_caps_concurrency() {
    assert_eq!(peak_concurrency(1).await, 1);
    assert_eq!(peak_concurrency(3).await, 3);
}

/// **Test: updates sharing an ordering key finish in arrival order.**
///
/// **Setup:** `ordered_by = chat`, cap 4; the handler sleeps for the number of
/// milliseconds in the text.
/// **Action:** chat a "30", chat a "0", chat b "5", dispatched concurrently.
/// **Expected:** b finishes first; chat a's second update waits for its first.
#[tokio::test(start_paused = true)]
async fn test_ordered_by_chat_serializes_per_chat() {
    let (dispatcher, _bot) = dispatcher(config(4, OrderedBy::Chat));
    let events = Events::default();
    let log = events.clone();
    dispatcher.router().message(move |ctx| {
        let log = log.clone();
        async move {
            let ms: u64 = ctx.message_text().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            log.push(format!("{}:{}", ctx.chat_id().unwrap_or("-"), ctx.message_text()));
            Ok(())
        }
    });

    let updates = vec![
        message_update(1, "a", "u1", "30"),
        message_update(2, "a", "u2", "0"),
        message_update(3, "b", "u3", "5"),
    ];
    dispatcher.handle_updates(updates, true).await.unwrap();

    assert_eq!(events.all(), vec!["b:5", "a:30", "a:0"]);
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_without_ordering_short_handlers_overtake() {
    let (dispatcher, _bot) = dispatcher(config(4, OrderedBy::None));
    let events = Events::default();
    let log = events.clone();
    dispatcher.router().message(move |ctx| {
        let log = log.clone();
        async move {
            let ms: u64 = ctx.message_text().parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            log.push(ctx.message_text().to_string());
            Ok(())
        }
    });

    let updates = vec![message_update(1, "a", "u", "30"), message_update(2, "a", "u", "0")];
    dispatcher.handle_updates(updates, true).await.unwrap();
    assert_eq!(events.all(), vec!["0", "30"]);
}

/// Handler logging "start"/"end" around a sleep of `<ms>` taken from the text
/// `<label>:<ms>`.
fn timed_handler(dispatcher: &Dispatcher, events: &Events) {
    let log = events.clone();
    dispatcher.router().message(move |ctx| {
        let log = log.clone();
        async move {
            let (label, ms): (String, u64) = ctx
                .message_text()
                .split_once(':')
                .map(|(label, ms)| (label.to_string(), ms.parse().unwrap_or(0)))
                .unwrap_or_default();
            log.push(format!("start {}", label));
            tokio::time::sleep(Duration::from_millis(ms)).await;
            log.push(format!("end {}", label));
            Ok(())
        }
    });
}

/// **Test: dropping a queued update keeps the rest of its chat in order.**
///
/// **Setup:** `ordered_by = chat`, cap 4; A sleeps 100ms, B and C follow in
/// the same chat.
/// **Action:** Run A and C on tasks; drop B's future while it is still queued.
/// **Expected:** C starts only after A ends.
#[tokio::test(start_paused = true)]
async fn test_dropped_queued_update_keeps_chat_order() {
    let (dispatcher, _bot) = dispatcher(config(4, OrderedBy::Chat));
    let events = Events::default();
    timed_handler(&dispatcher, &events);

    let a = dispatcher.handle_update(message_update(1, "c", "u", "A:100"));
    let b = dispatcher.handle_update(message_update(2, "c", "u", "B:0"));
    let c = dispatcher.handle_update(message_update(3, "c", "u", "C:0"));

    let a = tokio::spawn(a);
    tokio::task::yield_now().await;
    drop(b);
    let c = tokio::spawn(c);

    assert!(a.await.unwrap().unwrap());
    assert!(c.await.unwrap().unwrap());
    assert_eq!(events.all(), vec!["start A", "end A", "start C", "end C"]);
    assert_eq!(dispatcher.pending(), 0);
}

/// **Test: `ordered_by = user` serializes per user across chats.**
///
/// **Setup:** Cap 4; alice sends a slow update in chat1, then a fast one in
/// chat2; bob sends a fast one in chat1.
/// **Action:** Dispatch the batch concurrently.
/// **Expected:** bob is not held back; alice's second update waits for her first.
#[tokio::test(start_paused = true)]
async fn test_ordered_by_user_serializes_per_user() {
    let (dispatcher, _bot) = dispatcher(config(4, OrderedBy::User));
    let events = Events::default();
    timed_handler(&dispatcher, &events);

    let updates = vec![
        message_update(1, "chat1", "alice", "a1:30"),
        message_update(2, "chat2", "alice", "a2:0"),
        message_update(3, "chat1", "bob", "b1:5"),
    ];
    dispatcher.handle_updates(updates, true).await.unwrap();

    assert_eq!(
        events.all(),
        vec!["start a1", "start b1", "end b1", "end a1", "start a2", "end a2"]
    );
}

/// **Test: `ordered_by = fsm` follows the session key strategy.**
///
/// **Setup:** Cap 4, `user_in_chat` sessions; alice and bob share chat1.
/// **Action:** alice slow, alice fast, bob fast, all in chat1, concurrently.
/// **Expected:** bob runs alongside alice; alice's updates stay in order.
#[tokio::test(start_paused = true)]
async fn test_ordered_by_fsm_with_user_in_chat() {
    let mut cfg = config(4, OrderedBy::Fsm);
    cfg.fsm_strategy = FsmStrategy::UserInChat;
    let (dispatcher, _bot) = dispatcher(cfg);
    let events = Events::default();
    timed_handler(&dispatcher, &events);

    let updates = vec![
        message_update(1, "chat1", "alice", "a1:30"),
        message_update(2, "chat1", "alice", "a2:0"),
        message_update(3, "chat1", "bob", "b1:5"),
    ];
    dispatcher.handle_updates(updates, true).await.unwrap();

    assert_eq!(
        events.all(),
        vec!["start a1", "start b1", "end b1", "end a1", "start a2", "end a2"]
    );
}

/// **Test: a handler running past `handler_timeout_ms` fails the dispatch.**
///
/// **Setup:** Timeout 50ms; handler sleeps 1s.
/// **Action:** `handle_update`.
/// **Expected:** `DispatchTimeout { timeout_ms: 50 }`; the slot is released.
#[tokio::test(start_paused = true)]
async fn test_handler_timeout() {
    let mut cfg = config(1, OrderedBy::None);
    cfg.processing.handler_timeout_ms = Some(50);
    let (dispatcher, _bot) = dispatcher(cfg);
    dispatcher.router().message(|_ctx| async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok(())
    });

    let err = dispatcher
        .handle_update(message_update(1, "c", "u", "slow"))
        .await
        .unwrap_err();
    assert!(matches!(err, MaxbotError::DispatchTimeout { timeout_ms: 50 }));
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "dispatch timed out after 50ms");
    assert_eq!(dispatcher.in_flight(), 0);
    assert_eq!(dispatcher.pending(), 0);
}

#[tokio::test]
async fn test_handler_error_propagates() {
    let (dispatcher, _bot) = dispatcher(DispatcherConfig::default());
    dispatcher.router().message(|_ctx| async move {
        Err(HandlerError::Failed("boom".to_string()).into())
    });

    let err = dispatcher
        .handle_update(message_update(1, "c", "u", "x"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Handler error: Handler failed: boom");
    assert_eq!(dispatcher.pending(), 0);
}

/// **Test: unhandled hooks run in list order until one claims the update.**
///
/// **Setup:** `on_unhandled` "second" claims; `on_unhandled_first` "first" declines.
/// **Action:** A callback update no router handler matches.
/// **Expected:** `Ok(true)`; log is first, second.
#[tokio::test]
async fn test_unhandled_hooks_order() {
    let (dispatcher, _bot) = dispatcher(DispatcherConfig::default());
    dispatcher.router().message(|_ctx| async move { Ok(()) });

    let events = Events::default();
    let log = events.clone();
    dispatcher.on_unhandled(move |ctx| {
        let log = log.clone();
        async move {
            log.push(format!("second:{}", ctx.callback_data()));
            Ok(true)
        }
    });
    let log = events.clone();
    dispatcher.on_unhandled_first(move |_ctx| {
        let log = log.clone();
        async move {
            log.push("first");
            Ok(false)
        }
    });

    let handled = dispatcher
        .handle_update(callback_update(1, "c", "u", "menu"))
        .await
        .unwrap();
    assert!(handled);
    assert_eq!(events.all(), vec!["first", "second:menu"]);

    // Router-handled updates never reach the hooks.
    assert!(dispatcher
        .handle_update(message_update(2, "c", "u", "hi"))
        .await
        .unwrap());
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_unhandled_without_hooks_returns_false() {
    let (dispatcher, _bot) = dispatcher(DispatcherConfig::default());
    let handled = dispatcher
        .handle_update(message_update(1, "c", "u", "hi"))
        .await
        .unwrap();
    assert!(!handled);
}

#[tokio::test]
async fn test_handle_updates_sequential_counts() {
    let (dispatcher, bot) = dispatcher(DispatcherConfig::default());
    dispatcher
        .router()
        .message_with([filters::text_equals("ping")], |ctx| async move {
            ctx.reply("pong").await
        });

    let updates = vec![
        message_update(1, "c", "u", "ping"),
        message_update(2, "c", "u", "other"),
        message_update(3, "c", "u", "ping"),
    ];
    let result = dispatcher.handle_updates(updates, false).await.unwrap();
    assert_eq!(result, BatchResult { handled: 2, total: 3 });
    assert_eq!(bot.sent_texts(), vec!["pong", "pong"]);
}

/// **Test: a failing update does not cancel the rest of a concurrent batch.**
///
/// **Setup:** Cap 4; "slow" handlers sleep 50ms, "bad" fails at once.
/// **Action:** Batch of slow (chat a), bad (chat b), slow (chat c), concurrently.
/// **Expected:** The batch returns the handler error, and both slow handlers
/// have already finished by then.
#[tokio::test(start_paused = true)]
async fn test_handle_updates_concurrent_error_lets_siblings_finish() {
    let (dispatcher, _bot) = dispatcher(config(4, OrderedBy::None));
    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    dispatcher.router().message(move |ctx| {
        let counter = counter.clone();
        async move {
            if ctx.message_text() == "bad" {
                return Err(HandlerError::Failed("bad input".to_string()).into());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let updates = vec![
        message_update(1, "a", "u", "slow"),
        message_update(2, "b", "u", "bad"),
        message_update(3, "c", "u", "slow"),
    ];
    let err = dispatcher.handle_updates(updates, true).await.unwrap_err();

    assert_eq!(err.to_string(), "Handler error: Handler failed: bad input");
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.pending(), 0);
}

/// **Test: graceful stop drains admitted work and rejects new updates.**
///
/// **Setup:** Handler sleeping 100ms; one update admitted on a spawned task.
/// **Action:** `graceful_stop(None)`, then another update.
/// **Expected:** The first handler completes before the stop returns; the
/// second update resolves to `false` without running.
#[tokio::test(start_paused = true)]
async fn test_graceful_stop_drains_and_rejects() {
    let (dispatcher, _bot) = dispatcher(DispatcherConfig::default());
    let events = Events::default();
    let log = events.clone();
    dispatcher.router().message(move |ctx| {
        let log = log.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            log.push(ctx.message_text().to_string());
            Ok(())
        }
    });

    let running = tokio::spawn(dispatcher.handle_update(message_update(1, "c", "u", "first")));
    assert_eq!(dispatcher.pending(), 1);

    assert!(dispatcher.graceful_stop(None).await);
    assert_eq!(events.all(), vec!["first"]);
    assert!(running.await.unwrap().unwrap());
    assert!(dispatcher.is_stopping());

    let handled = dispatcher
        .handle_update(message_update(2, "c", "u", "late"))
        .await
        .unwrap();
    assert!(!handled);
    assert_eq!(events.all(), vec!["first"]);
}

#[tokio::test(start_paused = true)]
async fn test_graceful_stop_times_out() {
    let (dispatcher, _bot) = dispatcher(DispatcherConfig::default());
    dispatcher.router().message(|_ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
    });

    let _running = tokio::spawn(dispatcher.handle_update(message_update(1, "c", "u", "slow")));
    let drained = dispatcher
        .graceful_stop(Some(Duration::from_millis(50)))
        .await;
    assert!(!drained);
    assert_eq!(dispatcher.in_flight(), 1);
}

#[test]
fn test_session_key_strategies() {
    let update = message_update(1, "chat1", "user1", "hi");
    let anonymous = message_update(2, "chat1", "", "hi");
    let cases = [
        (FsmStrategy::Chat, Some("chat1"), Some("chat1")),
        (FsmStrategy::User, Some("user1"), None),
        (FsmStrategy::UserInChat, Some("chat1:user1"), Some("chat1")),
        (FsmStrategy::Global, Some("global"), Some("global")),
    ];
    for (strategy, expected, expected_anonymous) in cases {
        let mut cfg = DispatcherConfig::default();
        cfg.fsm_strategy = strategy;
        let (dispatcher, _bot) = dispatcher(cfg);
        assert_eq!(dispatcher.session_key(&update).as_deref(), expected, "{}", strategy);
        assert_eq!(
            dispatcher.session_key(&anonymous).as_deref(),
            expected_anonymous,
            "{}",
            strategy
        );
    }
}

/// **Test: `user_in_chat` keeps separate sessions for users sharing a chat.**
///
/// **Setup:** Handler storing `set:<x>` as state and replying the state otherwise.
/// **Action:** alice sets "a" in chat1; bob in chat1, alice in chat2, then
/// alice in chat1 ask.
/// **Expected:** Only alice in chat1 sees "a"; the store key is "chat1:alice".
#[tokio::test]
async fn test_user_in_chat_sessions_are_isolated() {
    let mut cfg = DispatcherConfig::default();
    cfg.fsm_strategy = FsmStrategy::UserInChat;
    let (dispatcher, bot) = dispatcher(cfg);
    dispatcher.router().message(|ctx| async move {
        match ctx.message_text().strip_prefix("set:") {
            Some(state) => ctx.set_state(state).await,
            None => {
                let state = ctx.get_state().await?;
                ctx.reply(state.unwrap_or_else(|| "none".to_string())).await
            }
        }
    });

    for update in [
        message_update(1, "chat1", "alice", "set:a"),
        message_update(2, "chat1", "bob", "get"),
        message_update(3, "chat2", "alice", "get"),
        message_update(4, "chat1", "alice", "get"),
    ] {
        dispatcher.handle_update(update).await.unwrap();
    }

    assert_eq!(bot.sent_texts(), vec!["none", "none", "a"]);
    assert_eq!(
        dispatcher.get_state("chat1:alice").await.unwrap().as_deref(),
        Some("a")
    );
    assert_eq!(dispatcher.get_state("chat1:bob").await.unwrap(), None);
}

#[tokio::test]
async fn test_out_of_band_session_access() {
    let (dispatcher, bot) = dispatcher(DispatcherConfig::default());
    dispatcher
        .router()
        .message_with([filters::state("awaiting_name")], |ctx| async move {
            let data = ctx.get_data().await?;
            ctx.reply(format!("hello {}", data["greeting"])).await
        });

    dispatcher.set_state("chat1", "awaiting_name").await.unwrap();
    let mut patch = maxbot_core::FsmData::new();
    patch.insert("greeting".to_string(), serde_json::json!("there"));
    let merged = dispatcher.update_data("chat1", patch).await.unwrap();
    assert_eq!(merged["greeting"], "there");

    assert!(dispatcher
        .handle_update(message_update(1, "chat1", "u", "Bob"))
        .await
        .unwrap());
    assert_eq!(bot.sent_texts(), vec![r#"hello "there""#]);

    dispatcher.clear_state("chat1").await.unwrap();
    dispatcher.clear_data("chat1").await.unwrap();
    assert!(dispatcher.get_data("chat1").await.unwrap().is_empty());
    assert!(!dispatcher
        .handle_update(message_update(2, "chat1", "u", "Bob"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_include_router_through_dispatcher() {
    let (dispatcher, bot) = dispatcher(DispatcherConfig::default());
    let admin = Router::named("admin");
    admin.message_with([filters::command("stats")], |ctx| async move {
        ctx.reply("42 users").await
    });
    dispatcher.include_router(&admin).unwrap();

    assert!(dispatcher
        .handle_update(message_update(1, "c", "u", "/stats"))
        .await
        .unwrap());
    assert_eq!(bot.sent_texts(), vec!["42 users"]);

    // Including again is a no-op; including the root below its child is a cycle.
    dispatcher.include_router(&admin).unwrap();
    assert_eq!(dispatcher.router().children().len(), 1);
    let err = admin.include_router(dispatcher.router()).unwrap_err();
    assert!(matches!(err, MaxbotError::Router(_)));
}

#[test]
fn test_invalid_config_is_rejected() {
    let mut cfg = DispatcherConfig::default();
    cfg.processing.max_in_flight = 0;
    let bot = Arc::new(maxbot_core::testkit::MockBot::new());
    let err = maxbot_dispatch::Dispatcher::new(bot, cfg).unwrap_err();
    assert!(matches!(err, MaxbotError::Config(_)));
}
