//! Unit tests for ThrottleMiddleware.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{message, recording_router};
use crate::{IntoMiddleware, ThrottleMiddleware, ThrottleOptions};

/// **Test: calls past the limit are dropped until the window resets.**
///
/// **Setup:** limit 2 per 1000ms, `on_limited` recording the retry delay; paused clock.
/// **Action:** m1, m2, m3 at t=0, then m4 after advancing 1205ms.
/// **Expected:** m1, m2, m4 handled; m3 limited with 1000ms left.
#[tokio::test(start_paused = true)]
async fn test_throttle_limits_calls_inside_interval() {
    let limited = Arc::new(Mutex::new(Vec::new()));
    let sink = limited.clone();
    let throttle = ThrottleMiddleware::new(
        ThrottleOptions::new(2, Duration::from_millis(1000)).on_limited(move |_ctx, retry_after| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(retry_after);
                Ok(())
            }
        }),
    )
    .unwrap();

    let (router, handled) = recording_router();
    router.use_middleware(throttle.into_middleware());

    for (id, text) in [(1, "m1"), (2, "m2"), (3, "m3")] {
        assert!(router.dispatch(message(id, "chat-a", "u", text)).await.unwrap());
    }
    assert_eq!(*handled.lock().unwrap(), vec!["chat-a:m1", "chat-a:m2"]);
    assert_eq!(*limited.lock().unwrap(), vec![Duration::from_millis(1000)]);

    tokio::time::advance(Duration::from_millis(1205)).await;
    router.dispatch(message(4, "chat-a", "u", "m4")).await.unwrap();
    assert_eq!(
        *handled.lock().unwrap(),
        vec!["chat-a:m1", "chat-a:m2", "chat-a:m4"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_throttle_buckets_are_per_chat() {
    let throttle =
        ThrottleMiddleware::new(ThrottleOptions::new(1, Duration::from_secs(10))).unwrap();
    let (router, handled) = recording_router();
    router.use_middleware(throttle.into_middleware());

    router.dispatch(message(1, "chat-a", "u", "a1")).await.unwrap();
    router.dispatch(message(2, "chat-a", "u", "a2")).await.unwrap();
    router.dispatch(message(3, "chat-b", "u", "b1")).await.unwrap();

    assert_eq!(*handled.lock().unwrap(), vec!["chat-a:a1", "chat-b:b1"]);
}

#[tokio::test(start_paused = true)]
async fn test_throttle_custom_key() {
    let throttle = ThrottleMiddleware::new(
        ThrottleOptions::new(1, Duration::from_secs(10))
            .key(|ctx| ctx.user_id().unwrap_or("anonymous").to_string()),
    )
    .unwrap();
    let (router, handled) = recording_router();
    router.use_middleware(throttle.into_middleware());

    router.dispatch(message(1, "chat-a", "alice", "1")).await.unwrap();
    router.dispatch(message(2, "chat-b", "alice", "2")).await.unwrap();
    router.dispatch(message(3, "chat-b", "bob", "3")).await.unwrap();

    assert_eq!(*handled.lock().unwrap(), vec!["chat-a:1", "chat-b:3"]);
}

#[test]
fn test_throttle_rejects_invalid_options() {
    assert!(ThrottleMiddleware::new(ThrottleOptions::new(0, Duration::from_secs(1))).is_err());
    assert!(ThrottleMiddleware::new(ThrottleOptions::new(1, Duration::ZERO)).is_err());
}
