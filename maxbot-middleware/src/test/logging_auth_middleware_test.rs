//! Unit tests for LoggingMiddleware and AuthMiddleware.

use maxbot_core::{HandlerError, MaxbotError};

use super::{message, recording_router};
use crate::{AuthMiddleware, IntoMiddleware, LoggingMiddleware};

#[tokio::test]
async fn test_logging_middleware_continues() {
    let (router, handled) = recording_router();
    router.use_middleware(LoggingMiddleware.into_middleware());

    let result = router.dispatch(message(1, "chat1", "u1", "hello")).await;
    assert!(result.unwrap());
    assert_eq!(*handled.lock().unwrap(), vec!["chat1:hello"]);
}

#[tokio::test]
async fn test_logging_middleware_passes_errors_through() {
    let router = maxbot_router::Router::new();
    router.use_middleware(LoggingMiddleware.into_middleware());
    router.message(|_ctx| async { Err(HandlerError::Failed("nope".to_string()).into()) });

    let err = router.dispatch(message(1, "chat1", "u1", "hello")).await.unwrap_err();
    assert!(matches!(err, MaxbotError::Handler(HandlerError::Failed(_))));
}

#[tokio::test]
async fn test_auth_middleware_allowed_user_continues() {
    let (router, handled) = recording_router();
    router.use_middleware(AuthMiddleware::new(["100", "200"]).into_middleware());

    assert!(router.dispatch(message(1, "chat1", "100", "hi")).await.unwrap());
    assert_eq!(handled.lock().unwrap().len(), 1);
}

/// **Test: unknown users are rejected with `Unauthorized` before the handler runs.**
#[tokio::test]
async fn test_auth_middleware_unauthorized_returns_err() {
    let (router, handled) = recording_router();
    router.use_middleware(AuthMiddleware::new(["100"]).into_middleware());

    let err = router
        .dispatch(message(1, "chat1", "999", "hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MaxbotError::Handler(HandlerError::Unauthorized)
    ));
    assert!(handled.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_auth_middleware_rejects_updates_without_user() {
    let mw = AuthMiddleware::new(vec!["100".to_string()]);
    assert!(!mw.is_allowed(None));
    assert!(mw.is_allowed(Some("100")));

    let (router, _) = recording_router();
    router.use_middleware(mw.into_middleware());
    assert!(router.dispatch(message(1, "chat1", "", "hi")).await.is_err());
}

#[tokio::test]
async fn test_auth_rejection_can_be_handled_by_router() {
    let (router, handled) = recording_router();
    router.use_middleware(AuthMiddleware::new(["100"]).into_middleware());
    router.on_error(|err, ctx| {
        Box::pin(async move {
            let denied = matches!(err, MaxbotError::Handler(HandlerError::Unauthorized));
            if denied {
                let _ = ctx.reply("access denied").await;
            }
            denied
        })
    });

    assert!(router.dispatch(message(1, "chat1", "7", "hi")).await.unwrap());
    assert!(handled.lock().unwrap().is_empty());
}
