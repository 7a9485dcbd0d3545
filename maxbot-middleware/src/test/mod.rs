//! Unit test module
//!
//! Middleware unit tests live here, separate from source files.
//! Tests drive middleware through a real router and the core testkit.

mod logging_auth_middleware_test;
mod throttle_middleware_test;

use std::sync::{Arc, Mutex};

use maxbot_core::testkit::{message_update, MockBot};
use maxbot_router::{Context, Router};

/// Router whose single message handler records `chat:text`.
pub(crate) fn recording_router() -> (Router, Arc<Mutex<Vec<String>>>) {
    let router = Router::new();
    let handled = Arc::new(Mutex::new(Vec::new()));
    let sink = handled.clone();
    router.message(move |ctx| {
        let sink = sink.clone();
        async move {
            sink.lock()
                .unwrap()
                .push(format!("{}:{}", ctx.chat_id().unwrap_or(""), ctx.message_text()));
            Ok(())
        }
    });
    (router, handled)
}

pub(crate) fn message(id: i64, chat: &str, user: &str, text: &str) -> Context {
    Context::new(Arc::new(MockBot::new()), message_update(id, chat, user, text))
}
