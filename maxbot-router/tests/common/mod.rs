//! Shared fixtures for router integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use maxbot_core::testkit::MockBot;
use maxbot_core::{MemoryStorage, Update};
use maxbot_router::Context;

pub use maxbot_core::testkit::{callback_update, message_update};

/// Context over `update` with a recording bot and chat-keyed in-memory session.
pub fn context(update: Update) -> (Context, Arc<MockBot>, Arc<MemoryStorage>) {
    let bot = Arc::new(MockBot::new());
    let storage = Arc::new(MemoryStorage::new());
    let ctx = Context::new(bot.clone(), update).with_session(storage.clone());
    (ctx, bot, storage)
}

/// Context over `update` sharing an existing store.
pub fn context_with(update: Update, storage: Arc<MemoryStorage>) -> Context {
    Context::new(Arc::new(MockBot::new()), update).with_session(storage)
}

pub fn text(update_id: i64, text: &str) -> Update {
    message_update(update_id, "chat1", "user1", text)
}

/// Ordered event log shared between handlers.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
