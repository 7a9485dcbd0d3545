//! Shared fixtures for dispatcher integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use maxbot_core::testkit::MockBot;
use maxbot_dispatch::{Dispatcher, DispatcherConfig};

pub use maxbot_core::testkit::{callback_update, message_update, Fetch};

pub fn dispatcher(config: DispatcherConfig) -> (Dispatcher, Arc<MockBot>) {
    dispatcher_with(MockBot::new(), config)
}

pub fn dispatcher_with(bot: MockBot, config: DispatcherConfig) -> (Dispatcher, Arc<MockBot>) {
    let bot = Arc::new(bot);
    let dispatcher = Dispatcher::new(bot.clone(), config).unwrap();
    (dispatcher, bot)
}

/// Config for polling tests: fast idle loop, short error delays.
pub fn polling_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.polling.idle_delay_ms = 10;
    config.polling.error_delay_ms = 100;
    config.polling.max_error_delay_ms = 150;
    config
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

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
