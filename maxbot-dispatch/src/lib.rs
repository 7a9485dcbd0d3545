//! # maxbot-dispatch
//!
//! The [`Dispatcher`] runs updates through a router tree under a processing
//! policy (concurrency cap, per-key ordering, handler timeout), drives long
//! polling with its startup/shutdown lifecycle, and backs the
//! [`WebhookHandler`] adapter.

pub mod config;
pub mod dispatcher;
mod gate;
pub mod webhook;

pub use config::{DispatcherConfig, FsmStrategy, OrderedBy, PollingConfig, ProcessingConfig};
pub use dispatcher::{BatchResult, Dispatcher, LifecycleHook, ShutdownOptions, UnhandledHandler};
pub use webhook::{
    WebhookErrorHandler, WebhookHandler, WebhookMode, WebhookOptions, WebhookResponse,
    DEFAULT_SECRET_HEADER, DEFAULT_WEBHOOK_PATH,
};
