//! # maxbot-core
//!
//! Shared building blocks for MAX chat bots: the update model, slash-command parsing,
//! the error taxonomy, the [`Bot`] transport trait with its HTTP implementation,
//! inline keyboards with packed callback payloads, and FSM session storage.

pub mod bot;
pub mod callback_data;
pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod keyboard;
pub mod logger;
pub mod state_group;
pub mod storage;
#[cfg(feature = "testkit")]
pub mod testkit;
pub mod types;

pub use bot::Bot;
pub use callback_data::{CallbackData, CallbackFields};
pub use client::HttpBot;
pub use command::ParsedCommand;
pub use config::ClientConfig;
pub use error::{HandlerError, MaxbotError, Result};
pub use keyboard::{InlineKeyboard, InlineKeyboardButton, InlineKeyboardMarkup};
pub use logger::init_tracing;
pub use state_group::StateGroup;
pub use storage::{FsmData, FsmStorage, MemoryStorage};
pub use types::*;
