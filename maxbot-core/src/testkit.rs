//! Test helpers: update fixtures and a recording [`MockBot`].
//!
//! Enabled with the `testkit` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::bot::Bot;
use crate::error::{MaxbotError, Result};
use crate::types::{
    AnswerCallbackQueryRequest, CallbackQuery, Chat, EditMessageTextRequest, GetUpdatesRequest,
    Message, SendMessageRequest, Update, UpdateBatch, UpdateKind, User,
};

fn user(user_id: &str) -> Option<User> {
    (!user_id.is_empty()).then(|| User {
        user_id: user_id.to_string(),
        username: None,
        name: None,
    })
}

fn chat(chat_id: &str) -> Chat {
    Chat {
        chat_id: chat_id.to_string(),
        title: None,
        chat_type: None,
    }
}

/// Text message from `user_id` in `chat_id`. An empty `user_id` leaves the sender unset.
pub fn message_update(update_id: i64, chat_id: &str, user_id: &str, text: &str) -> Update {
    Update::new(
        update_id,
        UpdateKind::Message(Message {
            message_id: format!("m{}", update_id),
            chat: chat(chat_id),
            sender: user(user_id),
            text: Some(text.to_string()),
        }),
    )
}

/// Callback query carrying `data`, attached to a message in `chat_id`.
pub fn callback_update(update_id: i64, chat_id: &str, user_id: &str, data: &str) -> Update {
    Update::new(
        update_id,
        UpdateKind::CallbackQuery(CallbackQuery {
            callback_id: format!("cb{}", update_id),
            from: user(user_id),
            data: Some(data.to_string()),
            chat: None,
            message: Some(Message {
                message_id: format!("m{}", update_id),
                chat: chat(chat_id),
                sender: None,
                text: None,
            }),
        }),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotCall {
    GetUpdates(GetUpdatesRequest),
    SendMessage(SendMessageRequest),
    EditMessageText(EditMessageTextRequest),
    AnswerCallbackQuery(AnswerCallbackQueryRequest),
}

/// One scripted reply to `get_updates`.
pub enum Fetch {
    Updates(Vec<Update>),
    Batch(UpdateBatch),
    Fail(String),
}

/// Records every call and serves scripted `get_updates` replies; an exhausted
/// script answers with empty batches.
#[derive(Default)]
pub struct MockBot {
    calls: Mutex<Vec<BotCall>>,
    script: Mutex<VecDeque<Fetch>>,
    fetches: AtomicUsize,
}

impl MockBot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batches(batches: Vec<Vec<Update>>) -> Self {
        let bot = Self::new();
        for batch in batches {
            bot.push_fetch(Fetch::Updates(batch));
        }
        bot
    }

    pub fn push_fetch(&self, fetch: Fetch) {
        self.lock_script().push_back(fetch);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<BotCall> {
        self.lock_calls().clone()
    }

    pub fn get_updates_requests(&self) -> Vec<GetUpdatesRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::GetUpdates(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn sent_messages(&self) -> Vec<SendMessageRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::SendMessage(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Texts of all sent messages, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_messages().into_iter().map(|m| m.text).collect()
    }

    fn record(&self, call: BotCall) {
        self.lock_calls().push(call);
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<BotCall>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Fetch>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Bot for MockBot {
    async fn get_updates(&self, request: &GetUpdatesRequest) -> Result<UpdateBatch> {
        tokio::task::yield_now().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.record(BotCall::GetUpdates(request.clone()));
        let next = self.lock_script().pop_front();
        match next {
            Some(Fetch::Updates(updates)) => Ok(updates.into()),
            Some(Fetch::Batch(batch)) => Ok(batch),
            Some(Fetch::Fail(message)) => Err(MaxbotError::Bot(message)),
            None => Ok(UpdateBatch::default()),
        }
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<()> {
        self.record(BotCall::SendMessage(request.clone()));
        Ok(())
    }

    async fn edit_message_text(&self, request: &EditMessageTextRequest) -> Result<()> {
        self.record(BotCall::EditMessageText(request.clone()));
        Ok(())
    }

    async fn answer_callback_query(&self, request: &AnswerCallbackQueryRequest) -> Result<()> {
        self.record(BotCall::AnswerCallbackQuery(request.clone()));
        Ok(())
    }
}
