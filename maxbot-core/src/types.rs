//! Update model and request shapes exchanged with the platform.
//!
//! An [`Update`] carries its `update_id` plus exactly one payload, modelled as the
//! [`UpdateKind`] sum type and flattened on the wire (`{"update_id": 1, "message": {...}}`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{self, ParsedCommand};
use crate::error::MaxbotError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub callback_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<Chat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenInlineResult {
    pub result_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingQuery {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreCheckoutQuery {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollAnswer {
    pub poll_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default)]
    pub option_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMemberUpdated {
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatJoinRequest {
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
}

/// The single populated payload of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Message(Message),
    EditedMessage(Message),
    ChannelPost(Message),
    EditedChannelPost(Message),
    InlineQuery(InlineQuery),
    ChosenInlineResult(ChosenInlineResult),
    CallbackQuery(CallbackQuery),
    ShippingQuery(ShippingQuery),
    PreCheckoutQuery(PreCheckoutQuery),
    Poll(Poll),
    PollAnswer(PollAnswer),
    MyChatMember(ChatMemberUpdated),
    ChatMember(ChatMemberUpdated),
    ChatJoinRequest(ChatJoinRequest),
}

/// Discriminant of [`UpdateKind`], used for handler registration and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    InlineQuery,
    ChosenInlineResult,
    CallbackQuery,
    ShippingQuery,
    PreCheckoutQuery,
    Poll,
    PollAnswer,
    MyChatMember,
    ChatMember,
    ChatJoinRequest,
}

impl UpdateType {
    pub const ALL: [UpdateType; 14] = [
        UpdateType::Message,
        UpdateType::EditedMessage,
        UpdateType::ChannelPost,
        UpdateType::EditedChannelPost,
        UpdateType::InlineQuery,
        UpdateType::ChosenInlineResult,
        UpdateType::CallbackQuery,
        UpdateType::ShippingQuery,
        UpdateType::PreCheckoutQuery,
        UpdateType::Poll,
        UpdateType::PollAnswer,
        UpdateType::MyChatMember,
        UpdateType::ChatMember,
        UpdateType::ChatJoinRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateType::Message => "message",
            UpdateType::EditedMessage => "edited_message",
            UpdateType::ChannelPost => "channel_post",
            UpdateType::EditedChannelPost => "edited_channel_post",
            UpdateType::InlineQuery => "inline_query",
            UpdateType::ChosenInlineResult => "chosen_inline_result",
            UpdateType::CallbackQuery => "callback_query",
            UpdateType::ShippingQuery => "shipping_query",
            UpdateType::PreCheckoutQuery => "pre_checkout_query",
            UpdateType::Poll => "poll",
            UpdateType::PollAnswer => "poll_answer",
            UpdateType::MyChatMember => "my_chat_member",
            UpdateType::ChatMember => "chat_member",
            UpdateType::ChatJoinRequest => "chat_join_request",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateType {
    type Err = MaxbotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        UpdateType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| MaxbotError::Config(format!("unknown update type: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(flatten)]
    pub kind: UpdateKind,
}

/// One `get_updates` reply.
///
/// `skipped` holds the ids of entries that arrived but could not be decoded
/// (an unknown kind, a missing field); polling still moves its cursor past them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    pub skipped: Vec<i64>,
}

impl UpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.skipped.is_empty()
    }

    /// Entries received, decoded or not.
    pub fn len(&self) -> usize {
        self.updates.len() + self.skipped.len()
    }
}

impl From<Vec<Update>> for UpdateBatch {
    fn from(updates: Vec<Update>) -> Self {
        Self {
            updates,
            skipped: Vec::new(),
        }
    }
}

impl Update {
    pub fn new(update_id: i64, kind: UpdateKind) -> Self {
        Self { update_id, kind }
    }

    pub fn update_type(&self) -> UpdateType {
        match &self.kind {
            UpdateKind::Message(_) => UpdateType::Message,
            UpdateKind::EditedMessage(_) => UpdateType::EditedMessage,
            UpdateKind::ChannelPost(_) => UpdateType::ChannelPost,
            UpdateKind::EditedChannelPost(_) => UpdateType::EditedChannelPost,
            UpdateKind::InlineQuery(_) => UpdateType::InlineQuery,
            UpdateKind::ChosenInlineResult(_) => UpdateType::ChosenInlineResult,
            UpdateKind::CallbackQuery(_) => UpdateType::CallbackQuery,
            UpdateKind::ShippingQuery(_) => UpdateType::ShippingQuery,
            UpdateKind::PreCheckoutQuery(_) => UpdateType::PreCheckoutQuery,
            UpdateKind::Poll(_) => UpdateType::Poll,
            UpdateKind::PollAnswer(_) => UpdateType::PollAnswer,
            UpdateKind::MyChatMember(_) => UpdateType::MyChatMember,
            UpdateKind::ChatMember(_) => UpdateType::ChatMember,
            UpdateKind::ChatJoinRequest(_) => UpdateType::ChatJoinRequest,
        }
    }

    /// The new message, or the edited one when this is an edit.
    pub fn message(&self) -> Option<&Message> {
        match &self.kind {
            UpdateKind::Message(m) | UpdateKind::EditedMessage(m) => Some(m),
            _ => None,
        }
    }

    pub fn callback_query(&self) -> Option<&CallbackQuery> {
        match &self.kind {
            UpdateKind::CallbackQuery(q) => Some(q),
            _ => None,
        }
    }

    /// First chat found on the payload: message-like chat, then callback chat, then
    /// the callback's message chat, then member/join-request chat.
    pub fn chat(&self) -> Option<&Chat> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => Some(&m.chat),
            UpdateKind::CallbackQuery(q) => q
                .chat
                .as_ref()
                .or_else(|| q.message.as_ref().map(|m| &m.chat)),
            UpdateKind::MyChatMember(u) | UpdateKind::ChatMember(u) => Some(&u.chat),
            UpdateKind::ChatJoinRequest(r) => Some(&r.chat),
            _ => None,
        }
    }

    /// First user found on the payload, probing sender/from/user fields.
    pub fn user(&self) -> Option<&User> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => m.sender.as_ref(),
            UpdateKind::CallbackQuery(q) => q
                .from
                .as_ref()
                .or_else(|| q.message.as_ref().and_then(|m| m.sender.as_ref())),
            UpdateKind::InlineQuery(q) => q.from.as_ref(),
            UpdateKind::ChosenInlineResult(r) => r.from.as_ref(),
            UpdateKind::ShippingQuery(q) => q.from.as_ref(),
            UpdateKind::PreCheckoutQuery(q) => q.from.as_ref(),
            UpdateKind::PollAnswer(a) => a.user.as_ref(),
            UpdateKind::MyChatMember(u) | UpdateKind::ChatMember(u) => u.from.as_ref(),
            UpdateKind::ChatJoinRequest(r) => r.from.as_ref(),
            UpdateKind::Poll(_) => None,
        }
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat()
            .map(|c| c.chat_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user()
            .map(|u| u.user_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn chat_type(&self) -> Option<&str> {
        self.chat()
            .and_then(|c| c.chat_type.as_deref())
            .filter(|t| !t.is_empty())
    }

    /// Trimmed text of [`Update::message`]; empty when there is none.
    pub fn message_text(&self) -> &str {
        self.message()
            .and_then(|m| m.text.as_deref())
            .map(str::trim)
            .unwrap_or("")
    }

    /// Trimmed callback payload; empty when there is none.
    pub fn callback_data(&self) -> &str {
        self.callback_query()
            .and_then(|q| q.data.as_deref())
            .map(str::trim)
            .unwrap_or("")
    }

    pub fn command(&self) -> Option<ParsedCommand> {
        command::parse(self.message_text())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetUpdatesRequest {
    pub offset: i64,
    pub limit: u32,
    /// Long-poll timeout in seconds; 0 returns immediately.
    pub timeout: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditMessageTextRequest {
    pub chat_id: String,
    pub message_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_markup: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerCallbackQueryRequest {
    pub callback_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_alert: Option<bool>,
}
