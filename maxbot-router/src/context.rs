//! Per-update facade: identity, command parsing, runtime metadata, FSM session and
//! reply helpers.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use maxbot_core::{
    command, AnswerCallbackQueryRequest, Bot, CallbackQuery, EditMessageTextRequest, FsmData,
    FsmStorage, InlineKeyboardMarkup, Message, ParsedCommand, Result, SendMessageRequest, Update,
    UpdateType,
};
use serde_json::Value;
use tracing::debug;

/// Metadata accumulated while an update travels down the router tree.
pub type Meta = serde_json::Map<String, Value>;

#[derive(Clone)]
struct Session {
    storage: Arc<dyn FsmStorage>,
    key: Option<String>,
}

/// Optional extras for outbound messages.
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    pub reply_markup: Option<Value>,
}

impl ReplyOptions {
    pub fn keyboard(markup: &InlineKeyboardMarkup) -> Result<Self> {
        Ok(Self {
            reply_markup: Some(serde_json::to_value(markup)?),
        })
    }
}

/// Cheap to clone. Clones share one metadata map; [`Context::with_meta`] forks it.
#[derive(Clone)]
pub struct Context {
    bot: Arc<dyn Bot>,
    update: Arc<Update>,
    session: Option<Session>,
    meta: Arc<RwLock<Meta>>,
}

impl Context {
    pub fn new(bot: Arc<dyn Bot>, update: Update) -> Self {
        Self {
            bot,
            update: Arc::new(update),
            session: None,
            meta: Arc::new(RwLock::new(Meta::new())),
        }
    }

    /// Binds session storage keyed by the update's chat id.
    pub fn with_session(self, storage: Arc<dyn FsmStorage>) -> Self {
        let key = self.update.chat_id().map(String::from);
        self.with_session_key(storage, key)
    }

    /// Binds session storage under an explicit key. `None` turns every session
    /// operation into a no-op.
    pub fn with_session_key(mut self, storage: Arc<dyn FsmStorage>, key: Option<String>) -> Self {
        let key = key.filter(|k| !k.is_empty());
        self.session = Some(Session { storage, key });
        self
    }

    pub fn update(&self) -> &Update {
        &self.update
    }

    pub fn bot(&self) -> &Arc<dyn Bot> {
        &self.bot
    }

    pub fn update_id(&self) -> i64 {
        self.update.update_id
    }

    pub fn update_type(&self) -> UpdateType {
        self.update.update_type()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.update.chat_id()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.update.user_id()
    }

    pub fn chat_type(&self) -> Option<&str> {
        self.update.chat_type()
    }

    /// The message, or the edited message.
    pub fn message(&self) -> Option<&Message> {
        self.update.message()
    }

    pub fn callback_query(&self) -> Option<&CallbackQuery> {
        self.update.callback_query()
    }

    pub fn message_text(&self) -> &str {
        self.update.message_text()
    }

    pub fn callback_data(&self) -> &str {
        self.update.callback_data()
    }

    pub fn callback_id(&self) -> Option<&str> {
        self.callback_query()
            .map(|q| q.callback_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn command_info(&self) -> Option<ParsedCommand> {
        self.update.command()
    }

    /// Lower-cased command name, if the message is a command.
    pub fn command(&self) -> Option<String> {
        self.command_info().map(|c| c.name)
    }

    /// Trimmed text after the command token; empty when not a command.
    pub fn command_args(&self) -> String {
        self.command_info().map(|c| c.args_text).unwrap_or_default()
    }

    pub fn is_command(&self, name: &str) -> bool {
        let wanted = command::normalize(name);
        !wanted.is_empty() && self.command().as_deref() == Some(wanted.as_str())
    }

    /// True when the command is addressed to `username`. A command without a
    /// mention counts when `allow_without_mention` is set. An empty `username`
    /// never matches.
    pub fn is_command_for(&self, username: &str, allow_without_mention: bool) -> bool {
        let wanted = command::normalize_mention(username);
        if wanted.is_empty() {
            return false;
        }
        let Some(info) = self.command_info() else {
            return false;
        };
        match info.mention {
            None => allow_without_mention,
            Some(mention) => mention == wanted,
        }
    }

    fn meta_read(&self) -> RwLockReadGuard<'_, Meta> {
        self.meta.read().unwrap_or_else(|e| e.into_inner())
    }

    fn meta_write(&self) -> RwLockWriteGuard<'_, Meta> {
        self.meta.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn meta(&self, key: &str) -> Option<Value> {
        self.meta_read().get(key).cloned()
    }

    pub fn has_meta(&self, key: &str) -> bool {
        self.meta_read().contains_key(key)
    }

    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.meta_write().insert(key.into(), value.into());
    }

    pub fn set_meta_many(&self, patch: Meta) {
        self.meta_write().extend(patch);
    }

    /// Snapshot of all metadata.
    pub fn meta_all(&self) -> Meta {
        self.meta_read().clone()
    }

    /// New context sharing everything but metadata, which is this context's
    /// metadata merged with `patch`. `self` is left untouched.
    pub fn with_meta(&self, patch: Meta) -> Context {
        let mut merged = self.meta_all();
        merged.extend(patch);
        Context {
            bot: self.bot.clone(),
            update: self.update.clone(),
            session: self.session.clone(),
            meta: Arc::new(RwLock::new(merged)),
        }
    }

    /// Resolved session key, if a session is bound and the key is known.
    pub fn state_key(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.key.as_deref())
    }

    fn session(&self) -> Option<(&dyn FsmStorage, &str)> {
        let session = self.session.as_ref()?;
        let key = session.key.as_deref()?;
        Some((session.storage.as_ref(), key))
    }

    pub async fn get_state(&self) -> Result<Option<String>> {
        match self.session() {
            Some((storage, key)) => storage.get(key).await,
            None => Ok(None),
        }
    }

    pub async fn set_state(&self, state: &str) -> Result<()> {
        match self.session() {
            Some((storage, key)) => storage.set(key, state).await,
            None => Ok(()),
        }
    }

    pub async fn clear_state(&self) -> Result<()> {
        match self.session() {
            Some((storage, key)) => storage.clear(key).await,
            None => Ok(()),
        }
    }

    pub async fn get_data(&self) -> Result<FsmData> {
        match self.session() {
            Some((storage, key)) => storage.get_data(key).await,
            None => Ok(FsmData::new()),
        }
    }

    pub async fn set_data(&self, data: FsmData) -> Result<()> {
        match self.session() {
            Some((storage, key)) => storage.set_data(key, data).await,
            None => Ok(()),
        }
    }

    /// Shallow merge; returns the merged data (empty without a session).
    pub async fn update_data(&self, patch: FsmData) -> Result<FsmData> {
        match self.session() {
            Some((storage, key)) => storage.update_data(key, patch).await,
            None => Ok(FsmData::new()),
        }
    }

    pub async fn clear_data(&self) -> Result<()> {
        match self.session() {
            Some((storage, key)) => storage.clear_data(key).await,
            None => Ok(()),
        }
    }

    pub async fn reply(&self, text: impl Into<String>) -> Result<()> {
        self.reply_with(text, ReplyOptions::default()).await
    }

    /// Sends a message to the current chat; no-op without a chat id.
    pub async fn reply_with(&self, text: impl Into<String>, options: ReplyOptions) -> Result<()> {
        let Some(chat_id) = self.chat_id() else {
            debug!(update_id = self.update_id(), "reply skipped: no chat id");
            return Ok(());
        };
        let request = SendMessageRequest {
            chat_id: chat_id.to_string(),
            text: text.into(),
            reply_markup: options.reply_markup,
        };
        self.bot.send_message(&request).await
    }

    pub async fn edit_message(&self, text: impl Into<String>) -> Result<()> {
        self.edit_message_with(text, ReplyOptions::default()).await
    }

    /// Edits the callback's message (or the current message); no-op without
    /// chat and message ids.
    pub async fn edit_message_with(
        &self,
        text: impl Into<String>,
        options: ReplyOptions,
    ) -> Result<()> {
        let message_id = self
            .callback_query()
            .and_then(|q| q.message.as_ref())
            .or_else(|| self.message())
            .map(|m| m.message_id.as_str())
            .filter(|id| !id.is_empty());
        let (Some(chat_id), Some(message_id)) = (self.chat_id(), message_id) else {
            debug!(update_id = self.update_id(), "edit skipped: no chat or message id");
            return Ok(());
        };
        let request = EditMessageTextRequest {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            text: text.into(),
            reply_markup: options.reply_markup,
        };
        self.bot.edit_message_text(&request).await
    }

    /// Answers the callback query; no-op for non-callback updates.
    pub async fn answer_callback(&self, text: Option<&str>) -> Result<()> {
        self.answer_callback_with(text, None).await
    }

    pub async fn answer_callback_with(
        &self,
        text: Option<&str>,
        show_alert: Option<bool>,
    ) -> Result<()> {
        let Some(callback_id) = self.callback_id() else {
            debug!(update_id = self.update_id(), "answer skipped: no callback id");
            return Ok(());
        };
        let request = AnswerCallbackQueryRequest {
            callback_id: callback_id.to_string(),
            text: text.map(String::from),
            show_alert,
        };
        self.bot.answer_callback_query(&request).await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("update_id", &self.update.update_id)
            .field("update_type", &self.update.update_type())
            .field("state_key", &self.state_key())
            .field("meta", &*self.meta_read())
            .finish()
    }
}
