//! Dispatcher configuration: processing policy, polling knobs and FSM key strategy.
//!
//! Deserialisable with per-field defaults, or loaded from `MAXBOT_*` environment
//! variables. [`DispatcherConfig::validate`] runs when a dispatcher is built.

use std::env;
use std::fmt;
use std::str::FromStr;

use maxbot_core::{MaxbotError, Result, Update};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Which key serialises updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderedBy {
    #[default]
    None,
    Chat,
    User,
    /// The resolved FSM session key.
    Fsm,
}

impl OrderedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderedBy::None => "none",
            OrderedBy::Chat => "chat",
            OrderedBy::User => "user",
            OrderedBy::Fsm => "fsm",
        }
    }

    /// Ordering key for `update`; `None` means no ordering constraint.
    pub fn key_for(&self, update: &Update, fsm_key: Option<&str>) -> Option<String> {
        let key = match self {
            OrderedBy::None => None,
            OrderedBy::Chat => update.chat_id(),
            OrderedBy::User => update.user_id(),
            OrderedBy::Fsm => fsm_key,
        };
        key.filter(|k| !k.is_empty()).map(String::from)
    }
}

impl fmt::Display for OrderedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderedBy {
    type Err = MaxbotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(OrderedBy::None),
            "chat" => Ok(OrderedBy::Chat),
            "user" => Ok(OrderedBy::User),
            "fsm" => Ok(OrderedBy::Fsm),
            other => Err(MaxbotError::Config(format!("unknown ordered_by: {}", other))),
        }
    }
}

/// How the FSM session key is derived from an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsmStrategy {
    #[default]
    Chat,
    User,
    UserInChat,
    Global,
}

impl FsmStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsmStrategy::Chat => "chat",
            FsmStrategy::User => "user",
            FsmStrategy::UserInChat => "user_in_chat",
            FsmStrategy::Global => "global",
        }
    }

    /// Session key for `update`. `UserInChat` falls back to whichever of chat or
    /// user is known when the other is missing.
    ///
    /// `UserInChat` joins percent-encoded ids with `:`, so the pair is never
    /// ambiguous even when an id contains `:` itself.
    pub fn key_for(&self, update: &Update) -> Option<String> {
        let chat = update.chat_id().filter(|c| !c.is_empty());
        let user = update.user_id().filter(|u| !u.is_empty());
        match self {
            FsmStrategy::Chat => chat.map(String::from),
            FsmStrategy::User => user.map(String::from),
            FsmStrategy::UserInChat => match (chat, user) {
                (Some(chat), Some(user)) => Some(format!(
                    "{}:{}",
                    urlencoding::encode(chat),
                    urlencoding::encode(user)
                )),
                (chat, user) => chat.or(user).map(|id| urlencoding::encode(id).into_owned()),
            },
            FsmStrategy::Global => Some("global".to_string()),
        }
    }
}

impl fmt::Display for FsmStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsmStrategy {
    type Err = MaxbotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "chat" => Ok(FsmStrategy::Chat),
            "user" => Ok(FsmStrategy::User),
            "user_in_chat" => Ok(FsmStrategy::UserInChat),
            "global" => Ok(FsmStrategy::Global),
            other => Err(MaxbotError::Config(format!("unknown fsm_strategy: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_in_flight: usize,
    pub ordered_by: OrderedBy,
    pub handler_timeout_ms: Option<u64>,
    /// When set, polling shutdown drains in-flight work for up to this long.
    pub graceful_shutdown_ms: Option<u64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            ordered_by: OrderedBy::None,
            handler_timeout_ms: None,
            graceful_shutdown_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub offset: i64,
    pub limit: u32,
    pub timeout_seconds: u32,
    pub idle_delay_ms: u64,
    pub drop_pending_updates: bool,
    pub recover_errors: bool,
    pub error_delay_ms: u64,
    pub max_error_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
            timeout_seconds: 25,
            idle_delay_ms: 400,
            drop_pending_updates: false,
            recover_errors: true,
            error_delay_ms: 1000,
            max_error_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub processing: ProcessingConfig,
    pub polling: PollingConfig,
    pub fsm_strategy: FsmStrategy,
}

impl DispatcherConfig {
    /// Rejects values the dispatcher cannot run with. Nothing is corrected.
    pub fn validate(&self) -> Result<()> {
        let processing = &self.processing;
        if processing.max_in_flight == 0 {
            return Err(MaxbotError::Config(
                "processing.max_in_flight must be > 0".to_string(),
            ));
        }
        if processing.max_in_flight > Semaphore::MAX_PERMITS {
            return Err(MaxbotError::Config(format!(
                "processing.max_in_flight must be <= {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if processing.handler_timeout_ms == Some(0) {
            return Err(MaxbotError::Config(
                "processing.handler_timeout_ms must be > 0".to_string(),
            ));
        }

        let polling = &self.polling;
        if polling.limit == 0 {
            return Err(MaxbotError::Config("polling.limit must be > 0".to_string()));
        }
        if polling.max_error_delay_ms < polling.error_delay_ms {
            return Err(MaxbotError::Config(
                "polling.max_error_delay_ms must be >= polling.error_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `MAXBOT_*` variables. Unparsable values are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("MAXBOT_MAX_IN_FLIGHT")? {
            config.processing.max_in_flight = v;
        }
        if let Some(v) = env_parse("MAXBOT_ORDERED_BY")? {
            config.processing.ordered_by = v;
        }
        if let Some(v) = env_parse("MAXBOT_HANDLER_TIMEOUT_MS")? {
            config.processing.handler_timeout_ms = Some(v);
        }
        if let Some(v) = env_parse("MAXBOT_GRACEFUL_SHUTDOWN_MS")? {
            config.processing.graceful_shutdown_ms = Some(v);
        }
        if let Some(v) = env_parse("MAXBOT_FSM_STRATEGY")? {
            config.fsm_strategy = v;
        }
        if let Some(v) = env_parse("MAXBOT_POLL_LIMIT")? {
            config.polling.limit = v;
        }
        if let Some(v) = env_parse("MAXBOT_POLL_TIMEOUT_SECONDS")? {
            config.polling.timeout_seconds = v;
        }
        if let Some(v) = env_parse("MAXBOT_DROP_PENDING_UPDATES")? {
            config.polling.drop_pending_updates = v;
        }
        if let Some(v) = env_parse("MAXBOT_RECOVER_ERRORS")? {
            config.polling.recover_errors = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MaxbotError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}
