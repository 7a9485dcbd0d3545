//! Composable filters over [`Context`].
//!
//! A filter resolves to a [`FilterOutcome`]: reject, accept, or accept while
//! contributing metadata that the router merges into the scoped context.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use maxbot_core::{command, CallbackData, Result, StateGroup, UpdateType};
use regex::Regex;
use serde_json::Value;

use crate::context::{Context, Meta};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Reject,
    Accept,
    AcceptWith(Meta),
}

impl FilterOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, FilterOutcome::Reject)
    }

    /// Accept with a single metadata entry.
    pub fn with(key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut meta = Meta::new();
        meta.insert(key.into(), value.into());
        FilterOutcome::AcceptWith(meta)
    }
}

impl From<bool> for FilterOutcome {
    fn from(accepted: bool) -> Self {
        if accepted {
            FilterOutcome::Accept
        } else {
            FilterOutcome::Reject
        }
    }
}

pub type FilterFuture = BoxFuture<'static, Result<FilterOutcome>>;

#[derive(Clone)]
pub struct Filter {
    check: Arc<dyn Fn(Context) -> FilterFuture + Send + Sync>,
}

impl Filter {
    /// Async filter; may touch session storage.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<FilterOutcome>> + Send + 'static,
    {
        Self {
            check: Arc::new(move |ctx: Context| -> FilterFuture { Box::pin(f(ctx)) }),
        }
    }

    /// Synchronous filter producing a full outcome.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Context) -> FilterOutcome + Send + Sync + 'static,
    {
        Self::new(move |ctx| futures::future::ok(f(&ctx)))
    }

    /// Synchronous boolean predicate.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self::from_fn(move |ctx| f(ctx).into())
    }

    pub async fn check(&self, ctx: &Context) -> Result<FilterOutcome> {
        (self.check)(ctx.clone()).await
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Filter")
    }
}

/// Evaluates filters in order. Metadata of each accepting filter is merged into
/// `ctx` as it passes, and stays there even if a later filter rejects.
pub(crate) async fn run_all(filters: &[Filter], ctx: &Context) -> Result<bool> {
    for filter in filters {
        match filter.check(ctx).await? {
            FilterOutcome::Reject => return Ok(false),
            FilterOutcome::Accept => {}
            FilterOutcome::AcceptWith(meta) => ctx.set_meta_many(meta),
        }
    }
    Ok(true)
}

/// All filters must accept. Metadata from accepting members is applied to the
/// context immediately and is not rolled back when a later member rejects.
pub fn and(filters: impl IntoIterator<Item = Filter>) -> Filter {
    let filters: Arc<[Filter]> = filters.into_iter().collect();
    Filter::new(move |ctx| all_of(filters.clone(), ctx))
}

async fn all_of(filters: Arc<[Filter]>, ctx: Context) -> Result<FilterOutcome> {
    Ok(run_all(&filters, &ctx).await?.into())
}

/// First accepting filter wins; its outcome (with metadata) is returned as is.
pub fn or(filters: impl IntoIterator<Item = Filter>) -> Filter {
    let filters: Arc<[Filter]> = filters.into_iter().collect();
    Filter::new(move |ctx| any_of(filters.clone(), ctx))
}

async fn any_of(filters: Arc<[Filter]>, ctx: Context) -> Result<FilterOutcome> {
    for filter in filters.iter() {
        let outcome = filter.check(&ctx).await?;
        if outcome.is_accepted() {
            return Ok(outcome);
        }
    }
    Ok(FilterOutcome::Reject)
}

/// Inverts a filter, discarding any metadata it produced.
pub fn not(filter: Filter) -> Filter {
    Filter::new(move |ctx| negate(filter.clone(), ctx))
}

async fn negate(filter: Filter, ctx: Context) -> Result<FilterOutcome> {
    Ok((!filter.check(&ctx).await?.is_accepted()).into())
}

pub fn command(name: &str) -> Filter {
    let wanted = command::normalize(name);
    Filter::predicate(move |ctx| {
        !wanted.is_empty() && ctx.command().as_deref() == Some(wanted.as_str())
    })
}

pub fn command_any<I, S>(names: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let wanted: Vec<String> = names
        .into_iter()
        .map(|n| command::normalize(n.as_ref()))
        .filter(|n| !n.is_empty())
        .collect();
    Filter::predicate(move |ctx| {
        ctx.command()
            .map_or(false, |name| wanted.iter().any(|w| *w == name))
    })
}

/// Command addressed to `username` (or unaddressed, when allowed).
pub fn command_for(name: &str, username: &str, allow_without_mention: bool) -> Filter {
    let wanted = command::normalize(name);
    let username = username.to_string();
    Filter::predicate(move |ctx| {
        !wanted.is_empty()
            && ctx.command().as_deref() == Some(wanted.as_str())
            && ctx.is_command_for(&username, allow_without_mention)
    })
}

/// Like [`command`], storing the parsed command under `meta_key`.
pub fn command_match(name: &str, meta_key: &str) -> Filter {
    let wanted = command::normalize(name);
    let meta_key = meta_key.to_string();
    Filter::from_fn(move |ctx| match ctx.command_info() {
        Some(info) if !wanted.is_empty() && info.name == wanted => {
            match serde_json::to_value(&info) {
                Ok(value) => FilterOutcome::with(meta_key.clone(), value),
                Err(_) => FilterOutcome::Reject,
            }
        }
        _ => FilterOutcome::Reject,
    })
}

/// A message with non-empty text.
pub fn text() -> Filter {
    Filter::predicate(|ctx| ctx.message().is_some() && !ctx.message_text().is_empty())
}

pub fn text_equals(expected: &str) -> Filter {
    let expected = expected.trim().to_string();
    Filter::predicate(move |ctx| ctx.message().is_some() && ctx.message_text() == expected)
}

pub fn regex(pattern: Regex) -> Filter {
    Filter::predicate(move |ctx| ctx.message().is_some() && pattern.is_match(ctx.message_text()))
}

/// Regex over message text; on match stores the capture groups (index 0 is the
/// whole match, unmatched groups are null) under `meta_key`.
pub fn regex_match(pattern: Regex, meta_key: &str) -> Filter {
    let meta_key = meta_key.to_string();
    Filter::from_fn(move |ctx| {
        if ctx.message().is_none() {
            return FilterOutcome::Reject;
        }
        match captures_value(&pattern, ctx.message_text()) {
            Some(value) => FilterOutcome::with(meta_key.clone(), value),
            None => FilterOutcome::Reject,
        }
    })
}

fn captures_value(pattern: &Regex, haystack: &str) -> Option<Value> {
    let captures = pattern.captures(haystack)?;
    Some(Value::Array(
        captures
            .iter()
            .map(|m| m.map_or(Value::Null, |m| Value::String(m.as_str().to_string())))
            .collect(),
    ))
}

pub fn callback_data_equals(expected: &str) -> Filter {
    let expected = expected.trim().to_string();
    Filter::predicate(move |ctx| ctx.callback_query().is_some() && ctx.callback_data() == expected)
}

pub fn callback_data_starts_with(prefix: &str) -> Filter {
    let prefix = prefix.to_string();
    Filter::predicate(move |ctx| {
        ctx.callback_query().is_some() && ctx.callback_data().starts_with(&prefix)
    })
}

pub fn callback_data_regex(pattern: Regex) -> Filter {
    Filter::predicate(move |ctx| {
        ctx.callback_query().is_some() && pattern.is_match(ctx.callback_data())
    })
}

pub fn callback_data_match(pattern: Regex, meta_key: &str) -> Filter {
    let meta_key = meta_key.to_string();
    Filter::from_fn(move |ctx| {
        if ctx.callback_query().is_none() {
            return FilterOutcome::Reject;
        }
        match captures_value(&pattern, ctx.callback_data()) {
            Some(value) => FilterOutcome::with(meta_key.clone(), value),
            None => FilterOutcome::Reject,
        }
    })
}

/// Accepts callbacks whose data unpacks with `codec` and carries every
/// `expected` field. The decoded fields are stored under `meta_key`.
pub fn callback_fields<I, K, V>(codec: &CallbackData, expected: I, meta_key: &str) -> Filter
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let codec = codec.clone();
    let expected: Vec<(String, String)> = expected
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect();
    let meta_key = meta_key.to_string();
    Filter::from_fn(move |ctx| {
        if ctx.callback_query().is_none() {
            return FilterOutcome::Reject;
        }
        let Some(fields) = codec.unpack(ctx.callback_data()) else {
            return FilterOutcome::Reject;
        };
        let matches = expected
            .iter()
            .all(|(k, v)| fields.get(k).map_or(false, |actual| actual == v));
        if !matches {
            return FilterOutcome::Reject;
        }
        let value: serde_json::Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        FilterOutcome::with(meta_key.clone(), value)
    })
}

fn owned_set<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

pub fn chat_id<I, S>(ids: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let ids = owned_set(ids);
    Filter::predicate(move |ctx| ctx.chat_id().map_or(false, |id| ids.iter().any(|w| w == id)))
}

pub fn user_id<I, S>(ids: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let ids = owned_set(ids);
    Filter::predicate(move |ctx| ctx.user_id().map_or(false, |id| ids.iter().any(|w| w == id)))
}

pub fn chat_type<I, S>(types: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let types: Vec<String> = owned_set(types).into_iter().map(|t| t.to_lowercase()).collect();
    Filter::predicate(move |ctx| {
        ctx.chat_type()
            .map_or(false, |t| types.iter().any(|w| w.eq_ignore_ascii_case(t)))
    })
}

pub fn update_type(kinds: impl IntoIterator<Item = UpdateType>) -> Filter {
    let kinds: Vec<UpdateType> = kinds.into_iter().collect();
    Filter::predicate(move |ctx| kinds.contains(&ctx.update_type()))
}

type StatePredicate = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Builds an async filter over the current FSM state.
fn state_filter<F>(f: F) -> Filter
where
    F: Fn(Option<&str>) -> bool + Send + Sync + 'static,
{
    let predicate: StatePredicate = Arc::new(f);
    Filter::new(move |ctx| check_state(predicate.clone(), ctx))
}

async fn check_state(predicate: StatePredicate, ctx: Context) -> Result<FilterOutcome> {
    let state = ctx.get_state().await?;
    Ok(predicate(state.as_deref()).into())
}

/// Exact state match. An empty `expected` matches "no state".
pub fn state(expected: &str) -> Filter {
    let expected = expected.to_string();
    state_filter(move |state| match state {
        Some(s) => s == expected,
        None => expected.is_empty(),
    })
}

pub fn state_in<I, S>(states: I) -> Filter
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let states: Vec<String> = states.into_iter().map(|s| s.as_ref().to_string()).collect();
    state_filter(move |state| state.map_or(false, |s| states.iter().any(|w| w == s)))
}

pub fn state_starts_with(prefix: &str) -> Filter {
    let prefix = prefix.to_string();
    state_filter(move |state| state.map_or(false, |s| s.starts_with(&prefix)))
}

pub fn state_regex(pattern: Regex) -> Filter {
    state_filter(move |state| state.map_or(false, |s| pattern.is_match(s)))
}

pub fn state_group(group: &StateGroup) -> Filter {
    let group = group.clone();
    state_filter(move |state| group.has(state))
}

pub fn meta_exists(key: &str) -> Filter {
    let key = key.to_string();
    Filter::predicate(move |ctx| ctx.has_meta(&key))
}

pub fn meta_equals(key: &str, expected: impl Into<Value>) -> Filter {
    let key = key.to_string();
    let expected = expected.into();
    Filter::predicate(move |ctx| ctx.meta(&key).as_ref() == Some(&expected))
}

/// Runs `predicate` on the metadata value (`None` when the key is absent).
pub fn meta_satisfies<F>(key: &str, predicate: F) -> Filter
where
    F: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
{
    let key = key.to_string();
    Filter::predicate(move |ctx| predicate(ctx.meta(&key).as_ref()))
}
