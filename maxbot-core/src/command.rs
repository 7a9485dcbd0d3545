//! Slash-command parsing: `/name[@mention] args...`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedCommand {
    /// Lower-cased command name without the leading slash.
    pub name: String,
    /// Lower-cased `@botname` suffix, if present.
    pub mention: Option<String>,
    pub args_text: String,
    pub args: Vec<String>,
}

/// Parses a command out of message text. Returns `None` unless the trimmed text
/// starts with `/` and carries a non-empty name.
pub fn parse(text: &str) -> Option<ParsedCommand> {
    let rest = text.trim().strip_prefix('/')?.trim_start();
    let (token, args_text) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };

    let (name, mention) = match token.split_once('@') {
        Some((name, mention)) => (name, Some(mention)),
        None => (token, None),
    };
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return None;
    }
    let mention = mention
        .map(|m| m.trim().to_lowercase())
        .filter(|m| !m.is_empty());

    Some(ParsedCommand {
        name,
        mention,
        args_text: args_text.to_string(),
        args: args_text.split_whitespace().map(String::from).collect(),
    })
}

/// Normalizes a user-supplied command name: trims, drops one leading `/`, lower-cases.
pub fn normalize(command: &str) -> String {
    let trimmed = command.trim();
    trimmed
        .strip_prefix('/')
        .unwrap_or(trimmed)
        .trim()
        .to_lowercase()
}

/// Normalizes a bot username for mention comparison: trims, drops one leading `@`, lower-cases.
pub fn normalize_mention(username: &str) -> String {
    let trimmed = username.trim();
    trimmed
        .strip_prefix('@')
        .unwrap_or(trimmed)
        .trim()
        .to_lowercase()
}
