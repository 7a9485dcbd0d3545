//! Named FSM states sharing a prefix, encoded as `prefix:name`.

use crate::error::{MaxbotError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateGroup {
    prefix: String,
    states: Vec<(String, String)>,
}

impl StateGroup {
    /// Fails on an empty prefix, an empty name, or no names at all.
    pub fn new<I, S>(prefix: &str, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() {
            return Err(MaxbotError::Config(
                "state group prefix must not be empty".to_string(),
            ));
        }

        let mut states = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(MaxbotError::Config(format!(
                    "state group '{}' contains an empty state name",
                    prefix
                )));
            }
            let value = format!("{}:{}", prefix, name.to_lowercase());
            states.push((name.to_string(), value));
        }
        if states.is_empty() {
            return Err(MaxbotError::Config(format!(
                "state group '{}' needs at least one state",
                prefix
            )));
        }

        Ok(Self { prefix, states })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Encoded state for `name`, matched case-insensitively.
    pub fn state(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        self.states
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|(_, v)| v.as_str())
    }

    /// True when `value` is one of this group's states.
    pub fn has(&self, value: Option<&str>) -> bool {
        value.map_or(false, |v| self.states().any(|s| s == v))
    }

    /// True when `value` is exactly the state called `name`.
    pub fn is(&self, value: Option<&str>, name: &str) -> bool {
        match (value, self.state(name)) {
            (Some(v), Some(s)) => v == s,
            _ => false,
        }
    }
}
