//! Compact `prefix:key=value:...` payloads for callback buttons.
//!
//! Prefix, keys and values are percent-encoded, so `:` and `=` inside them
//! survive a round trip.

use std::collections::BTreeMap;

/// Decoded callback payload fields.
pub type CallbackFields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    prefix: String,
}

impl CallbackData {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: urlencoding::encode(prefix.trim()).into_owned(),
        }
    }

    /// The encoded prefix every packed payload starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pack<I, K, V>(&self, fields: I) -> String
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        let mut parts = vec![self.prefix.clone()];
        parts.extend(fields.into_iter().map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key.as_ref()),
                urlencoding::encode(&value.to_string())
            )
        }));
        parts.join(":")
    }

    /// Fields of `raw`, or `None` when it carries another prefix or is not
    /// valid percent-encoding. Parts without a key are ignored; a repeated key
    /// keeps its last value.
    pub fn unpack(&self, raw: &str) -> Option<CallbackFields> {
        let mut parts = raw.split(':');
        if parts.next() != Some(self.prefix.as_str()) {
            return None;
        }
        let mut fields = CallbackFields::new();
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            let key = urlencoding::decode(key).ok()?;
            let value = urlencoding::decode(value).ok()?;
            fields.insert(key.into_owned(), value.into_owned());
        }
        Some(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let todo = CallbackData::new(" todo ");
        let raw = todo.pack([("action", "open"), ("id", "42"), ("note", "a:b=c d")]);
        assert_eq!(raw, "todo:action=open:id=42:note=a%3Ab%3Dc%20d");

        let fields = todo.unpack(&raw).unwrap();
        assert_eq!(fields["action"], "open");
        assert_eq!(fields["id"], "42");
        assert_eq!(fields["note"], "a:b=c d");
    }

    #[test]
    fn test_pack_accepts_non_string_values() {
        let todo = CallbackData::new("todo");
        assert_eq!(todo.pack([("id", 7), ("page", 2)]), "todo:id=7:page=2");
    }

    #[test]
    fn test_unpack_rejects_other_prefix() {
        let todo = CallbackData::new("todo");
        assert_eq!(todo.unpack("note:id=1"), None);
        assert_eq!(todo.unpack(""), None);
        assert_eq!(todo.unpack("todo:id=%FF"), None);
    }

    #[test]
    fn test_unpack_skips_parts_without_key() {
        let todo = CallbackData::new("todo");
        let fields = todo.unpack("todo:=x:flag:id=3:id=4").unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["id"], "4");
    }
}
