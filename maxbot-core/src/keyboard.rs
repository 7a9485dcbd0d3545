//! Inline keyboard markup and a row-by-row builder for it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl InlineKeyboardButton {
    /// Button sending `data` back as a callback query. Empty data is omitted.
    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        let data = data.into();
        Self {
            text: text.into(),
            callback_data: Some(data).filter(|d| !d.is_empty()),
            url: None,
        }
    }

    pub fn url(text: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            text: text.into(),
            callback_data: None,
            url: Some(url).filter(|u| !u.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

/// Collects buttons into the current row; [`InlineKeyboard::row`] starts a new one.
#[derive(Debug, Clone, Default)]
pub struct InlineKeyboard {
    rows: Vec<Vec<InlineKeyboardButton>>,
    current: Vec<InlineKeyboardButton>,
}

impl InlineKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn button(mut self, button: InlineKeyboardButton) -> Self {
        self.current.push(button);
        self
    }

    pub fn callback(self, text: impl Into<String>, data: impl Into<String>) -> Self {
        self.button(InlineKeyboardButton::callback(text, data))
    }

    pub fn url(self, text: impl Into<String>, url: impl Into<String>) -> Self {
        self.button(InlineKeyboardButton::url(text, url))
    }

    /// Closes the current row. Empty rows are never emitted.
    pub fn row(mut self) -> Self {
        if !self.current.is_empty() {
            self.rows.push(std::mem::take(&mut self.current));
        }
        self
    }

    /// A keyboard without buttons builds as a single empty row.
    pub fn build(self) -> InlineKeyboardMarkup {
        let mut rows = self.row().rows;
        if rows.is_empty() {
            rows.push(Vec::new());
        }
        InlineKeyboardMarkup {
            inline_keyboard: rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builds_rows() {
        let markup = InlineKeyboard::new()
            .callback("Yes", "yes")
            .callback("No", "no")
            .row()
            .row()
            .url("Docs", "https://example.com/docs")
            .build();

        assert_eq!(
            serde_json::to_value(&markup).unwrap(),
            json!({
                "inline_keyboard": [
                    [
                        {"text": "Yes", "callback_data": "yes"},
                        {"text": "No", "callback_data": "no"}
                    ],
                    [{"text": "Docs", "url": "https://example.com/docs"}]
                ]
            })
        );
    }

    #[test]
    fn test_empty_keyboard_has_one_empty_row() {
        let markup = InlineKeyboard::new().build();
        assert_eq!(markup.inline_keyboard, vec![Vec::<InlineKeyboardButton>::new()]);
    }

    #[test]
    fn test_empty_callback_data_is_omitted() {
        let button = InlineKeyboardButton::callback("Noop", "");
        assert_eq!(serde_json::to_value(&button).unwrap(), json!({"text": "Noop"}));
    }
}
