//! Framework-neutral webhook adapter: validates an incoming HTTP request and
//! feeds the update to a [`Dispatcher`]. Plug [`WebhookHandler::handle`] into
//! any server; [`WebhookHandler::handle_request`] covers `http` crate types.

use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};
use maxbot_core::{MaxbotError, Update};
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::dispatcher::Dispatcher;

pub const DEFAULT_WEBHOOK_PATH: &str = "/webhook";
pub const DEFAULT_SECRET_HEADER: &str = "x-max-bot-secret-token";

pub type WebhookErrorHandler = Arc<dyn Fn(MaxbotError, Update) + Send + Sync>;

/// When the response is sent relative to dispatch.
#[derive(Clone, Default)]
pub enum WebhookMode {
    /// Respond after the update is handled; dispatch errors give 500.
    #[default]
    Sync,
    /// Acknowledge at once and handle the update on a spawned task.
    Background { on_error: WebhookErrorHandler },
}

impl WebhookMode {
    pub fn background<F>(on_error: F) -> Self
    where
        F: Fn(MaxbotError, Update) + Send + Sync + 'static,
    {
        WebhookMode::Background {
            on_error: Arc::new(on_error),
        }
    }
}

impl std::fmt::Debug for WebhookMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookMode::Sync => f.write_str("Sync"),
            WebhookMode::Background { .. } => f.write_str("Background"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookOptions {
    pub path: String,
    /// Expected value of `secret_header`; `None` skips the check.
    pub secret_token: Option<String>,
    pub secret_header: String,
    pub mode: WebhookMode,
}

impl Default for WebhookOptions {
    fn default() -> Self {
        Self {
            path: DEFAULT_WEBHOOK_PATH.to_string(),
            secret_token: None,
            secret_header: DEFAULT_SECRET_HEADER.to_string(),
            mode: WebhookMode::Sync,
        }
    }
}

impl WebhookOptions {
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn secret_token(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }

    pub fn secret_header(mut self, header: impl Into<String>) -> Self {
        self.secret_header = header.into();
        self
    }

    pub fn mode(mut self, mode: WebhookMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Leading slash added, trailing slashes dropped; empty means `/`.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl WebhookResponse {
    fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: json!({ "ok": true }),
        }
    }

    fn error(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookHandler {
    dispatcher: Dispatcher,
    path: String,
    secret_token: Option<String>,
    secret_header: String,
    mode: WebhookMode,
}

impl WebhookHandler {
    pub fn new(dispatcher: Dispatcher, options: WebhookOptions) -> Self {
        Self {
            dispatcher,
            path: normalize_path(&options.path),
            secret_token: options.secret_token.filter(|t| !t.is_empty()),
            secret_header: options.secret_header.to_ascii_lowercase(),
            mode: options.mode,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.secret_token else {
            return true;
        };
        headers
            .get(self.secret_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map_or(false, |got| got == expected)
    }

    /// Checks path, method, secret and payload in that order, then dispatches.
    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> WebhookResponse {
        // Query strings are not part of the route.
        let route = path.split('?').next().unwrap_or_default();
        if normalize_path(route) != self.path {
            return WebhookResponse::error(StatusCode::NOT_FOUND, "not found");
        }
        if method != Method::POST {
            return WebhookResponse::error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        if !self.authorized(headers) {
            warn!(path = %self.path, "step: webhook secret mismatch");
            return WebhookResponse::error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
        let update: Update = match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "step: webhook payload rejected");
                return WebhookResponse::error(StatusCode::BAD_REQUEST, "invalid update payload");
            }
        };
        debug!(update_id = update.update_id, "step: webhook update received");

        match &self.mode {
            WebhookMode::Sync => match self.dispatcher.handle_update(update).await {
                Ok(_) => WebhookResponse::ok(),
                Err(e) => {
                    error!(error = %e, "step: webhook dispatch failed");
                    WebhookResponse::error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to dispatch update",
                    )
                }
            },
            WebhookMode::Background { on_error } => {
                let on_error = on_error.clone();
                let dispatch = self.dispatcher.handle_update(update.clone());
                tokio::spawn(async move {
                    if let Err(e) = dispatch.await {
                        error!(error = %e, update_id = update.update_id, "step: background dispatch failed");
                        on_error(e, update);
                    }
                });
                WebhookResponse::ok()
            }
        }
    }

    /// [`WebhookHandler::handle`] over `http` request/response types. The body
    /// is serialized JSON.
    pub async fn handle_request(&self, request: http::Request<Vec<u8>>) -> http::Response<String> {
        let (parts, body) = request.into_parts();
        let response = self
            .handle(&parts.method, parts.uri.path(), &parts.headers, &body)
            .await;
        let mut out = http::Response::new(response.body.to_string());
        *out.status_mut() = response.status;
        out.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/webhook"), "/webhook");
        assert_eq!(normalize_path("webhook/"), "/webhook");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_default_options() {
        let options = WebhookOptions::default();
        assert_eq!(options.path, DEFAULT_WEBHOOK_PATH);
        assert_eq!(options.secret_header, DEFAULT_SECRET_HEADER);
        assert!(options.secret_token.is_none());
        assert!(matches!(options.mode, WebhookMode::Sync));
    }
}
