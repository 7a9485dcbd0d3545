//! reqwest-backed [`Bot`] implementation for the platform REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::bot::Bot;
use crate::config::ClientConfig;
use crate::error::{is_retryable_status, MaxbotError, Result};
use crate::types::{
    AnswerCallbackQueryRequest, EditMessageTextRequest, GetUpdatesRequest, SendMessageRequest,
    Update, UpdateBatch,
};

/// `GET /updates` answers either a bare array or an object wrapping it. Entries
/// stay raw so one malformed update cannot fail the whole batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum UpdatesEnvelope {
    List(Vec<Value>),
    Wrapped { updates: Vec<Value> },
}

/// Decodes each entry on its own. Undecodable entries that still carry an
/// `update_id` are reported as skipped; the rest are dropped.
fn decode_batch(entries: Vec<Value>) -> UpdateBatch {
    let mut batch = UpdateBatch::default();
    for entry in entries {
        let update_id = entry.get("update_id").and_then(Value::as_i64);
        match serde_json::from_value::<Update>(entry) {
            Ok(update) => batch.updates.push(update),
            Err(e) => {
                warn!(?update_id, error = %e, "Skipping undecodable update");
                if let Some(id) = update_id {
                    batch.skipped.push(id);
                }
            }
        }
    }
    batch
}

pub struct HttpBot {
    client: reqwest::Client,
    config: ClientConfig,
    next_slot: Mutex<Option<Instant>>,
}

impl HttpBot {
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            next_slot: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Waits until the client-side rate limit allows another request.
    async fn wait_for_slot(&self) {
        let Some(interval) = self.config.min_request_interval() else {
            return;
        };
        let wait_until = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + interval);
            slot
        };
        tokio::time::sleep_until(wait_until).await;
    }

    /// Sends one logical request, retrying retryable failures with backoff.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<String> {
        let url = self.url(path);
        let mut attempt = 0u32;
        loop {
            self.wait_for_slot().await;

            let mut builder = self
                .client
                .request(method.clone(), &url)
                .header(AUTHORIZATION, &self.config.token)
                .header(ACCEPT, "application/json");
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let error = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(&response);
                    let text = response.text().await?;
                    if status.is_success() {
                        return Ok(text);
                    }
                    api_error(status, &text, retry_after)
                }
                Err(e) => MaxbotError::Http(e),
            };

            if attempt >= self.config.max_retries || !error.is_retryable() {
                return Err(error);
            }
            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.config.backoff(attempt));
            warn!(
                path = %path,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn api_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> MaxbotError {
    let payload: Option<Value> = serde_json::from_str(body).ok();
    let field = |name: &str| {
        payload
            .as_ref()
            .and_then(|p| p.get(name))
            .and_then(Value::as_str)
            .map(String::from)
    };
    let message = field("message")
        .or_else(|| field("description"))
        .or_else(|| field("error"))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    let retry_after = retry_after.filter(|_| is_retryable_status(status.as_u16()));
    MaxbotError::Api {
        status: status.as_u16(),
        code: field("code"),
        message,
        retry_after,
    }
}

#[async_trait]
impl Bot for HttpBot {
    #[instrument(skip(self))]
    async fn get_updates(&self, request: &GetUpdatesRequest) -> Result<UpdateBatch> {
        let query = [
            ("offset", request.offset.to_string()),
            ("limit", request.limit.to_string()),
            ("timeout", request.timeout.to_string()),
        ];
        let body = self.request(Method::GET, "/updates", &query, None).await?;
        let envelope: UpdatesEnvelope = serde_json::from_str(&body)?;
        let entries = match envelope {
            UpdatesEnvelope::List(entries) | UpdatesEnvelope::Wrapped { updates: entries } => entries,
        };
        let batch = decode_batch(entries);
        debug!(
            count = batch.updates.len(),
            skipped = batch.skipped.len(),
            "Fetched updates"
        );
        Ok(batch)
    }

    #[instrument(skip(self, request), fields(chat_id = %request.chat_id))]
    async fn send_message(&self, request: &SendMessageRequest) -> Result<()> {
        let body = serde_json::to_value(request)?;
        self.request(Method::POST, "/messages", &[], Some(body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(chat_id = %request.chat_id, message_id = %request.message_id))]
    async fn edit_message_text(&self, request: &EditMessageTextRequest) -> Result<()> {
        let body = serde_json::to_value(request)?;
        self.request(Method::PATCH, "/messages", &[], Some(body))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(callback_id = %request.callback_id))]
    async fn answer_callback_query(&self, request: &AnswerCallbackQueryRequest) -> Result<()> {
        let body = serde_json::to_value(request)?;
        self.request(Method::POST, "/callbacks/answer", &[], Some(body))
            .await?;
        Ok(())
    }
}
