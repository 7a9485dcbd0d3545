use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    AnswerCallbackQueryRequest, EditMessageTextRequest, GetUpdatesRequest, SendMessageRequest,
    UpdateBatch,
};

/// Transport contract used by the dispatcher and by `Context` reply helpers.
///
/// Implementations report retryable failures through [`crate::MaxbotError::is_retryable`].
/// Cancellation is cooperative: callers drop the returned future.
#[async_trait]
pub trait Bot: Send + Sync {
    async fn get_updates(&self, request: &GetUpdatesRequest) -> Result<UpdateBatch>;

    async fn send_message(&self, request: &SendMessageRequest) -> Result<()>;

    async fn edit_message_text(&self, request: &EditMessageTextRequest) -> Result<()>;

    async fn answer_callback_query(&self, request: &AnswerCallbackQueryRequest) -> Result<()>;
}
