use tokio::time::Instant;
use tracing::{debug, error, info};

use maxbot_router::{middleware, Middleware};

use crate::IntoMiddleware;

/// Logs each update on the way in and its outcome, with elapsed time, on the way out.
/// Errors are logged and passed on unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl IntoMiddleware for LoggingMiddleware {
    fn into_middleware(self) -> Middleware {
        middleware(|ctx, next| async move {
            let started = Instant::now();
            let update_id = ctx.update_id();
            info!(
                update_id,
                update_type = %ctx.update_type(),
                chat_id = ?ctx.chat_id(),
                user_id = ?ctx.user_id(),
                message_content = %ctx.message_text(),
                "Received update"
            );

            let result = next(ctx).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => debug!(update_id, elapsed_ms, "Processed update"),
                Err(e) => error!(update_id, elapsed_ms, error = %e, "Update failed"),
            }
            result
        })
    }
}
