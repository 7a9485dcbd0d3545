//! Fixed-window rate limiting per key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use maxbot_core::{MaxbotError, Result};
use maxbot_router::{middleware, Context, HandlerFuture, Middleware};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::IntoMiddleware;

type KeyFn = Arc<dyn Fn(&Context) -> String + Send + Sync>;
type LimitedFn = Arc<dyn Fn(Context, Duration) -> HandlerFuture + Send + Sync>;

/// `limit` calls per `interval` for each key. The key defaults to the chat id,
/// or `"global"` for updates without a chat.
#[derive(Clone)]
pub struct ThrottleOptions {
    pub limit: u32,
    pub interval: Duration,
    key: Option<KeyFn>,
    on_limited: Option<LimitedFn>,
}

impl ThrottleOptions {
    pub fn new(limit: u32, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            key: None,
            on_limited: None,
        }
    }

    pub fn key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.key = Some(Arc::new(f));
        self
    }

    /// Called with the time left in the window when an update is dropped.
    pub fn on_limited<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_limited = Some(Arc::new(move |ctx: Context, retry_after: Duration| -> HandlerFuture {
            Box::pin(f(ctx, retry_after))
        }));
        self
    }
}

impl std::fmt::Debug for ThrottleOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleOptions")
            .field("limit", &self.limit)
            .field("interval", &self.interval)
            .field("custom_key", &self.key.is_some())
            .field("on_limited", &self.on_limited.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Drops updates past the limit instead of running the rest of the chain.
#[derive(Clone, Debug)]
pub struct ThrottleMiddleware {
    options: ThrottleOptions,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl ThrottleMiddleware {
    pub fn new(options: ThrottleOptions) -> Result<Self> {
        if options.limit == 0 {
            return Err(MaxbotError::Config("throttle limit must be > 0".to_string()));
        }
        if options.interval.is_zero() {
            return Err(MaxbotError::Config(
                "throttle interval must be > 0".to_string(),
            ));
        }
        Ok(Self {
            options,
            windows: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn key_for(&self, ctx: &Context) -> String {
        match &self.options.key {
            Some(key) => key(ctx),
            None => ctx.chat_id().unwrap_or("global").to_string(),
        }
    }

    /// Counts one call for `key`. Returns the time left in the window when the
    /// call is over the limit.
    async fn admit(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now,
        });
        if window.reset_at <= now {
            window.count = 1;
            window.reset_at = now + self.options.interval;
            return None;
        }
        if window.count < self.options.limit {
            window.count += 1;
            None
        } else {
            Some(window.reset_at - now)
        }
    }
}

impl IntoMiddleware for ThrottleMiddleware {
    fn into_middleware(self) -> Middleware {
        middleware(move |ctx, next| {
            let throttle = self.clone();
            async move {
                let key = throttle.key_for(&ctx);
                let Some(retry_after) = throttle.admit(&key).await else {
                    return next(ctx).await;
                };
                debug!(
                    key = %key,
                    update_id = ctx.update_id(),
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Update throttled"
                );
                match &throttle.options.on_limited {
                    Some(on_limited) => on_limited(ctx, retry_after).await,
                    None => Ok(()),
                }
            }
        })
    }
}
