//! # maxbot-middleware
//!
//! Stock middleware for [`maxbot_router::Router::use_middleware`].
//!
//! ```ignore
//! router
//!     .use_middleware(LoggingMiddleware.into_middleware())
//!     .use_middleware(AuthMiddleware::new(["42"]).into_middleware());
//! ```

mod auth;
mod logging;
mod throttle;

pub use auth::AuthMiddleware;
pub use logging::LoggingMiddleware;
pub use throttle::{ThrottleMiddleware, ThrottleOptions};

use maxbot_router::Middleware;

/// Converts a middleware value into the router's [`Middleware`] transform.
pub trait IntoMiddleware {
    fn into_middleware(self) -> Middleware;
}

#[cfg(test)]
mod test;
