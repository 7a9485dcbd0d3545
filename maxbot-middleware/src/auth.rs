use std::collections::HashSet;
use std::sync::Arc;

use maxbot_core::HandlerError;
use maxbot_router::{middleware, Middleware};
use tracing::{error, info};

use crate::IntoMiddleware;

/// Lets through only updates from allowlisted user ids; everything else fails
/// with [`HandlerError::Unauthorized`]. Updates without a user are rejected.
#[derive(Debug, Clone)]
pub struct AuthMiddleware {
    allowed_users: Arc<HashSet<String>>,
}

impl AuthMiddleware {
    pub fn new<I, S>(allowed_users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_users: Arc::new(allowed_users.into_iter().map(Into::into).collect()),
        }
    }

    pub fn is_allowed(&self, user_id: Option<&str>) -> bool {
        user_id.map_or(false, |id| self.allowed_users.contains(id))
    }
}

impl IntoMiddleware for AuthMiddleware {
    fn into_middleware(self) -> Middleware {
        middleware(move |ctx, next| {
            let auth = self.clone();
            async move {
                let user_id = ctx.user_id().map(String::from);
                if auth.is_allowed(user_id.as_deref()) {
                    info!(user_id = ?user_id, "User authorized");
                    next(ctx).await
                } else {
                    error!(user_id = ?user_id, update_id = ctx.update_id(), "Unauthorized access attempt");
                    Err(HandlerError::Unauthorized.into())
                }
            }
        })
    }
}
