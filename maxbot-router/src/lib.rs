//! # maxbot-router
//!
//! Per-update [`Context`], composable [`filters`], the [`Router`] tree and the
//! [`SceneManager`] for multi-step conversations.

pub mod context;
pub mod filters;
pub mod handler;
pub mod router;
pub mod scenes;

pub use context::{Context, Meta, ReplyOptions};
pub use filters::{Filter, FilterOutcome};
pub use handler::{chain, handler, middleware, ErrorHandler, Handler, HandlerFuture, Middleware};
pub use router::{Observer, Router};
pub use scenes::{
    scene_handler, EnterOptions, SceneCursor, SceneHandler, SceneHooks, SceneManager,
    SceneSession, SCENE_STATE_PREFIX,
};
