//! # Scenes and wizards
//!
//! Multi-step conversations stored in the FSM state as `__scene:<id>:<step>`. A
//! scene has one handler; a wizard has an ordered list of step handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use maxbot_core::{FsmData, MaxbotError, Result};
use tracing::{debug, info};

use crate::context::Context;
use crate::filters;
use crate::handler::HandlerFuture;
use crate::router::Router;

pub const SCENE_STATE_PREFIX: &str = "__scene:";

pub type SceneHandler = Arc<dyn Fn(Context, SceneSession) -> HandlerFuture + Send + Sync>;

/// Boxes an async closure into a [`SceneHandler`].
pub fn scene_handler<F, Fut>(f: F) -> SceneHandler
where
    F: Fn(Context, SceneSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: Context, session: SceneSession| -> HandlerFuture {
        Box::pin(f(ctx, session))
    })
}

/// Optional enter/leave hooks.
#[derive(Clone, Default)]
pub struct SceneHooks {
    enter: Option<SceneHandler>,
    leave: Option<SceneHandler>,
}

impl SceneHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enter<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, SceneSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.enter = Some(scene_handler(f));
        self
    }

    pub fn on_leave<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Context, SceneSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.leave = Some(scene_handler(f));
        self
    }
}

enum SceneBody {
    Single(SceneHandler),
    Wizard(Vec<SceneHandler>),
}

struct Scene {
    body: SceneBody,
    hooks: SceneHooks,
}

/// Decoded scene position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneCursor {
    pub id: String,
    pub step: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EnterOptions {
    pub step: usize,
    /// Shallow-merged into session data on entry.
    pub data: Option<FsmData>,
    /// Clears session data before merging `data`.
    pub reset_data: bool,
}

impl From<usize> for EnterOptions {
    fn from(step: usize) -> Self {
        Self {
            step,
            ..Self::default()
        }
    }
}

fn normalize_id(id: &str) -> String {
    id.trim().to_lowercase()
}

pub fn encode_state(id: &str, step: usize) -> String {
    format!("{}{}:{}", SCENE_STATE_PREFIX, id, step)
}

/// Parses a scene state. Non-scene states yield `None`; a malformed step reads as 0.
pub fn decode_state(raw: Option<&str>) -> Option<SceneCursor> {
    let payload = raw?.strip_prefix(SCENE_STATE_PREFIX)?;
    let mut parts = payload.splitn(3, ':');
    let id = normalize_id(parts.next().unwrap_or_default());
    if id.is_empty() {
        return None;
    }
    let step = parts
        .next()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(|s| s.floor() as usize)
        .unwrap_or(0);
    Some(SceneCursor { id, step })
}

/// Handle given to scene handlers for moving through the scene.
#[derive(Clone)]
pub struct SceneSession {
    ctx: Context,
    id: String,
    step: usize,
}

impl SceneSession {
    fn new(ctx: &Context, id: &str, step: usize) -> Self {
        Self {
            ctx: ctx.clone(),
            id: id.to_string(),
            step,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub async fn next(&self) -> Result<()> {
        self.goto(self.step.saturating_add(1)).await
    }

    /// Previous step, never below 0.
    pub async fn back(&self) -> Result<()> {
        self.goto(self.step.saturating_sub(1)).await
    }

    pub async fn goto(&self, step: usize) -> Result<()> {
        self.ctx.set_state(&encode_state(&self.id, step)).await
    }

    /// Clears the FSM state. Leave hooks are not run here; use
    /// [`SceneManager::leave`] for that.
    pub async fn leave(&self) -> Result<()> {
        self.ctx.clear_state().await
    }

    pub async fn get_data(&self) -> Result<FsmData> {
        self.ctx.get_data().await
    }

    pub async fn set_data(&self, data: FsmData) -> Result<()> {
        self.ctx.set_data(data).await
    }

    pub async fn update_data(&self, patch: FsmData) -> Result<FsmData> {
        self.ctx.update_data(patch).await
    }

    pub async fn clear_data(&self) -> Result<()> {
        self.ctx.clear_data().await
    }
}

/// Registry of scenes. Clones share the same registry.
#[derive(Clone, Default)]
pub struct SceneManager {
    scenes: Arc<RwLock<HashMap<String, Arc<Scene>>>>,
    mounted: Arc<AtomicBool>,
}

impl SceneManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: &str, scene: Scene) -> Result<()> {
        let id = normalize_id(id);
        if id.is_empty() {
            return Err(MaxbotError::Config("scene id must not be empty".to_string()));
        }
        debug!(scene = %id, "Scene registered");
        self.scenes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(scene));
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Arc<Scene>> {
        self.scenes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn register_scene<F, Fut>(&self, id: &str, f: F, hooks: SceneHooks) -> Result<&Self>
    where
        F: Fn(Context, SceneSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.insert(
            id,
            Scene {
                body: SceneBody::Single(scene_handler(f)),
                hooks,
            },
        )?;
        Ok(self)
    }

    /// Registers a wizard; the step index addresses `steps`.
    pub fn register_wizard(
        &self,
        id: &str,
        steps: Vec<SceneHandler>,
        hooks: SceneHooks,
    ) -> Result<&Self> {
        if steps.is_empty() {
            return Err(MaxbotError::Config(format!(
                "wizard '{}' needs at least one step",
                id.trim()
            )));
        }
        self.insert(
            id,
            Scene {
                body: SceneBody::Wizard(steps),
                hooks,
            },
        )?;
        Ok(self)
    }

    /// Registers the scene catch-all on `router`, ahead of every other handler.
    /// Mounting a manager more than once does nothing.
    pub fn mount(&self, router: &Router) {
        if self.mounted.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        router.any_first_with(
            [filters::state_starts_with(SCENE_STATE_PREFIX)],
            move |ctx| {
                let manager = manager.clone();
                async move { manager.handle(&ctx).await.map(|_| ()) }
            },
        );
    }

    /// Enters scene `id`. An active scene's leave hook runs first; data is reset
    /// and/or merged, the state is written, then the target's enter hook runs.
    pub async fn enter(
        &self,
        ctx: &Context,
        id: &str,
        options: impl Into<EnterOptions>,
    ) -> Result<()> {
        let id = normalize_id(id);
        let target = self
            .get(&id)
            .ok_or_else(|| MaxbotError::SceneNotFound(id.clone()))?;
        let options = options.into();

        if let Some(previous) = self.current(ctx).await? {
            if let Some(leave) = self.get(&previous.id).and_then(|s| s.hooks.leave.clone()) {
                leave(ctx.clone(), SceneSession::new(ctx, &previous.id, previous.step)).await?;
            }
        }

        if options.reset_data {
            ctx.clear_data().await?;
        }
        if let Some(data) = options.data {
            ctx.update_data(data).await?;
        }

        ctx.set_state(&encode_state(&id, options.step)).await?;
        info!(scene = %id, step = options.step, state_key = ?ctx.state_key(), "Scene entered");

        if let Some(enter) = target.hooks.enter.clone() {
            enter(ctx.clone(), SceneSession::new(ctx, &id, options.step)).await?;
        }
        Ok(())
    }

    /// Runs the active scene's leave hook and clears the state.
    pub async fn leave(&self, ctx: &Context) -> Result<()> {
        let Some(current) = self.current(ctx).await? else {
            return Ok(());
        };
        if let Some(leave) = self.get(&current.id).and_then(|s| s.hooks.leave.clone()) {
            leave(ctx.clone(), SceneSession::new(ctx, &current.id, current.step)).await?;
        }
        ctx.clear_state().await?;
        info!(scene = %current.id, state_key = ?ctx.state_key(), "Scene left");
        Ok(())
    }

    pub async fn current(&self, ctx: &Context) -> Result<Option<SceneCursor>> {
        let state = ctx.get_state().await?;
        Ok(decode_state(state.as_deref()))
    }

    /// Runs the handler for the active scene. Returns false when no scene is
    /// active, the scene is unknown (state cleared), or a wizard ran past its last
    /// step (scene left).
    pub async fn handle(&self, ctx: &Context) -> Result<bool> {
        let Some(cursor) = self.current(ctx).await? else {
            return Ok(false);
        };
        let Some(scene) = self.get(&cursor.id) else {
            debug!(scene = %cursor.id, "Unknown scene, clearing state");
            ctx.clear_state().await?;
            return Ok(false);
        };

        let session = SceneSession::new(ctx, &cursor.id, cursor.step);
        let step_handler = match &scene.body {
            SceneBody::Single(handler) => handler.clone(),
            SceneBody::Wizard(steps) => match steps.get(cursor.step) {
                Some(handler) => handler.clone(),
                None => {
                    debug!(scene = %cursor.id, step = cursor.step, "Wizard step out of range, leaving");
                    self.leave(ctx).await?;
                    return Ok(false);
                }
            },
        };
        step_handler(ctx.clone(), session).await?;
        Ok(true)
    }
}
