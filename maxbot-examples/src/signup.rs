//! Signup bot: a three-step wizard with inline confirmation buttons.
//!
//! `/signup` starts the wizard, `/cancel` aborts it at any step and `/me` shows
//! the saved profile. `ALLOWED_USERS` (comma separated) restricts who may talk
//! to the bot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::future::BoxFuture;
use maxbot_core::{
    init_tracing, CallbackData, ClientConfig, FsmData, HttpBot, InlineKeyboard, MaxbotError,
    StateGroup,
};
use maxbot_dispatch::{Dispatcher, DispatcherConfig, ShutdownOptions};
use maxbot_middleware::{
    AuthMiddleware, IntoMiddleware, LoggingMiddleware, ThrottleMiddleware, ThrottleOptions,
};
use maxbot_router::{
    filters, scene_handler, Context, ReplyOptions, SceneHandler, SceneHooks, SceneManager,
    SceneSession,
};
use serde_json::json;
use tracing::{error, info, warn};

const SIGNUP: &str = "signup";

fn signup_buttons() -> CallbackData {
    CallbackData::new(SIGNUP)
}

fn profile_states() -> anyhow::Result<StateGroup> {
    Ok(StateGroup::new("profile", ["registered"])?)
}

/// Wraps a wizard step so `/cancel` leaves the scene from anywhere.
fn cancellable<F, Fut>(step: F) -> SceneHandler
where
    F: Fn(Context, SceneSession) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = maxbot_core::Result<()>> + Send + 'static,
{
    let step = Arc::new(step);
    scene_handler(move |ctx: Context, scene: SceneSession| {
        let step = step.clone();
        async move {
            if ctx.is_command("cancel") {
                scene.leave().await?;
                return ctx.reply("Signup cancelled.").await;
            }
            step(ctx, scene).await
        }
    })
}

fn confirm_keyboard() -> maxbot_core::Result<ReplyOptions> {
    let buttons = signup_buttons();
    let markup = InlineKeyboard::new()
        .callback("Confirm", buttons.pack([("action", "confirm")]))
        .callback("Start over", buttons.pack([("action", "restart")]))
        .build();
    ReplyOptions::keyboard(&markup)
}

fn field(data: &FsmData, key: &str) -> String {
    data.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("?")
        .to_string()
}

fn signup_scenes(profile: StateGroup) -> anyhow::Result<SceneManager> {
    let scenes = SceneManager::new();
    let registered = profile
        .state("registered")
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("profile group has no registered state"))?;

    scenes.register_wizard(
        SIGNUP,
        vec![
            cancellable(|ctx, scene| async move {
                let name = ctx.message_text().trim().to_string();
                if name.is_empty() {
                    return ctx.reply("Please send your name as text.").await;
                }
                let mut patch = FsmData::new();
                patch.insert("name".to_string(), json!(name));
                scene.update_data(patch).await?;
                ctx.reply("How old are you?").await?;
                scene.next().await
            }),
            cancellable(|ctx, scene| async move {
                let Ok(age) = ctx.message_text().trim().parse::<u8>() else {
                    return ctx.reply("Please send your age as a number.").await;
                };
                let mut patch = FsmData::new();
                patch.insert("age".to_string(), json!(age));
                let data = scene.update_data(patch).await?;
                ctx.reply_with(
                    format!("Name: {}\nAge: {}\nIs this right?", field(&data, "name"), age),
                    confirm_keyboard()?,
                )
                .await?;
                scene.next().await
            }),
            cancellable(move |ctx, scene| {
                let registered = registered.clone();
                async move {
                    let action = signup_buttons()
                        .unpack(ctx.callback_data())
                        .and_then(|fields| fields.get("action").cloned())
                        .unwrap_or_default();
                    match action.as_str() {
                        "confirm" => {
                            ctx.answer_callback(Some("Saved")).await?;
                            let data = scene.get_data().await?;
                            scene.leave().await?;
                            ctx.set_state(&registered).await?;
                            ctx.edit_message(format!("Welcome, {}!", field(&data, "name")))
                                .await
                        }
                        "restart" => {
                            ctx.answer_callback(None).await?;
                            scene.clear_data().await?;
                            scene.goto(0).await?;
                            ctx.reply("Let's start over. What's your name?").await
                        }
                        _ => ctx.reply("Please use the buttons above.").await,
                    }
                }
            }),
        ],
        SceneHooks::new()
            .on_enter(|ctx, _scene| async move { ctx.reply("What's your name?").await })
            .on_leave(|ctx, scene| async move {
                info!(
                    chat_id = ?ctx.chat_id(),
                    scene = %scene.id(),
                    step = scene.step(),
                    "Signup left"
                );
                Ok(())
            }),
    )?;
    Ok(scenes)
}

/// Last-resort error handler: logs and tells the user to retry.
fn apologize<'a>(err: &'a MaxbotError, ctx: Context) -> BoxFuture<'a, bool> {
    Box::pin(async move {
        error!(error = %err, update_id = ctx.update_id(), "Signup handler failed");
        ctx.reply("Something went wrong, please try again.")
            .await
            .is_ok()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let log_file = "logs/signup-bot.log";
    init_tracing(Some(log_file))?;

    let bot = Arc::new(HttpBot::new(ClientConfig::from_env()?)?);
    let dispatcher = Dispatcher::new(bot, DispatcherConfig::from_env()?)?;
    info!(
        start_time = %Local::now().format("%Y-%m-%d %H:%M:%S"),
        log_file = %log_file,
        fsm_strategy = %dispatcher.config().fsm_strategy,
        "Signup Bot started"
    );

    let router = dispatcher.router();
    router.use_middleware(LoggingMiddleware.into_middleware());
    if let Ok(raw) = std::env::var("ALLOWED_USERS") {
        let allowed: Vec<String> = raw
            .split(',')
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        info!(allowed = allowed.len(), "Restricting bot to allowed users");
        router.use_middleware(AuthMiddleware::new(allowed).into_middleware());
    }
    let throttle = ThrottleMiddleware::new(
        ThrottleOptions::new(5, Duration::from_secs(10)).on_limited(|ctx, retry_after| async move {
            warn!(
                chat_id = ?ctx.chat_id(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Chat throttled"
            );
            ctx.reply(format!("Slow down, try again in {}s.", retry_after.as_secs().max(1)))
                .await
        }),
    )?;
    router.use_middleware(throttle.into_middleware());

    let profile = profile_states()?;
    let scenes = signup_scenes(profile.clone())?;
    scenes.mount(router);

    let entry = scenes.clone();
    router.message_with([filters::command("signup")], move |ctx| {
        let scenes = entry.clone();
        async move { scenes.enter(&ctx, SIGNUP, 0usize).await }
    });
    router.message_with(
        [filters::command("me"), filters::state_group(&profile)],
        |ctx| async move {
            let data = ctx.get_data().await?;
            ctx.reply(format!(
                "You are {} ({}).",
                field(&data, "name"),
                data.get("age").cloned().unwrap_or(json!("?"))
            ))
            .await
        },
    );
    router.message_with([filters::command("me")], |ctx| async move {
        ctx.reply("You are not signed up yet. Send /signup.").await
    });
    router.message(|ctx| async move { ctx.reply("Send /signup to begin.").await });
    router.on_error(apologize);

    let polling = dispatcher.clone();
    let mut runner = tokio::spawn(async move { polling.start_long_polling(None).await });

    tokio::select! {
        finished = &mut runner => {
            finished??;
            info!("Signup Bot stopped");
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal?,
    }
    info!("Shutdown signal received");
    let graceful = ShutdownOptions::graceful(Some(Duration::from_secs(10)));
    if !dispatcher.stop_long_polling(graceful).await {
        warn!("Polling was not running");
    }
    runner.await??;
    info!("Signup Bot stopped");
    Ok(())
}
