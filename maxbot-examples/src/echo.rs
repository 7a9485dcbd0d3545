//! Echo bot: repeats every text message, answers `/start` and `/time`.
//!
//! Needs `BOT_TOKEN` and `MAX_API_URL` (a `.env` file works); dispatcher knobs
//! come from the `MAXBOT_*` variables.

use std::sync::Arc;

use chrono::Local;
use maxbot_core::{init_tracing, ClientConfig, HttpBot};
use maxbot_dispatch::{Dispatcher, DispatcherConfig};
use maxbot_middleware::{IntoMiddleware, LoggingMiddleware};
use maxbot_router::filters;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let log_file = "logs/echo-bot.log";
    init_tracing(Some(log_file))?;

    let bot = Arc::new(HttpBot::new(ClientConfig::from_env()?)?);
    let dispatcher = Dispatcher::new(bot, DispatcherConfig::from_env()?)?;
    info!(
        start_time = %Local::now().format("%Y-%m-%d %H:%M:%S"),
        log_file = %log_file,
        "Echo Bot started"
    );

    let router = dispatcher.router();
    router.use_middleware(LoggingMiddleware.into_middleware());
    router.message_with([filters::command("start")], |ctx| async move {
        ctx.reply("Send me anything and I will send it back.").await
    });
    router.message_with([filters::command("time")], |ctx| async move {
        ctx.reply(format!("Current time: {}", Local::now().format("%Y-%m-%d %H:%M:%S")))
            .await
    });
    router.message_with([filters::text()], |ctx| async move {
        ctx.reply(format!("Echo: {}", ctx.message_text())).await
    });
    dispatcher.on_unhandled(|ctx| async move {
        info!(update_type = %ctx.update_type(), "Ignoring update");
        Ok(true)
    });

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                on_signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
        }
    });

    dispatcher.start_long_polling(Some(shutdown)).await?;
    info!("Echo Bot stopped");
    Ok(())
}
