use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod config;
mod db;
mod handlers;
mod llm;
mod naming;
mod orchestrator;
mod quota;
mod quotes;
mod state;
mod usage;
mod utils;

use config::{Config, UsageBackend};
use db::SqliteUsageStore;
use handlers::commands;
use llm::{ChatPromptGenerator, ImageRequestClient, ImageRequestSettings, OpenAiImagesApi};
use orchestrator::{RequestKind, RequestOrchestrator};
use quota::{LocalClock, QuotaPolicy};
use state::AppState;
use usage::{JsonFileUsageStore, UsageStore};
use utils::http::build_http_client;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Bot Ross paints on request.")]
enum Command {
    #[command(description = "say hello.")]
    Start,
    #[command(description = "show the command list.")]
    Help,
    #[command(description = "check liveness and latency (ms).")]
    Ping,
    #[command(description = "paint a picture based on a prompt.")]
    Paint(String),
    #[command(description = "paint a picture in a natural style.")]
    Natpaint(String),
    #[command(description = "paint a meme, optionally about a topic.")]
    Meme(String),
    #[command(description = "monthly limit and usage counters.")]
    Stats,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

async fn build_usage_store(config: &Config) -> anyhow::Result<Arc<dyn UsageStore>> {
    let store: Arc<dyn UsageStore> = match config.usage_backend {
        UsageBackend::JsonFile => Arc::new(JsonFileUsageStore::new(config.data_file.clone())),
        UsageBackend::Sqlite => {
            let store = SqliteUsageStore::init(&config.database_url).await?;
            store.health_check().await?;
            Arc::new(store)
        }
    };
    Ok(store)
}

async fn build_orchestrator(config: &Config) -> anyhow::Result<RequestOrchestrator> {
    let http = build_http_client(config.http_timeout)?;
    let usage = build_usage_store(config).await?;

    let images = ImageRequestClient::new(
        Arc::new(OpenAiImagesApi::new(http.clone(), config)),
        usage.clone(),
        ImageRequestSettings::from_config(config),
    );
    let prompts = Arc::new(ChatPromptGenerator::new(http, config));

    Ok(RequestOrchestrator::new(
        usage,
        images,
        prompts,
        Arc::new(LocalClock),
        QuotaPolicy::from_config(config),
    ))
}

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let config = Arc::new(Config::load()?);
    let _guards = init_logging(&config);

    let orchestrator = build_orchestrator(&config).await?;
    info!(
        "Starting Bot Ross: model={} limit={} usage={}",
        orchestrator.image_model(),
        orchestrator.policy().monthly_limit,
        orchestrator.usage_backend()
    );

    let bot = Bot::new(config.bot_token.clone());
    let state = AppState::new(config, orchestrator);

    let handler = Update::filter_message().branch(
        dptree::entry()
            .filter_command::<Command>()
            .endpoint(handle_command),
    );

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

fn spawn_paint(bot: Bot, state: AppState, message: Message, prompt: String, kind: RequestKind) {
    tokio::spawn(async move {
        if let Err(err) = commands::paint_handler(bot, state, message, prompt, kind).await {
            error!("{} handler failed: {err}", kind.label());
        }
    });
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, state, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Ping => {
            tokio::spawn(async move {
                if let Err(err) = commands::ping_handler(bot, message).await {
                    error!("ping handler failed: {err}");
                }
            });
        }
        Command::Paint(prompt) => spawn_paint(bot, state, message, prompt, RequestKind::Paint),
        Command::Natpaint(prompt) => {
            spawn_paint(bot, state, message, prompt, RequestKind::NaturalPaint)
        }
        Command::Meme(seed) => spawn_paint(bot, state, message, seed, RequestKind::Meme),
        Command::Stats => {
            tokio::spawn(async move {
                if let Err(err) = commands::stats_handler(bot, state, message).await {
                    error!("stats handler failed: {err}");
                }
            });
        }
    }
    Ok(())
}
