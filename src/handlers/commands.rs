use std::time::Instant;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, InputFile, ReplyParameters};
use tracing::{debug, error, info, warn};

use crate::orchestrator::{GenerationOutcome, RequestKind, UsageSummary};
use crate::quotes::random_quote;
use crate::state::AppState;
use crate::utils::telegram::{fit_caption, start_chat_action_heartbeat};
use crate::utils::timing::start_command_timer;

const HELP_TEXT: &str = "Commands:\n\
/paint <prompt> - paint a picture (vivid style, counts toward the monthly limit)\n\
/natpaint <prompt> - paint a picture in a more natural style\n\
/meme [topic] - paint a meme; leave the topic empty for a surprise\n\
/stats - uptime, monthly limit and usage counters\n\
/ping - check liveness and latency (ms)\n\
/help - show this message";

fn usage_hint(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::NaturalPaint => "Usage: /natpaint <prompt>",
        RequestKind::Paint | RequestKind::Meme => "Usage: /paint <prompt>",
    }
}

fn command_name(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Paint => "paint",
        RequestKind::NaturalPaint => "natpaint",
        RequestKind::Meme => "meme",
    }
}

pub fn format_stats(summary: &UsageSummary, uptime_hours: f64) -> String {
    format!(
        "Uptime: {:.2} hours\nMonthly limit: {}\nMonthly requests ({}): {}\nSafety Violations: {}\nMemes: {}",
        uptime_hours,
        summary.monthly_limit,
        summary.month,
        summary.monthly_requests,
        summary.safety_trips,
        summary.memes
    )
}

async fn reply_text(bot: &Bot, message: &Message, text: impl Into<String>) -> Result<Message> {
    Ok(bot
        .send_message(message.chat.id, text.into())
        .reply_parameters(ReplyParameters::new(message.id))
        .await?)
}

/// Shared path for /paint, /natpaint and /meme.
pub async fn paint_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: String,
    kind: RequestKind,
) -> Result<()> {
    let mut timer = start_command_timer(command_name(kind), &message);
    let prompt = prompt.trim().to_string();

    if prompt.is_empty() && !kind.derives_prompt() {
        reply_text(&bot, &message, usage_hint(kind)).await?;
        timer.complete("rejected", Some("empty prompt".to_string()));
        return Ok(());
    }

    let requester = message
        .from
        .as_ref()
        .map(|user| user.full_name())
        .unwrap_or_else(|| "unknown".to_string());
    info!(
        "Received {} request from {} in chat {}: {}",
        kind.label(),
        requester,
        message.chat.id.0,
        prompt
    );

    let chat_id = message.chat.id;
    let quote_bot = bot.clone();
    let send_quote = move || async move {
        if let Err(err) = quote_bot.send_message(chat_id, random_quote()).await {
            warn!("Failed to send painter quote: {err}");
        }
    };

    let outcome = {
        let _chat_action =
            start_chat_action_heartbeat(bot.clone(), chat_id, ChatAction::UploadPhoto);
        state.orchestrator.handle(&prompt, kind, send_quote).await
    };
    debug!(stage = ?outcome.stage(), "{} request finished", kind.label());

    match &outcome {
        GenerationOutcome::Completed(done) => {
            let photo = InputFile::memory(done.image.clone()).file_name(done.artifact_name.clone());
            bot.send_photo(message.chat.id, photo)
                .caption(fit_caption(done.display_prompt()))
                .reply_parameters(ReplyParameters::new(message.id))
                .await?;
            bot.send_message(message.chat.id, outcome.user_message())
                .await?;
            timer.complete(
                "success",
                Some(format!("{} ({})", done.artifact_name, done.mime_type)),
            );
        }
        GenerationOutcome::QuotaExceeded { .. } => {
            reply_text(&bot, &message, outcome.user_message()).await?;
            timer.complete("denied", None);
        }
        GenerationOutcome::Failed { error, .. } => {
            reply_text(&bot, &message, outcome.user_message()).await?;
            timer.complete("error", Some(error.to_string()));
        }
    }
    Ok(())
}

pub async fn stats_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let mut timer = start_command_timer("stats", &message);
    match state.orchestrator.usage_summary().await {
        Ok(summary) => {
            reply_text(&bot, &message, format_stats(&summary, state.uptime_hours())).await?;
            timer.complete("success", None);
        }
        Err(err) => {
            error!("Failed to read usage summary: {err}");
            reply_text(&bot, &message, format!("Stats are unavailable right now: {err}")).await?;
            timer.complete("error", Some(err.to_string()));
        }
    }
    Ok(())
}

pub async fn ping_handler(bot: Bot, message: Message) -> Result<()> {
    let mut timer = start_command_timer("ping", &message);
    let started = Instant::now();
    let pong = reply_text(&bot, &message, "Pong!").await?;
    let latency_ms = started.elapsed().as_millis();
    bot.edit_message_text(message.chat.id, pong.id, format!("Pong! {latency_ms}ms"))
        .await?;
    timer.complete("success", Some(format!("{latency_ms}ms")));
    Ok(())
}

pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    reply_text(&bot, &message, HELP_TEXT).await?;
    Ok(())
}

pub async fn start_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    reply_text(
        &bot,
        &message,
        format!(
            "Hello! I am Bot Ross. I paint up to {} pictures a month with {}. Use /help to see commands.",
            state.orchestrator.policy().monthly_limit,
            state.config.image_model
        ),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_lists_every_counter() {
        let summary = UsageSummary {
            month: "2024-05".to_string(),
            monthly_requests: 12,
            monthly_limit: 100,
            safety_trips: 3,
            memes: 4,
        };

        assert_eq!(
            format_stats(&summary, 1.5),
            "Uptime: 1.50 hours\nMonthly limit: 100\nMonthly requests (2024-05): 12\nSafety Violations: 3\nMemes: 4"
        );
    }

    #[test]
    fn blank_prompt_hint_names_the_command() {
        assert_eq!(usage_hint(RequestKind::NaturalPaint), "Usage: /natpaint <prompt>");
        assert_eq!(usage_hint(RequestKind::Paint), "Usage: /paint <prompt>");
        assert!(HELP_TEXT.contains("/meme"));
    }
}
