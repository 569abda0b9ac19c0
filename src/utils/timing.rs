use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use teloxide::types::Message;
use tracing::info;

const TIMING_TEXT_PREVIEW: usize = 300;

#[derive(Debug)]
pub struct CommandTimer {
    command: String,
    chat_id: i64,
    user_id: Option<u64>,
    username: Option<String>,
    text: Option<String>,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    status: String,
    detail: Option<String>,
    completed: bool,
}

impl CommandTimer {
    pub fn from_message(command: &str, message: &Message) -> Self {
        let text = message.text().map(|value| {
            value
                .replace('\n', " ")
                .chars()
                .take(TIMING_TEXT_PREVIEW)
                .collect::<String>()
        });
        let user = message.from.as_ref();
        CommandTimer {
            command: command.to_string(),
            chat_id: message.chat.id.0,
            user_id: user.map(|u| u.id.0),
            username: user.and_then(|u| u.username.clone()),
            text,
            started_at: Utc::now(),
            started_perf: Instant::now(),
            status: "success".to_string(),
            detail: None,
            completed: false,
        }
    }

    fn log_received(&self) {
        info!(
            target: "bot_ross.timing",
            "event=command_received command={} chat_id={} user_id={:?} username={:?} received_at={} text={:?}",
            self.command,
            self.chat_id,
            self.user_id,
            self.username,
            self.started_at.to_rfc3339(),
            self.text
        );
    }

    pub fn complete(&mut self, status: &str, detail: Option<String>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.status = status.to_string();
        self.detail = detail;
        info!(
            target: "bot_ross.timing",
            "event=command_completed command={} chat_id={} user_id={:?} started_at={} completed_at={} duration_s={:.3} status={} detail={}",
            self.command,
            self.chat_id,
            self.user_id,
            self.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            self.started_perf.elapsed().as_secs_f64(),
            self.status,
            self.detail.clone().unwrap_or_default()
        );
    }
}

impl Drop for CommandTimer {
    fn drop(&mut self) {
        if !self.completed {
            self.complete("aborted", None);
        }
    }
}

pub fn start_command_timer(command: &str, message: &Message) -> CommandTimer {
    let timer = CommandTimer::from_message(command, message);
    timer.log_received();
    timer
}

/// Wraps one provider call with request/response timing events.
pub async fn log_provider_timing<T, E, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    call: F,
) -> Result<T, E>
where
    E: Display,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    info!(
        target: "bot_ross.timing",
        "event=llm_request provider={} model={} operation={} started_at={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339()
    );

    let result = call().await;
    let (status, detail) = match &result {
        Ok(_) => ("success", String::new()),
        Err(err) => ("error", err.to_string()),
    };

    info!(
        target: "bot_ross.timing",
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} detail={:?}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status,
        detail
    );

    result
}
