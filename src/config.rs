use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageBackend {
    JsonFile,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub image_model: String,
    pub image_quality: String,
    pub prompt_model: String,
    pub request_user_tag: String,
    pub api_limit: u64,
    pub usage_backend: UsageBackend,
    pub data_file: PathBuf,
    pub database_url: String,
    pub http_timeout: Duration,
    pub log_level: String,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_required(name: &str) -> Result<String> {
    let value = env::var(name).unwrap_or_default();
    if value.trim().is_empty() {
        return Err(anyhow!("{name} is required"));
    }
    Ok(value)
}

fn normalize_database_url(value: String) -> String {
    if value.starts_with("sqlite+aiosqlite://") {
        return value.replacen("sqlite+aiosqlite://", "sqlite://", 1);
    }
    value
}

fn parse_usage_backend(value: &str) -> Result<UsageBackend> {
    match value.trim().to_lowercase().as_str() {
        "" | "json" | "file" => Ok(UsageBackend::JsonFile),
        "sqlite" | "db" => Ok(UsageBackend::Sqlite),
        other => Err(anyhow!(
            "unknown USAGE_BACKEND '{other}' (expected json or sqlite)"
        )),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env_required("BOT_TOKEN")?;
        let openai_api_key = env_required("OPENAI_API_KEY")?;

        Ok(Config {
            bot_token,
            openai_api_key,
            openai_base_url: env_string("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            image_model: env_string("IMAGE_MODEL", "dall-e-3"),
            image_quality: env_string("IMAGE_QUALITY", "standard"),
            prompt_model: env_string("PROMPT_MODEL", "gpt-4o-mini"),
            request_user_tag: env_string("REQUEST_USER_TAG", "bot_ross"),
            api_limit: env_u64("API_LIMIT", 100),
            usage_backend: parse_usage_backend(&env_string("USAGE_BACKEND", "json"))?,
            data_file: PathBuf::from(env_string("DATA_FILE", "data/request_data.json")),
            database_url: normalize_database_url(env_string(
                "DATABASE_URL",
                "sqlite://data/usage.db",
            )),
            http_timeout: Duration::from_secs(env_u64("HTTP_TIMEOUT_SECONDS", 120).max(1)),
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
        })
    }
}

pub const MEME_SYSTEM_PROMPT: &str = "You write prompts for an image generator that paints single-panel memes. \
Given a topic (or free rein), reply with ONE vivid image description of at most 60 words. \
Describe the scene, the characters and any short caption text that should appear in the image. \
Return only the prompt text, without quotes or commentary.";

pub const MEME_WILDCARD_SEED: &str =
    "Surprise me: pick any lighthearted, internet-famous meme format and a fresh topic for it.";

pub const MEME_FALLBACK_PROMPT: &str = "A cheerful landscape painter with a big curly afro grinning at the viewer, \
standing next to an easel showing a happy little tree, with the caption 'THERE ARE NO MISTAKES, ONLY HAPPY ACCIDENTS'.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_backend_names() {
        assert_eq!(parse_usage_backend("json").unwrap(), UsageBackend::JsonFile);
        assert_eq!(parse_usage_backend("").unwrap(), UsageBackend::JsonFile);
        assert_eq!(parse_usage_backend(" SQLite ").unwrap(), UsageBackend::Sqlite);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = parse_usage_backend("redis").unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn rewrites_aiosqlite_urls() {
        assert_eq!(
            normalize_database_url("sqlite+aiosqlite:///bot.db".to_string()),
            "sqlite:///bot.db"
        );
        assert_eq!(
            normalize_database_url("sqlite://data/usage.db".to_string()),
            "sqlite://data/usage.db"
        );
    }
}
