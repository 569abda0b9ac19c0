use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, MEME_SYSTEM_PROMPT, MEME_WILDCARD_SEED};
use crate::utils::http::{provider_error_message, truncate_for_log};
use crate::utils::timing::log_provider_timing;

/// Turns a short seed (or nothing) into a full image prompt.
#[async_trait]
pub trait PromptGenerator: Send + Sync {
    async fn derive_prompt(&self, seed: Option<&str>) -> Result<String>;
}

pub struct ChatPromptGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    user_tag: String,
}

impl ChatPromptGenerator {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
            model: config.prompt_model.clone(),
            user_tag: config.request_user_tag.clone(),
        }
    }

    fn build_payload(&self, seed: Option<&str>) -> Value {
        let user_content = match seed.map(str::trim).filter(|value| !value.is_empty()) {
            Some(seed) => format!("Topic: {seed}"),
            None => MEME_WILDCARD_SEED.to_string(),
        };
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": MEME_SYSTEM_PROMPT },
                { "role": "user", "content": user_content },
            ],
            "user": self.user_tag,
        })
    }

    async fn call_chat_api(&self, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = provider_error_message(&body);
            warn!("Prompt generator API error: status={}, detail={}", status, detail);
            return Err(anyhow!(
                "prompt generation failed with status {}: {}",
                status,
                detail
            ));
        }

        Ok(response.json::<Value>().await?)
    }
}

pub fn extract_message_content(response: &Value) -> Option<String> {
    response
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .map(|content| content.trim().trim_matches('"').trim().to_string())
        .filter(|content| !content.is_empty())
}

#[async_trait]
impl PromptGenerator for ChatPromptGenerator {
    async fn derive_prompt(&self, seed: Option<&str>) -> Result<String> {
        let payload = self.build_payload(seed);
        let response = log_provider_timing("openai", &self.model, "chat.meme_prompt", || {
            self.call_chat_api(&payload)
        })
        .await?;

        let content = extract_message_content(&response).ok_or_else(|| {
            anyhow!(
                "prompt generator returned no text: {}",
                truncate_for_log(&response.to_string(), 500)
            )
        })?;
        debug!("Derived meme prompt: {}", truncate_for_log(&content, 200));
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::config::UsageBackend;

    fn test_config() -> Config {
        Config {
            bot_token: "token".to_string(),
            openai_api_key: "sk-test".to_string(),
            openai_base_url: "https://api.example.com/v1/".to_string(),
            image_model: "dall-e-3".to_string(),
            image_quality: "standard".to_string(),
            prompt_model: "gpt-4o-mini".to_string(),
            request_user_tag: "bot_ross".to_string(),
            api_limit: 100,
            usage_backend: UsageBackend::JsonFile,
            data_file: PathBuf::from("data/request_data.json"),
            database_url: "sqlite://data/usage.db".to_string(),
            http_timeout: Duration::from_secs(5),
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn blank_seed_uses_wildcard_instruction() {
        let generator = ChatPromptGenerator::new(Client::new(), &test_config());

        let payload = generator.build_payload(Some("   "));
        assert_eq!(payload["messages"][1]["content"], MEME_WILDCARD_SEED);
        assert_eq!(payload["messages"][0]["content"], MEME_SYSTEM_PROMPT);
        assert_eq!(payload["model"], "gpt-4o-mini");

        let payload = generator.build_payload(Some("cats and mondays"));
        assert_eq!(payload["messages"][1]["content"], "Topic: cats and mondays");
        assert_eq!(generator.base_url, "https://api.example.com/v1");
    }

    #[test]
    fn extracts_first_choice_text() {
        let response = json!({
            "choices": [{ "message": { "role": "assistant", "content": "  \"A cat at a desk\" \n" } }]
        });
        assert_eq!(
            extract_message_content(&response).as_deref(),
            Some("A cat at a desk")
        );

        let empty = json!({ "choices": [{ "message": { "content": "   " } }] });
        assert_eq!(extract_message_content(&empty), None);
        assert_eq!(extract_message_content(&json!({})), None);
    }
}
