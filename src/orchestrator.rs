use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::MEME_FALLBACK_PROMPT;
use crate::llm::{GenerationError, ImageRequestClient, PromptGenerator, StyleHint};
use crate::naming::derive_artifact_name;
use crate::quota::{is_admissible, Clock, QuotaPolicy};
use crate::usage::{UsageStore, MEMES_KEY, SAFETY_TRIPS_KEY};
use crate::utils::http::truncate_for_log;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Paint,
    NaturalPaint,
    Meme,
}

impl RequestKind {
    pub fn label(self) -> &'static str {
        match self {
            RequestKind::Paint => "paint",
            RequestKind::NaturalPaint => "natural paint",
            RequestKind::Meme => "meme",
        }
    }

    pub fn style(self) -> StyleHint {
        match self {
            RequestKind::NaturalPaint => StyleHint::Natural,
            RequestKind::Paint | RequestKind::Meme => StyleHint::Vivid,
        }
    }

    /// Whether the user text is only a seed for a generated prompt.
    pub fn derives_prompt(self) -> bool {
        matches!(self, RequestKind::Meme)
    }

    pub fn secondary_counter(self) -> Option<&'static str> {
        match self {
            RequestKind::Meme => Some(MEMES_KEY),
            RequestKind::Paint | RequestKind::NaturalPaint => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    QuotaChecked,
    PromptDerived,
    Requested,
    Completed,
    Denied,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CompletedGeneration {
    pub image: Vec<u8>,
    pub mime_type: String,
    pub artifact_name: String,
    pub prompt: String,
    pub revised_prompt: Option<String>,
    pub monthly_count: u64,
}

impl CompletedGeneration {
    /// The prompt the provider actually painted.
    pub fn display_prompt(&self) -> &str {
        self.revised_prompt.as_deref().unwrap_or(&self.prompt)
    }
}

#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Completed(CompletedGeneration),
    QuotaExceeded { month: String, limit: u64, used: u64 },
    Failed { prompt: String, error: GenerationError },
}

impl GenerationOutcome {
    pub fn stage(&self) -> Stage {
        match self {
            GenerationOutcome::Completed(_) => Stage::Completed,
            GenerationOutcome::QuotaExceeded { .. } => Stage::Denied,
            GenerationOutcome::Failed { .. } => Stage::Failed,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GenerationOutcome::Completed(done) => {
                format!("Current Monthly requests: {}", done.monthly_count)
            }
            GenerationOutcome::QuotaExceeded { .. } => {
                "Monthly limit reached. Please wait until next month to make more paint requests."
                    .to_string()
            }
            GenerationOutcome::Failed { prompt, error } => match error {
                GenerationError::PolicyViolation { message } => format!(
                    "No painting for: {prompt}, the request was rejected by the safety system: {message}"
                ),
                other => format!("No painting for: {prompt}, error for this request: {other}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSummary {
    pub month: String,
    pub monthly_requests: u64,
    pub monthly_limit: u64,
    pub safety_trips: u64,
    pub memes: u64,
}

pub struct RequestOrchestrator {
    usage: Arc<dyn UsageStore>,
    images: ImageRequestClient,
    prompts: Arc<dyn PromptGenerator>,
    clock: Arc<dyn Clock>,
    policy: QuotaPolicy,
}

impl RequestOrchestrator {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        images: ImageRequestClient,
        prompts: Arc<dyn PromptGenerator>,
        clock: Arc<dyn Clock>,
        policy: QuotaPolicy,
    ) -> Self {
        Self {
            usage,
            images,
            prompts,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> QuotaPolicy {
        self.policy
    }

    pub fn image_model(&self) -> &str {
        self.images.model()
    }

    pub fn usage_backend(&self) -> String {
        self.usage.describe()
    }

    /// Runs one request: quota check, optional prompt derivation, provider
    /// call, counter updates. For meme requests `prompt` is the seed.
    ///
    /// `on_admitted` runs once the quota check passes, before any provider
    /// call; denied or unreadable-quota requests never reach it.
    pub async fn handle<F, Fut>(
        &self,
        prompt: &str,
        kind: RequestKind,
        on_admitted: F,
    ) -> GenerationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let month = self.clock.month_key();
        debug!(stage = ?Stage::Start, kind = kind.label(), month = %month);

        let record = match self.usage.load().await {
            Ok(record) => record,
            Err(err) => {
                error!("Could not read usage counters: {err}");
                return GenerationOutcome::Failed {
                    prompt: prompt.to_string(),
                    error: GenerationError::Storage(err.to_string()),
                };
            }
        };
        let used = record.get(&month);
        if !is_admissible(&record, self.policy.monthly_limit, &month) {
            info!(
                "Denied {} request: {} of {} used for {}",
                kind.label(),
                used,
                self.policy.monthly_limit,
                month
            );
            return GenerationOutcome::QuotaExceeded {
                month,
                limit: self.policy.monthly_limit,
                used,
            };
        }
        debug!(stage = ?Stage::QuotaChecked, used = used);
        on_admitted().await;

        let effective_prompt = if kind.derives_prompt() {
            let derived = self.derive_prompt(prompt).await;
            debug!(stage = ?Stage::PromptDerived, prompt = %truncate_for_log(&derived, 200));
            derived
        } else {
            prompt.to_string()
        };

        debug!(stage = ?Stage::Requested);
        let image = match self.images.generate(&effective_prompt, kind.style()).await {
            Ok(image) => image,
            Err(error) => {
                warn!(
                    kind = kind.label(),
                    failure = ?error.kind(),
                    "No painting for: {}: {}",
                    truncate_for_log(&effective_prompt, 200),
                    error
                );
                return GenerationOutcome::Failed {
                    prompt: effective_prompt,
                    error,
                };
            }
        };

        let artifact_name = derive_artifact_name(&effective_prompt);
        let monthly_count = match self.usage.increment(&month).await {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to record {} usage for {}: {err}", kind.label(), month);
                used + 1
            }
        };
        if let Some(counter) = kind.secondary_counter() {
            if let Err(err) = self.usage.increment(counter).await {
                error!("Failed to bump '{}' counter: {err}", counter);
            }
        }

        info!(
            "Completed {} request {} ({} bytes {}, {} attempt(s), {} of {} this month)",
            kind.label(),
            artifact_name,
            image.bytes.len(),
            image.mime_type,
            image.attempts,
            monthly_count,
            self.policy.monthly_limit
        );
        GenerationOutcome::Completed(CompletedGeneration {
            image: image.bytes,
            mime_type: image.mime_type,
            artifact_name,
            prompt: effective_prompt,
            revised_prompt: image.revised_prompt,
            monthly_count,
        })
    }

    async fn derive_prompt(&self, seed: &str) -> String {
        let seed = Some(seed.trim()).filter(|value| !value.is_empty());
        match self.prompts.derive_prompt(seed).await {
            Ok(prompt) if !prompt.trim().is_empty() => prompt,
            Ok(_) => {
                warn!("Prompt generator returned nothing; using fallback prompt");
                MEME_FALLBACK_PROMPT.to_string()
            }
            Err(err) => {
                warn!("Prompt generator failed, using fallback prompt: {err}");
                MEME_FALLBACK_PROMPT.to_string()
            }
        }
    }

    pub async fn usage_summary(&self) -> Result<UsageSummary, GenerationError> {
        let month = self.clock.month_key();
        let record = self
            .usage
            .load()
            .await
            .map_err(|err| GenerationError::Storage(err.to_string()))?;
        Ok(UsageSummary {
            monthly_requests: record.get(&month),
            monthly_limit: self.policy.monthly_limit,
            safety_trips: record.get(SAFETY_TRIPS_KEY),
            memes: record.get(MEMES_KEY),
            month,
        })
    }
}
