use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::llm::retry::{classify_status, RetryDecision, RetryPolicy, StatusClass};
use crate::usage::{UsageStore, SAFETY_TRIPS_KEY};
use crate::utils::http::{provider_error_message, truncate_for_log};
use crate::utils::timing::log_provider_timing;

const IMAGE_SIZE: &str = "1024x1024";
const IMAGE_RESPONSE_FORMAT: &str = "b64_json";
const FALLBACK_MIME_TYPE: &str = "image/png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StyleHint {
    #[default]
    Vivid,
    Natural,
}

impl StyleHint {
    pub fn as_str(self) -> &'static str {
        match self {
            StyleHint::Vivid => "vivid",
            StyleHint::Natural => "natural",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Policy,
    Fatal,
    Decode,
    Storage,
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no response".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("provider still failing after {attempts} attempt(s): {}: {message}", status_label(.status))]
    Transient {
        attempts: usize,
        status: Option<u16>,
        message: String,
    },
    #[error("safety violation: {message}")]
    PolicyViolation { message: String },
    #[error("response: {}: {message}", status_label(.status))]
    Fatal {
        status: Option<u16>,
        message: String,
    },
    #[error("could not decode image payload: {0}")]
    Decode(String),
    #[error("usage counters unavailable: {0}")]
    Storage(String),
}

impl GenerationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerationError::Transient { .. } => FailureKind::Transient,
            GenerationError::PolicyViolation { .. } => FailureKind::Policy,
            GenerationError::Fatal { .. } => FailureKind::Fatal,
            GenerationError::Decode(_) => FailureKind::Decode,
            GenerationError::Storage(_) => FailureKind::Storage,
        }
    }
}

/// Body of an `images/generations` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
    pub n: u8,
    pub size: String,
    pub quality: String,
    pub style: String,
    pub response_format: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: StatusCode,
    pub body: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub retryable: bool,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        TransportError {
            retryable: err.is_timeout() || err.is_connect(),
            message: err.to_string(),
        }
    }
}

/// One raw exchange with the image provider. Status interpretation and
/// retries live in [`ImageRequestClient`].
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn submit(
        &self,
        request: &ImageGenerationRequest,
    ) -> Result<ProviderResponse, TransportError>;
}

pub struct OpenAiImagesApi {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiImagesApi {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            base_url: config.openai_base_url.trim_end_matches('/').to_string(),
            api_key: config.openai_api_key.clone(),
        }
    }
}

#[async_trait]
impl ImageBackend for OpenAiImagesApi {
    async fn submit(
        &self,
        request: &ImageGenerationRequest,
    ) -> Result<ProviderResponse, TransportError> {
        let response = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(ProviderResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub revised_prompt: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

enum AttemptState {
    Attempting(usize),
    Succeeded { attempts: usize, body: String },
    FailedTransient {
        attempts: usize,
        status: Option<u16>,
        message: String,
    },
    FailedPolicy { message: String },
    FailedFatal {
        status: Option<u16>,
        message: String,
    },
}

impl fmt::Debug for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Attempting(n) => write!(f, "Attempting({n})"),
            AttemptState::Succeeded { attempts, .. } => write!(f, "Succeeded(after {attempts})"),
            AttemptState::FailedTransient { .. } => f.write_str("FailedTransient"),
            AttemptState::FailedPolicy { .. } => f.write_str("FailedPolicy"),
            AttemptState::FailedFatal { .. } => f.write_str("FailedFatal"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageRequestSettings {
    pub model: String,
    pub quality: String,
    pub user_tag: String,
}

impl ImageRequestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.image_model.clone(),
            quality: config.image_quality.clone(),
            user_tag: config.request_user_tag.clone(),
        }
    }
}

pub struct ImageRequestClient {
    backend: Arc<dyn ImageBackend>,
    usage: Arc<dyn UsageStore>,
    settings: ImageRequestSettings,
    retry: RetryPolicy,
}

impl ImageRequestClient {
    pub fn new(
        backend: Arc<dyn ImageBackend>,
        usage: Arc<dyn UsageStore>,
        settings: ImageRequestSettings,
    ) -> Self {
        Self {
            backend,
            usage,
            settings,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn build_request(&self, prompt: &str, style: StyleHint) -> ImageGenerationRequest {
        ImageGenerationRequest {
            model: self.settings.model.clone(),
            prompt: prompt.to_string(),
            n: 1,
            size: IMAGE_SIZE.to_string(),
            quality: self.settings.quality.clone(),
            style: style.as_str().to_string(),
            response_format: IMAGE_RESPONSE_FORMAT.to_string(),
            user: self.settings.user_tag.clone(),
        }
    }

    pub async fn generate(
        &self,
        prompt: &str,
        style: StyleHint,
    ) -> Result<GeneratedImage, GenerationError> {
        let request = self.build_request(prompt, style);
        let mut state = AttemptState::Attempting(1);
        loop {
            debug!(state = ?state, "image request state");
            state = match state {
                AttemptState::Attempting(attempt) => self.attempt(attempt, &request).await,
                AttemptState::Succeeded { attempts, body } => {
                    info!("Request: {} Success", truncate_for_log(prompt, 200));
                    return decode_payload(&body, attempts);
                }
                AttemptState::FailedTransient {
                    attempts,
                    status,
                    message,
                } => {
                    return Err(GenerationError::Transient {
                        attempts,
                        status,
                        message,
                    })
                }
                AttemptState::FailedPolicy { message } => {
                    return Err(GenerationError::PolicyViolation { message })
                }
                AttemptState::FailedFatal { status, message } => {
                    return Err(GenerationError::Fatal { status, message })
                }
            };
        }
    }

    async fn attempt(&self, attempt: usize, request: &ImageGenerationRequest) -> AttemptState {
        let operation = format!("images.generate#{attempt}");
        let submitted = log_provider_timing("openai", &self.settings.model, &operation, || {
            self.backend.submit(request)
        })
        .await;

        let response = match submitted {
            Ok(response) => response,
            Err(err) if err.retryable => {
                return self
                    .after_transient(attempt, None, err.message, &request.prompt)
                    .await;
            }
            Err(err) => {
                error!(
                    "Request: {} Error: transport: {}",
                    truncate_for_log(&request.prompt, 200),
                    err.message
                );
                return AttemptState::FailedFatal {
                    status: None,
                    message: err.message,
                };
            }
        };

        let status = response.status;
        match classify_status(status) {
            StatusClass::Success => AttemptState::Succeeded {
                attempts: attempt,
                body: response.body,
            },
            StatusClass::Transient => {
                let message = provider_error_message(&response.body);
                self.after_transient(attempt, Some(status.as_u16()), message, &request.prompt)
                    .await
            }
            StatusClass::Policy => {
                let message = provider_error_message(&response.body);
                info!(
                    "Request: {} Safety Violation. {}",
                    truncate_for_log(&request.prompt, 200),
                    message
                );
                if let Err(err) = self.usage.increment(SAFETY_TRIPS_KEY).await {
                    warn!("Failed to record safety violation: {err}");
                }
                AttemptState::FailedPolicy { message }
            }
            StatusClass::Fatal => {
                let message = provider_error_message(&response.body);
                error!(
                    "Request: {} Error: {}: {}",
                    truncate_for_log(&request.prompt, 200),
                    status.as_u16(),
                    message
                );
                AttemptState::FailedFatal {
                    status: Some(status.as_u16()),
                    message,
                }
            }
        }
    }

    async fn after_transient(
        &self,
        attempt: usize,
        status: Option<u16>,
        message: String,
        prompt: &str,
    ) -> AttemptState {
        match self.retry.after_transient_failure(attempt) {
            RetryDecision::RetryAfter(delay) => {
                error!(
                    "Request: {} Trying again. Error: {}: {} (attempt {}/{})",
                    truncate_for_log(prompt, 200),
                    status_label(&status),
                    message,
                    attempt,
                    self.retry.max_attempts()
                );
                tokio::time::sleep(delay).await;
                AttemptState::Attempting(attempt + 1)
            }
            RetryDecision::GiveUp => {
                error!(
                    "Request: {} Giving up after {} attempt(s). Error: {}: {}",
                    truncate_for_log(prompt, 200),
                    attempt,
                    status_label(&status),
                    message
                );
                AttemptState::FailedTransient {
                    attempts: attempt,
                    status,
                    message,
                }
            }
        }
    }
}

fn sniff_image_mime(bytes: &[u8]) -> String {
    match infer::get(bytes) {
        Some(kind) if kind.mime_type().starts_with("image/") => kind.mime_type().to_string(),
        Some(kind) => {
            warn!(
                "Provider payload looks like {}, not an image; sending as {}",
                kind.mime_type(),
                FALLBACK_MIME_TYPE
            );
            FALLBACK_MIME_TYPE.to_string()
        }
        None => FALLBACK_MIME_TYPE.to_string(),
    }
}

fn decode_payload(body: &str, attempts: usize) -> Result<GeneratedImage, GenerationError> {
    let parsed: ImagesResponse = serde_json::from_str(body)
        .map_err(|err| GenerationError::Decode(format!("unexpected response body: {err}")))?;
    let datum = parsed
        .data
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::Decode("response contained no images".to_string()))?;
    let encoded = datum
        .b64_json
        .ok_or_else(|| GenerationError::Decode("response image has no b64_json".to_string()))?;
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| GenerationError::Decode(err.to_string()))?;
    if bytes.is_empty() {
        return Err(GenerationError::Decode("image payload is empty".to_string()));
    }

    let revised_prompt = datum
        .revised_prompt
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    Ok(GeneratedImage {
        mime_type: sniff_image_mime(&bytes),
        bytes,
        revised_prompt,
        attempts,
    })
}

#[cfg(test)]
pub(crate) mod scripted {
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use super::*;

    pub(crate) const PNG_BYTES: [u8; 12] = [
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D,
    ];

    pub(crate) fn ok_body(revised_prompt: Option<&str>) -> String {
        serde_json::json!({
            "created": 1700000000,
            "data": [{
                "b64_json": general_purpose::STANDARD.encode(PNG_BYTES),
                "revised_prompt": revised_prompt,
            }]
        })
        .to_string()
    }

    pub(crate) fn reply(status: u16, body: &str) -> Result<ProviderResponse, TransportError> {
        Ok(ProviderResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        })
    }

    /// Backend that replays a fixed list of responses and records requests.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<ProviderResponse, TransportError>>>,
        pub(crate) requests: Mutex<Vec<ImageGenerationRequest>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new(
            replies: impl IntoIterator<Item = Result<ProviderResponse, TransportError>>,
        ) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ImageBackend for ScriptedBackend {
        async fn submit(
            &self,
            request: &ImageGenerationRequest,
        ) -> Result<ProviderResponse, TransportError> {
            self.requests.lock().push(request.clone());
            self.replies
                .lock()
                .pop_front()
                .expect("scripted backend ran out of replies")
        }
    }

    pub(crate) fn settings() -> ImageRequestSettings {
        ImageRequestSettings {
            model: "dall-e-3".to_string(),
            quality: "standard".to_string(),
            user_tag: "bot_ross".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::scripted::*;
    use super::*;
    use crate::usage::{InMemoryUsageStore, UsageRecord};

    fn client_for(
        backend: Arc<ScriptedBackend>,
        usage: Arc<InMemoryUsageStore>,
    ) -> ImageRequestClient {
        ImageRequestClient::new(backend, usage, settings())
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_two_transient_failures() {
        let backend = Arc::new(ScriptedBackend::new([
            reply(503, r#"{"error":{"message":"overloaded"}}"#),
            reply(503, r#"{"error":{"message":"still overloaded"}}"#),
        ]));
        let usage = Arc::new(InMemoryUsageStore::new());
        let client = client_for(backend.clone(), usage.clone());

        let err = client
            .generate("a tree", StyleHint::Vivid)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(
            err,
            GenerationError::Transient {
                attempts: 2,
                status: Some(503),
                message: "still overloaded".to_string(),
            }
        );
        assert_eq!(backend.calls(), 2);
        assert!(usage.load().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_when_second_attempt_succeeds() {
        let backend = Arc::new(ScriptedBackend::new([
            reply(503, "Service Unavailable"),
            reply(200, &ok_body(Some("a lone pine tree at dusk"))),
        ]));
        let usage = Arc::new(InMemoryUsageStore::new());
        let client = client_for(backend.clone(), usage);

        let started = tokio::time::Instant::now();
        let image = client.generate("a tree", StyleHint::Vivid).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(image.bytes, PNG_BYTES.to_vec());
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(image.attempts, 2);
        assert_eq!(
            image.revised_prompt.as_deref(),
            Some("a lone pine tree at dusk")
        );
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn bad_request_counts_a_safety_trip_without_retrying() {
        let backend = Arc::new(ScriptedBackend::new([reply(
            400,
            r#"{"error":{"message":"Your request was rejected by our safety system."}}"#,
        )]));
        let mut seed = UsageRecord::new();
        seed.set("2024-05", 3);
        let usage = Arc::new(InMemoryUsageStore::with_record(seed));
        let client = client_for(backend.clone(), usage.clone());

        let err = client
            .generate("something forbidden", StyleHint::Vivid)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::Policy);
        assert!(err.to_string().contains("rejected by our safety system"));
        assert_eq!(backend.calls(), 1);
        let record = usage.load().await.unwrap();
        assert_eq!(record.get(SAFETY_TRIPS_KEY), 1);
        assert_eq!(record.get("2024-05"), 3);
    }

    #[tokio::test]
    async fn other_statuses_fail_immediately_with_raw_body() {
        let backend = Arc::new(ScriptedBackend::new([reply(401, "invalid api key")]));
        let usage = Arc::new(InMemoryUsageStore::new());
        let client = client_for(backend.clone(), usage.clone());

        let err = client
            .generate("a tree", StyleHint::Natural)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            GenerationError::Fatal {
                status: Some(401),
                message: "invalid api key".to_string(),
            }
        );
        assert_eq!(err.to_string(), "response: 401: invalid api key");
        assert_eq!(backend.calls(), 1);
        assert!(usage.load().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried_other_transport_errors_are_not() {
        let backend = Arc::new(ScriptedBackend::new([
            Err(TransportError {
                message: "connection refused".to_string(),
                retryable: true,
            }),
            reply(200, &ok_body(None)),
        ]));
        let client = client_for(backend.clone(), Arc::new(InMemoryUsageStore::new()));
        let image = client.generate("a tree", StyleHint::Vivid).await.unwrap();
        assert_eq!(image.revised_prompt, None);
        assert_eq!(backend.calls(), 2);

        let backend = Arc::new(ScriptedBackend::new([Err(TransportError {
            message: "invalid header value".to_string(),
            retryable: false,
        })]));
        let client = client_for(backend.clone(), Arc::new(InMemoryUsageStore::new()));
        let err = client
            .generate("a tree", StyleHint::Vivid)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn malformed_success_body_is_a_decode_failure() {
        for body in [
            "not json",
            r#"{"data":[]}"#,
            r#"{"data":[{"url":"https://example.com/a.png"}]}"#,
            r#"{"data":[{"b64_json":"%%%"}]}"#,
        ] {
            let backend = Arc::new(ScriptedBackend::new([reply(200, body)]));
            let client = client_for(backend, Arc::new(InMemoryUsageStore::new()));
            let err = client
                .generate("a tree", StyleHint::Vivid)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), FailureKind::Decode, "body: {body}");
        }
    }

    #[tokio::test]
    async fn sends_the_expected_wire_fields() {
        let backend = Arc::new(ScriptedBackend::new([reply(200, &ok_body(None))]));
        let client = client_for(backend.clone(), Arc::new(InMemoryUsageStore::new()));

        client
            .generate("a quiet lake", StyleHint::Natural)
            .await
            .unwrap();

        let requests = backend.requests.lock();
        let body = serde_json::to_value(&requests[0]).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "dall-e-3",
                "prompt": "a quiet lake",
                "n": 1,
                "size": "1024x1024",
                "quality": "standard",
                "style": "natural",
                "response_format": "b64_json",
                "user": "bot_ross",
            })
        );
    }

    #[tokio::test]
    async fn custom_policy_caps_attempts() {
        let backend = Arc::new(ScriptedBackend::new([
            reply(429, "slow down"),
            reply(500, "oops"),
            reply(429, "slow down"),
        ]));
        let client = client_for(backend.clone(), Arc::new(InMemoryUsageStore::new()))
            .with_retry_policy(RetryPolicy::new(3, Duration::ZERO));

        let err = client
            .generate("a tree", StyleHint::Vivid)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GenerationError::Transient {
                attempts: 3,
                status: Some(429),
                ..
            }
        ));
        assert_eq!(backend.calls(), 3);
    }
}
