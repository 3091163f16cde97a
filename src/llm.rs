//! Generative text model clients.
//!
//! Every backend implements [`TextModel`]: one prompt in, one completion out,
//! sampled with the fixed [`SAMPLING`] configuration. [`RetryModel`] wraps any
//! backend with exponential backoff for transport failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::{ModelBackend, ModelConfig};
use crate::error::{AppError, Result};

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
    pub candidate_count: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

pub const SAMPLING: SamplingConfig = SamplingConfig {
    candidate_count: 1,
    max_output_tokens: 1024,
    temperature: 0.2,
    top_p: 0.8,
    top_k: 40,
};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        // Request urls may carry credentials; never echo them to callers.
        let err = err.without_url();
        if err.is_timeout() {
            ModelError::Unavailable(format!("request timed out: {err}"))
        } else {
            ModelError::Unavailable(err.to_string())
        }
    }
}

impl From<ModelError> for AppError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Timeout(after) => AppError::ModelTimeout(after),
            ModelError::Unavailable(msg) => AppError::ModelUnavailable(msg),
        }
    }
}

#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> std::result::Result<String, ModelError>;
}

/// Runs one completion, failing with [`ModelError::Timeout`] once `limit` elapses.
pub async fn complete_with_timeout(
    model: &dyn TextModel,
    prompt: &str,
    limit: Duration,
) -> std::result::Result<String, ModelError> {
    match tokio::time::timeout(limit, model.complete(prompt, &SAMPLING)).await {
        Ok(result) => result,
        Err(_) => Err(ModelError::Timeout(limit)),
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))
}

async fn read_json(response: reqwest::Response) -> std::result::Result<Value, ModelError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ModelError::Unavailable(format!(
            "model API returned {status}: {}",
            truncate_for_log(&body, 300)
        )));
    }
    Ok(response.json().await?)
}

pub struct GeminiModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl TextModel for GeminiModel {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn complete(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> std::result::Result<String, ModelError> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": sampling,
        });

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = read_json(response).await?;

        let text: String = json["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
            .unwrap_or_default();
        if text.is_empty() {
            let reason = json["candidates"][0]["finishReason"]
                .as_str()
                .or_else(|| json["promptFeedback"]["blockReason"].as_str())
                .unwrap_or("no candidates");
            return Err(ModelError::Unavailable(format!(
                "Gemini returned no text ({reason})"
            )));
        }
        Ok(text)
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_tokens: u32,
    n: u32,
}

pub struct OpenRouterModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenRouterModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl TextModel for OpenRouterModel {
    #[instrument(level = "debug", skip_all, fields(model = %self.model))]
    async fn complete(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> std::result::Result<String, ModelError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            max_tokens: sampling.max_output_tokens,
            n: sampling.candidate_count,
        };

        let response = self
            .client
            .post(format!("{}/api/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let json = read_json(response).await?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ModelError::Unavailable("Invalid response format from LLM".to_string()))
    }
}

/// Retries transport failures of the inner model with exponential backoff.
///
/// delay = min(base * 2^(attempt-1), max_delay)
pub struct RetryModel<M> {
    inner: M,
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl<M: TextModel> RetryModel<M> {
    pub fn new(inner: M, max_retries: usize, base_delay: Duration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl<M: TextModel> TextModel for RetryModel<M> {
    async fn complete(
        &self,
        prompt: &str,
        sampling: &SamplingConfig,
    ) -> std::result::Result<String, ModelError> {
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            match self.inner.complete(prompt, sampling).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(
                            attempt,
                            elapsed_ms_total = started.elapsed().as_millis() as u64,
                            error = %e,
                            "model call exhausted retries"
                        );
                        return Err(e);
                    }
                    let delay = self
                        .base_delay
                        .saturating_mul(1u32 << (attempt - 1).min(16))
                        .min(self.max_delay);
                    warn!(attempt, max = self.max_retries, ?delay, error = %e, "model call failed; backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Builds the backend named in the configuration.
pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn TextModel>> {
    debug!(backend = ?config.backend, model = %config.model, "building model client");
    let base_delay = Duration::from_secs(1);
    let model: Arc<dyn TextModel> = match (config.backend, config.max_retries) {
        (ModelBackend::Gemini, 0) => Arc::new(GeminiModel::new(config)?),
        (ModelBackend::Gemini, n) => {
            Arc::new(RetryModel::new(GeminiModel::new(config)?, n, base_delay))
        }
        (ModelBackend::OpenRouter, 0) => Arc::new(OpenRouterModel::new(config)?),
        (ModelBackend::OpenRouter, n) => {
            Arc::new(RetryModel::new(OpenRouterModel::new(config)?, n, base_delay))
        }
    };
    Ok(model)
}

/// Truncates long model output for log lines.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(backend: ModelBackend, base_url: &str) -> ModelConfig {
        ModelConfig {
            backend,
            api_key: "test-key".to_string(),
            model: backend.default_model().to_string(),
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
        }
    }

    #[tokio::test]
    async fn gemini_sends_sampling_config_and_joins_parts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(serde_json::json!({
                "generationConfig": {
                    "candidateCount": 1,
                    "maxOutputTokens": 1024,
                    "topK": 40
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "[{\"Framing\": " }, { "text": "7}]" }] },
                    "finishReason": "STOP"
                }]
            })))
            .mount(&server)
            .await;

        let model = GeminiModel::new(&config(ModelBackend::Gemini, &server.uri())).unwrap();
        let text = model.complete("prompt", &SAMPLING).await.unwrap();
        assert_eq!(text, "[{\"Framing\": 7}]");
    }

    #[tokio::test]
    async fn gemini_transport_errors_do_not_leak_the_api_key() {
        use axum::response::IntoResponse;

        let mut cfg = config(ModelBackend::Gemini, "http://127.0.0.1:9");
        cfg.api_key = "SECRET-KEY-123".to_string();
        let model = GeminiModel::new(&cfg).unwrap();

        let err = model.complete("prompt", &SAMPLING).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(_)));
        assert!(!err.to_string().contains("SECRET-KEY-123"));

        let response = AppError::from(err).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("Model unavailable"));
        assert!(!body.contains("SECRET-KEY-123"));
    }

    #[tokio::test]
    async fn gemini_blocked_prompt_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "promptFeedback": { "blockReason": "SAFETY" }
            })))
            .mount(&server)
            .await;

        let model = GeminiModel::new(&config(ModelBackend::Gemini, &server.uri())).unwrap();
        let err = model.complete("prompt", &SAMPLING).await.unwrap_err();
        assert!(matches!(err, ModelError::Unavailable(msg) if msg.contains("SAFETY")));
    }

    #[tokio::test]
    async fn openrouter_reads_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({ "top_k": 40, "max_tokens": 1024 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "climate policy" } }]
            })))
            .mount(&server)
            .await;

        let model = OpenRouterModel::new(&config(ModelBackend::OpenRouter, &server.uri())).unwrap();
        assert_eq!(model.complete("p", &SAMPLING).await.unwrap(), "climate policy");
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let model = OpenRouterModel::new(&config(ModelBackend::OpenRouter, &server.uri())).unwrap();
        let err: AppError = model.complete("p", &SAMPLING).await.unwrap_err().into();
        assert!(matches!(err, AppError::ModelUnavailable(msg) if msg.contains("503")));
    }

    struct SlowModel;

    #[async_trait]
    impl TextModel for SlowModel {
        async fn complete(
            &self,
            _prompt: &str,
            _sampling: &SamplingConfig,
        ) -> std::result::Result<String, ModelError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out() {
        let err = complete_with_timeout(&SlowModel, "p", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Timeout(d) if d == Duration::from_millis(50)));
    }

    struct FlakyModel {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl TextModel for FlakyModel {
        async fn complete(
            &self,
            _prompt: &str,
            _sampling: &SamplingConfig,
        ) -> std::result::Result<String, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ModelError::Unavailable("boom".into()))
            } else {
                Ok("ok".into())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let model = RetryModel::new(
            FlakyModel { calls: AtomicUsize::new(0), fail_first: 2 },
            3,
            Duration::from_millis(10),
        );
        assert_eq!(model.complete("p", &SAMPLING).await.unwrap(), "ok");
        assert_eq!(model.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_max_attempts() {
        let model = RetryModel::new(
            FlakyModel { calls: AtomicUsize::new(0), fail_first: 10 },
            2,
            Duration::from_millis(10),
        );
        assert!(model.complete("p", &SAMPLING).await.is_err());
        assert_eq!(model.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 100), "short");
        assert_eq!(truncate_for_log("ééé", 3), "é…(+4 bytes)");
    }
}
