//! LLM caller: a uniform transport every other component depends on.
//!
//! Provides the [`LlmClient`] trait and implementations:
//! - [`OpenRouterClient`]: chat-completions over HTTP (OpenRouter-compatible)
//! - [`ScriptedClient`]: queued canned responses for tests and demos
//!
//! The [`LlmCaller`] wrapper owns retry policy, per-attempt timeouts, and
//! the overall budget, so trait implementations stay plain request/response
//! adapters. Callers never see provider-specific quirks; swapping model
//! providers is a single-file change.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// A single completion request: model, prompt, temperature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    /// Provider-recognized model identifier.
    pub model_id: String,
    /// Full prompt text; must be non-empty.
    pub prompt_text: String,
    /// Sampling temperature in [0.0, 2.0].
    pub temperature: f64,
}

impl CompletionRequest {
    pub fn new(model_id: impl Into<String>, prompt_text: impl Into<String>, temperature: f64) -> Self {
        Self {
            model_id: model_id.into(),
            prompt_text: prompt_text.into(),
            temperature,
        }
    }
}

/// Typed failure from the LLM transport.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network-level failure (connect, reset, DNS). Retriable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An attempt exceeded its timeout. Retriable.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials rejected by the provider. Fatal.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Provider returned an error body. Fatal.
    #[error("model refused request (status {status}): {message}")]
    ModelRefused {
        /// HTTP status code from the provider.
        status: u16,
        /// Error body excerpt.
        message: String,
    },

    /// Empty or garbled response body. Retriable up to the attempt bound.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The request violated the caller contract; rejected before any I/O.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// Whether the retry loop may attempt this call again.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::Transport(_) | LlmError::Timeout(_) | LlmError::Malformed(_)
        )
    }

    /// Stable kind string for failure accounting in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Transport(_) | LlmError::Timeout(_) => "TRANSPORT",
            LlmError::Auth(_) => "AUTH",
            LlmError::ModelRefused { .. } => "MODEL_REFUSED",
            LlmError::Malformed(_) => "MALFORMED",
            LlmError::InvalidRequest(_) => "INVALID_REQUEST",
        }
    }
}

/// Trait for LLM transports.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn LlmClient>`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Perform one completion attempt for the given request.
    ///
    /// Implementations perform a single attempt; retries and timeouts belong
    /// to [`LlmCaller`].
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

// ============================================================================
// Retry policy
// ============================================================================

/// Exponential backoff with jitter for retriable transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt bound and initial delay.
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            ..Self::default()
        }
    }

    /// Backoff delay before retry number `attempt` (1-based), without jitter.
    fn calculate_delay(&self, attempt: usize) -> Duration {
        let millis =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32 - 1);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Add up to 25% random jitter so parallel retries do not stampede.
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = duration.as_millis() / 4;
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter as u64)
}

// ============================================================================
// Caller wrapper
// ============================================================================

/// Retry/timeout wrapper around an [`LlmClient`].
///
/// Holds no per-call state; each `call` is independent and idempotent from
/// the caller's perspective. Cheap to clone.
#[derive(Clone)]
pub struct LlmCaller {
    client: Arc<dyn LlmClient>,
    policy: RetryPolicy,
    per_attempt_timeout: Duration,
    overall_budget: Duration,
}

impl LlmCaller {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
            per_attempt_timeout: Duration::from_secs(60),
            overall_budget: Duration::from_secs(180),
        }
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// Set the overall budget across all retries.
    pub fn with_overall_budget(mut self, budget: Duration) -> Self {
        self.overall_budget = budget;
        self
    }

    /// Perform a completion with validation, retries, and timeouts.
    ///
    /// # Errors
    ///
    /// - [`LlmError::InvalidRequest`] before any I/O when the request violates
    ///   the contract (empty prompt/model, temperature outside [0.0, 2.0]).
    /// - The last transport error once retries or the budget are exhausted.
    pub async fn call(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        validate_request(request)?;

        let deadline = Instant::now() + self.overall_budget;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LlmError::Timeout(self.overall_budget));
            }
            let attempt_window = self.per_attempt_timeout.min(remaining);

            debug!(attempt, max = self.policy.max_attempts, "llm call attempt");
            let outcome = match timeout(attempt_window, self.client.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(attempt_window)),
            };

            match outcome {
                Ok(text) => {
                    if attempt > 1 {
                        debug!(attempt, "llm call succeeded after retries");
                    }
                    return Ok(text);
                }
                Err(e) => {
                    warn!(attempt, kind = e.kind(), error = %e, "llm call attempt failed");
                    if !e.is_retriable() || attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    let delay = with_jitter(self.policy.calculate_delay(attempt));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if delay >= remaining {
                        return Err(e);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn validate_request(request: &CompletionRequest) -> Result<(), LlmError> {
    if request.prompt_text.trim().is_empty() {
        return Err(LlmError::InvalidRequest("prompt_text is empty".into()));
    }
    if request.model_id.trim().is_empty() {
        return Err(LlmError::InvalidRequest("model_id is empty".into()));
    }
    if !(0.0..=2.0).contains(&request.temperature) {
        return Err(LlmError::InvalidRequest(format!(
            "temperature {} outside [0.0, 2.0]",
            request.temperature
        )));
    }
    Ok(())
}

// ============================================================================
// OpenRouter client
// ============================================================================

/// Chat-completions request payload.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Chat-completions response payload.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// OpenRouter-compatible chat-completions client.
///
/// The API key is injected at construction; the client never reads process
/// environment or other global state during calls.
///
/// ## Example
///
/// ```no_run
/// use archer::llm::OpenRouterClient;
/// use std::sync::Arc;
///
/// let client = Arc::new(
///     OpenRouterClient::new("sk-or-...")
///         .with_timeout(std::time::Duration::from_secs(30)),
/// );
/// ```
#[derive(Debug)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    /// API base URL — override for compatible endpoints or testing.
    base_url: String,
    timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Override the API base URL.
    ///
    /// Useful for OpenRouter-compatible endpoints and for pointing at a mock
    /// server in tests. Default: `"https://openrouter.ai/api/v1"`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the HTTP request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let payload = ChatRequest {
            model: request.model_id.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.prompt_text.clone(),
            }],
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    LlmError::Transport(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(LlmError::Auth(format!("status {status}: {body}")));
            }
            return Err(LlmError::ModelRefused {
                status: status.as_u16(),
                message: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Malformed(format!("failed to parse response: {e}")))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(LlmError::Malformed("empty completion".to_string()));
        }
        Ok(text)
    }
}

// ============================================================================
// Scripted client (testing)
// ============================================================================

/// Canned-response client for tests and demos.
///
/// Pops queued responses in order; records every request it receives.
/// When the script runs dry it returns [`LlmError::Malformed`].
#[derive(Default)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_text(&self, text: impl Into<String>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Ok(text.into()));
        }
    }

    /// Queue a failure.
    pub fn push_error(&self, error: LlmError) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push_back(Err(error));
        }
    }

    /// Requests received so far, in call order.
    pub fn received(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(requests) => requests.clone(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        match self.responses.lock() {
            Ok(mut responses) => responses
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Malformed("script exhausted".to_string()))),
            Err(_) => Err(LlmError::Malformed("script lock poisoned".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_success_body(text: &str) -> serde_json::Value {
        serde_json::json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest::new("test-model", prompt, 0.7)
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_empty_prompt_rejected_before_any_call() {
        let client = Arc::new(ScriptedClient::new());
        let caller = LlmCaller::new(client.clone());
        let err = caller.call(&request("   ")).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert!(client.received().is_empty(), "no attempt should be made");
    }

    #[tokio::test]
    async fn test_temperature_out_of_range_rejected() {
        let client = Arc::new(ScriptedClient::new());
        let caller = LlmCaller::new(client);
        let mut req = request("hello");
        req.temperature = 2.5;
        let err = caller.call(&req).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_empty_model_id_rejected() {
        let client = Arc::new(ScriptedClient::new());
        let caller = LlmCaller::new(client);
        let mut req = request("hello");
        req.model_id = String::new();
        assert!(caller.call(&req).await.is_err());
    }

    // ── Retry behavior ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_retries_transport_errors_until_success() {
        let client = Arc::new(ScriptedClient::new());
        client.push_error(LlmError::Transport("reset".into()));
        client.push_error(LlmError::Transport("reset".into()));
        client.push_text("ok");
        let caller = LlmCaller::new(client.clone()).with_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(1),
        ));
        let text = caller.call(&request("hello")).await.unwrap();
        assert_eq!(text, "ok");
        assert_eq!(client.received().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_auth_error_is_not_retried() {
        let client = Arc::new(ScriptedClient::new());
        client.push_error(LlmError::Auth("bad key".into()));
        client.push_text("never reached");
        let caller = LlmCaller::new(client.clone()).with_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(1),
        ));
        let err = caller.call(&request("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
        assert_eq!(client.received().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let client = Arc::new(ScriptedClient::new());
        for _ in 0..3 {
            client.push_error(LlmError::Malformed("garbled".into()));
        }
        let caller = LlmCaller::new(client.clone()).with_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(1),
        ));
        let err = caller.call(&request("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
        assert_eq!(client.received().len(), 3);
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_capped_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };
        assert_eq!(policy.calculate_delay(8), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let base = Duration::from_secs(1);
        for _ in 0..20 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(250));
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(LlmError::Transport("x".into()).kind(), "TRANSPORT");
        assert_eq!(LlmError::Timeout(Duration::from_secs(1)).kind(), "TRANSPORT");
        assert_eq!(LlmError::Auth("x".into()).kind(), "AUTH");
        assert_eq!(
            LlmError::ModelRefused {
                status: 500,
                message: "x".into()
            }
            .kind(),
            "MODEL_REFUSED"
        );
        assert_eq!(LlmError::Malformed("x".into()).kind(), "MALFORMED");
    }

    #[test]
    fn test_retriability() {
        assert!(LlmError::Transport("x".into()).is_retriable());
        assert!(LlmError::Malformed("x".into()).is_retriable());
        assert!(LlmError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!LlmError::Auth("x".into()).is_retriable());
        assert!(!LlmError::ModelRefused {
            status: 400,
            message: "x".into()
        }
        .is_retriable());
    }

    // ── OpenRouterClient ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_openrouter_success_returns_completion_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_success_body("A cat sat down.")))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("test-key").with_base_url(server.uri());
        let text = client.complete(&request("Summarize: the cat sat")).await.unwrap();
        assert_eq!(text, "A cat sat down.");
    }

    #[tokio::test]
    async fn test_openrouter_sends_bearer_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_success_body("ok")))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("test-key").with_base_url(server.uri());
        assert!(client.complete(&request("hello")).await.is_ok());
    }

    #[tokio::test]
    async fn test_openrouter_sends_model_and_temperature() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_success_body("ok")))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let _ = client
            .complete(&CompletionRequest::new("my-model", "hello", 0.3))
            .await;

        let reqs = server.received_requests().await.unwrap();
        assert_eq!(reqs.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&reqs[0].body).unwrap();
        assert_eq!(body["model"], "my-model");
        let temp = body["temperature"].as_f64().unwrap();
        assert!((temp - 0.3).abs() < 0.01);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
    }

    #[tokio::test]
    async fn test_openrouter_http_500_maps_to_model_refused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let err = client.complete(&request("hello")).await.unwrap_err();
        match err {
            LlmError::ModelRefused { status, .. } => assert_eq!(status, 500),
            other => panic!("expected ModelRefused, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_openrouter_http_401_maps_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("bad").with_base_url(server.uri());
        let err = client.complete(&request("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
    }

    #[tokio::test]
    async fn test_openrouter_invalid_json_maps_to_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json {{{{"))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let err = client.complete(&request("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_openrouter_empty_choices_maps_to_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = OpenRouterClient::new("k").with_base_url(server.uri());
        let err = client.complete(&request("hello")).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    // ── ScriptedClient ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_scripted_client_pops_in_order() {
        let client = ScriptedClient::new();
        client.push_text("first");
        client.push_text("second");
        assert_eq!(client.complete(&request("a")).await.unwrap(), "first");
        assert_eq!(client.complete(&request("b")).await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_scripted_client_exhausted_returns_malformed() {
        let client = ScriptedClient::new();
        let err = client.complete(&request("a")).await.unwrap_err();
        assert!(matches!(err, LlmError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_scripted_client_records_requests() {
        let client = ScriptedClient::new();
        client.push_text("x");
        let _ = client.complete(&request("recorded prompt")).await;
        let received = client.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].prompt_text, "recorded prompt");
    }
}
