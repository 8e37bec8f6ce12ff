// Tutoring help: relays a learner's question to a chat-completion provider.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::{http::StatusCode, response::IntoResponse, Json};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::metrics;

pub const SYSTEM_PROMPT: &str = "You are an expert math tutor who explains step by step.";
pub const TEMPERATURE: f32 = 0.4;
const NO_CONTEXT: &str = "No context";

/// One chat-completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f32,
    pub system: String,
    pub user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// A chat-completion backend. Returns the raw answer text, if any.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, ProviderError>;
}

// ── OpenAI-compatible provider ───────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

pub struct OpenAiClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            endpoint: resolve_chat_endpoint(base_url),
            api_key: api_key.to_string(),
        })
    }
}

fn resolve_chat_endpoint(base_url: &str) -> String {
    if base_url.contains("/chat/completions") {
        base_url.to_string()
    } else {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

/// Message content is either a string or an array of text parts.
fn extract_text(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, ProviderError> {
        let payload = json!({
            "model": request.model,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status,
                body: truncate(&body, 320),
            });
        }

        let body: OpenAiResponse = response.json().await?;
        Ok(body
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .and_then(extract_text))
    }
}

// ── Help service ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HelpError {
    #[error("A question is required.")]
    EmptyQuestion,
    #[error("OPENAI_API_KEY is not configured on the backend.")]
    NotConfigured,
    #[error("Could not generate help right now.")]
    Provider(#[source] ProviderError),
    #[error("The model returned no answer.")]
    EmptyAnswer,
}

impl HelpError {
    pub fn status(&self) -> StatusCode {
        match self {
            HelpError::EmptyQuestion => StatusCode::BAD_REQUEST,
            HelpError::NotConfigured | HelpError::Provider(_) => StatusCode::INTERNAL_SERVER_ERROR,
            HelpError::EmptyAnswer => StatusCode::BAD_GATEWAY,
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            HelpError::EmptyQuestion => "invalid",
            HelpError::NotConfigured => "not_configured",
            HelpError::Provider(_) => "provider_error",
            HelpError::EmptyAnswer => "empty_answer",
        }
    }
}

impl IntoResponse for HelpError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub struct HelpService {
    provider: Option<Arc<dyn ChatProvider>>,
    model: String,
}

impl HelpService {
    pub fn new(provider: Option<Arc<dyn ChatProvider>>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Build the service from configuration. Without an API key every
    /// request answers `NotConfigured`.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let provider = match config.openai_api_key.as_deref() {
            Some(key) => {
                let client = OpenAiClient::new(key, &config.openai_base_url)?;
                Some(Arc::new(client) as Arc<dyn ChatProvider>)
            }
            None => {
                tracing::warn!("OPENAI_API_KEY is not set; tutoring help is disabled");
                None
            }
        };
        Ok(Self::new(provider, config.openai_model.clone()))
    }

    pub fn build_request(&self, question: &str, lesson_context: &str) -> ChatRequest {
        let context = if lesson_context.is_empty() {
            NO_CONTEXT
        } else {
            lesson_context
        };
        ChatRequest {
            model: self.model.clone(),
            temperature: TEMPERATURE,
            system: SYSTEM_PROMPT.to_string(),
            user: format!("Lesson context:\n{context}\n\nQuestion:\n{question}"),
        }
    }

    /// Reject a question that could never be answered, before any quota or
    /// provider work is spent on it.
    pub fn check_question(&self, question: &str) -> Result<(), HelpError> {
        if question.trim().is_empty() {
            metrics::AI_HELP_REQUESTS_TOTAL
                .with_label_values(&[HelpError::EmptyQuestion.outcome()])
                .inc();
            return Err(HelpError::EmptyQuestion);
        }
        Ok(())
    }

    /// Answer a question, returning the trimmed answer text.
    pub async fn ask(&self, question: &str, lesson_context: &str) -> Result<String, HelpError> {
        let result = self.ask_inner(question.trim(), lesson_context.trim()).await;
        let outcome = match &result {
            Ok(_) => "answered",
            Err(e) => e.outcome(),
        };
        metrics::AI_HELP_REQUESTS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn ask_inner(&self, question: &str, lesson_context: &str) -> Result<String, HelpError> {
        if question.is_empty() {
            return Err(HelpError::EmptyQuestion);
        }
        let provider = self.provider.as_ref().ok_or(HelpError::NotConfigured)?;

        let request = self.build_request(question, lesson_context);
        let started = Instant::now();
        let answer = provider.complete(&request).await;
        metrics::AI_HELP_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        let answer = answer.map_err(|e| {
            tracing::error!("AI help error: {e}");
            HelpError::Provider(e)
        })?;
        match answer.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(HelpError::EmptyAnswer),
        }
    }
}

/// Loose text coercion for request fields: strings pass through, numbers and
/// booleans are stringified, anything else is empty.
pub fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Provider that replays a canned result and records what it was sent.
    pub struct StubProvider {
        pub answer: Option<String>,
        pub fail: bool,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl StubProvider {
        pub fn answering(answer: &str) -> Self {
            Self {
                answer: Some(answer.to_string()),
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn silent() -> Self {
            Self {
                answer: None,
                fail: false,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn failing() -> Self {
            Self {
                answer: None,
                fail: true,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for StubProvider {
        async fn complete(&self, request: &ChatRequest) -> Result<Option<String>, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(ProviderError::Status {
                    status: 503,
                    body: "overloaded".to_string(),
                });
            }
            Ok(self.answer.clone())
        }
    }
}
