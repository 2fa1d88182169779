//! OpenAI-compatible inference backend: `POST {endpoint}/chat/completions` with
//! `model = backend_id`, liveness via `GET {endpoint}/models`.
//!
//! `Mock` mode answers locally and deterministically, recognizing the audit prompts so an
//! offline engine can run end to end.

use capsule_core::prompts::{ARBITER_CLEAR_MARKER, ARBITER_TEMPLATE, ASSIST_TEMPLATE, SCORING_TEMPLATE};
use capsule_core::{BackendError, InferenceBackend, InvokeRequest, NodeRef};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_LLM_MODE: &str = "CAPSULE_LLM_MODE";
pub const ENV_LLM_API_KEY: &str = "CAPSULE_LLM_API_KEY";

const MOCK_SCORE: &str = "0.85";
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Mock (local, deterministic) or Live (HTTP).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LlmMode {
    #[default]
    Mock,
    Live,
}

impl LlmMode {
    pub fn from_env() -> Self {
        match std::env::var(ENV_LLM_MODE).as_deref() {
            Ok("live") => LlmMode::Live,
            _ => LlmMode::Mock,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct TokenUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

pub(crate) fn map_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Transport(format!("request timed out: {}", err))
    } else if err.is_decode() {
        BackendError::Malformed(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

pub(crate) fn join_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub struct OpenAiBackend {
    mode: LlmMode,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl OpenAiBackend {
    pub fn new(mode: LlmMode) -> Self {
        Self {
            mode,
            client: reqwest::Client::new(),
            api_key: None,
        }
    }

    /// Mode from `CAPSULE_LLM_MODE`, key from `CAPSULE_LLM_API_KEY`.
    pub fn from_env() -> Self {
        Self::new(LlmMode::from_env()).with_api_key(std::env::var(ENV_LLM_API_KEY).ok())
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn mode(&self) -> LlmMode {
        self.mode
    }

    fn mock_generate(node: &NodeRef, request: &InvokeRequest) -> String {
        let prompt = request.prompt.as_str();
        let head = |template: &'static str| template.split('{').next().unwrap_or(template);
        if prompt.starts_with(head(SCORING_TEMPLATE)) {
            return MOCK_SCORE.to_string();
        }
        if prompt.starts_with(head(ARBITER_TEMPLATE)) {
            return ARBITER_CLEAR_MARKER.to_string();
        }
        if prompt.starts_with(head(ASSIST_TEMPLATE)) {
            return format!("[mock assist from {}] No additional context available offline.", request.backend_id);
        }
        let preview: String = prompt.chars().take(80).collect();
        let ellipsis = if prompt.chars().count() > 80 { "…" } else { "" };
        format!(
            "[Generated – Mock {} on {}]\n\nResponse to: {}{}",
            request.backend_id, node.node_id, preview, ellipsis
        )
    }

    async fn live_generate(&self, node: &NodeRef, request: &InvokeRequest) -> Result<String, BackendError> {
        let url = join_url(&node.endpoint, "chat/completions");
        let body = ChatRequest {
            model: &request.backend_id,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        tracing::debug!(
            target: "capsule::adapters::openai",
            node = %node.node_id,
            model = %request.backend_id,
            max_tokens = request.max_tokens,
            prompt_len = request.prompt.len(),
            "Dispatching chat completion"
        );

        let mut builder = self.client.post(&url).timeout(request.timeout).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!(
                target: "capsule::adapters::openai",
                node = %node.node_id,
                status = status.as_u16(),
                "Chat completion rejected"
            );
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(map_reqwest)?;
        if let Some(usage) = &chat.usage {
            tracing::debug!(
                target: "capsule::adapters::openai",
                node = %node.node_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Tokens used"
            );
        }
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::Malformed("response has no choices[0].message.content".to_string()))
    }
}

impl Default for OpenAiBackend {
    fn default() -> Self {
        Self::new(LlmMode::Mock)
    }
}

#[async_trait::async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn invoke(&self, node: &NodeRef, request: &InvokeRequest) -> Result<String, BackendError> {
        match self.mode {
            LlmMode::Mock => Ok(Self::mock_generate(node, request)),
            LlmMode::Live => self.live_generate(node, request).await,
        }
    }

    async fn health(&self, node: &NodeRef) -> bool {
        if self.mode == LlmMode::Mock {
            return true;
        }
        let mut builder = self
            .client
            .get(join_url(&node.endpoint, "models"))
            .timeout(HEALTH_REQUEST_TIMEOUT);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(target: "capsule::adapters::openai", node = %node.node_id, error = %e, "Health probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::prompts::{arbiter_prompt, assist_prompt, scoring_prompt};
    use capsule_core::parse_confidence;

    fn node() -> NodeRef {
        NodeRef {
            node_id: "n1".into(),
            backend_id: "llama".into(),
            endpoint: "http://localhost:11434/v1/".into(),
        }
    }

    fn request(prompt: String) -> InvokeRequest {
        InvokeRequest {
            backend_id: "llama".into(),
            prompt,
            max_tokens: 64,
            temperature: 0.0,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn mock_answers_audits_so_offline_runs_pass() {
        let backend = OpenAiBackend::default();
        let score = backend.invoke(&node(), &request(scoring_prompt("2+2", "4"))).await.unwrap();
        assert!(parse_confidence(&score) >= 0.7);
        let critique = backend.invoke(&node(), &request(arbiter_prompt("2+2", "4"))).await.unwrap();
        assert!(capsule_core::critique_is_clear(&critique, ARBITER_CLEAR_MARKER));
        let assist = backend.invoke(&node(), &request(assist_prompt("Truth", "check", "4"))).await.unwrap();
        assert!(assist.contains("mock assist"));
        assert!(backend.health(&node()).await);
    }

    #[tokio::test]
    async fn mock_generation_is_deterministic() {
        let backend = OpenAiBackend::default();
        let a = backend.invoke(&node(), &request("hello".into())).await.unwrap();
        let b = backend.invoke(&node(), &request("hello".into())).await.unwrap();
        assert_eq!(a, b);
        assert!(a.contains("hello"));
    }

    #[test]
    fn urls_join_without_double_slashes() {
        assert_eq!(join_url("http://h/v1/", "chat/completions"), "http://h/v1/chat/completions");
        assert_eq!(join_url("http://h/v1", "/models"), "http://h/v1/models");
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let backend = OpenAiBackend::new(LlmMode::Live).with_api_key(Some("  ".into()));
        assert!(backend.api_key.is_none());
        assert_eq!(backend.mode(), LlmMode::Live);
    }
}
