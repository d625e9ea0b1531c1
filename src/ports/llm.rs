//! LLM port.
//!
//! Every call carries a deadline; timeouts and transport failures map to
//! the typed error kinds so callers can degrade to code-only paths. The
//! production client speaks the OpenRouter chat-completions API.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::errors::{CilError, CilResult};

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub deadline: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LlmCallOutput {
    pub model: String,
    pub content: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> CilResult<LlmCallOutput>;
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    referer: Option<String>,
    title: Option<String>,
}

impl OpenRouterClient {
    pub fn from_env(http: reqwest::Client, model: &str) -> CilResult<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| CilError::LlmUnavailable("OPENROUTER_API_KEY missing".to_string()))?;
        if api_key.trim().is_empty() {
            return Err(CilError::LlmUnavailable("OPENROUTER_API_KEY empty".to_string()));
        }

        let referer = std::env::var("OPENROUTER_HTTP_REFERER")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let title = std::env::var("OPENROUTER_APP_TITLE")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            http,
            api_key,
            model: model.to_string(),
            referer,
            title,
        })
    }
}

#[async_trait]
impl LlmPort for OpenRouterClient {
    async fn complete(&self, request: LlmRequest) -> CilResult<LlmCallOutput> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system,
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.user,
                },
            ],
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_tokens),
        };

        let mut http_req = self
            .http
            .post("https://openrouter.ai/api/v1/chat/completions")
            .timeout(request.deadline)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(r) = &self.referer {
            http_req = http_req.header("HTTP-Referer", r);
        }
        if let Some(t) = &self.title {
            http_req = http_req.header("X-Title", t);
        }

        let resp = http_req.json(&req).send().await.map_err(|e| {
            if e.is_timeout() {
                CilError::LlmTimeout(request.deadline.as_millis() as u64)
            } else {
                CilError::LlmUnavailable(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(CilError::LlmUnavailable(format!(
                "openrouter {}: {snippet}",
                status.as_u16()
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CilError::LlmMalformed(format!("openrouter json parse: {e}")))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(CilError::LlmMalformed("empty completion".to_string()));
        }

        Ok(LlmCallOutput {
            model: self.model.clone(),
            content,
            usage: LlmUsage {
                prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
                completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
                total_tokens: parsed.usage.as_ref().and_then(|u| u.total_tokens),
            },
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Always-unavailable port used when no LLM is configured; callers degrade
/// to their code-only paths.
pub struct DisabledLlm;

#[async_trait]
impl LlmPort for DisabledLlm {
    async fn complete(&self, _request: LlmRequest) -> CilResult<LlmCallOutput> {
        Err(CilError::LlmUnavailable("llm not configured".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Scripted double for tests
// ---------------------------------------------------------------------------

/// Returns queued responses in order; when the queue is empty, repeats the
/// fallback. Push an `Err` to simulate an outage window.
#[derive(Default)]
pub struct ScriptedLlm {
    queue: Mutex<VecDeque<CilResult<String>>>,
    fallback: Mutex<Option<String>>,
    pub calls: Mutex<u64>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, content: impl Into<String>) {
        self.queue.lock().push_back(Ok(content.into()));
    }

    pub fn push_err(&self, err: CilError) {
        self.queue.lock().push_back(Err(err));
    }

    pub fn set_fallback(&self, content: impl Into<String>) {
        *self.fallback.lock() = Some(content.into());
    }

    pub fn clear_queue(&self) {
        self.queue.lock().clear();
    }

    pub fn call_count(&self) -> u64 {
        *self.calls.lock()
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn complete(&self, _request: LlmRequest) -> CilResult<LlmCallOutput> {
        *self.calls.lock() += 1;
        let next = self.queue.lock().pop_front();
        let content = match next {
            Some(Ok(content)) => content,
            Some(Err(e)) => return Err(e),
            None => self
                .fallback
                .lock()
                .clone()
                .ok_or_else(|| CilError::LlmUnavailable("scripted llm exhausted".to_string()))?,
        };
        Ok(LlmCallOutput {
            model: "scripted".to_string(),
            content,
            usage: LlmUsage::default(),
            latency_ms: 1,
        })
    }
}
