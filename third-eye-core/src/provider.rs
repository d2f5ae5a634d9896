//! LLM provider client.
//!
//! Bounded, classified calls to an OpenAI-compatible chat completions
//! endpoint. Every call carries its own deadline; failures map onto the
//! unified taxonomy (timeout / auth / rate-limited / upstream 5xx /
//! network). The client never retries — retry policy belongs to the
//! Overseer, which knows which pipeline stage is safe to replay.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ProviderConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageBlock>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct UsageBlock {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// One successful completion: the content plus the token accounting the
/// provider reported (zero when the provider omits usage).
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider rejected credentials ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("provider rate limited: {message}")]
    RateLimited { message: String },

    #[error("provider upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("provider network error: {0}")]
    Network(String),

    #[error("provider returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("provider API key is not configured")]
    MissingApiKey,
}

impl ProviderError {
    /// Failure classes the Overseer may replay once with identical input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Upstream { .. })
    }

    /// Stable class tag for responses, audit rows, and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Auth { .. } => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream_5xx",
            Self::Network(_) => "network",
            Self::InvalidResponse(_) => "invalid_response",
            Self::MissingApiKey => "missing_api_key",
        }
    }
}

struct HealthCache {
    checked_at: Instant,
    healthy: bool,
}

/// Minimal chat-completions wrapper with a cached health probe.
pub struct ProviderClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_output_tokens: u32,
    default_timeout: Duration,
    health_timeout: Duration,
    health_cache_ttl: Duration,
    health: Mutex<Option<HealthCache>>,
}

impl ProviderClient {
    /// A missing API key does not fail construction: the service degrades
    /// to "routing fails, direct Eye calls still possible" instead of
    /// refusing to boot.
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.filter(|k| !k.is_empty()),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            default_timeout: Duration::from_secs(config.timeout_seconds),
            health_timeout: Duration::from_secs(config.health_timeout_seconds),
            health_cache_ttl: Duration::from_secs(config.health_cache_seconds),
            health: Mutex::new(None),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    /// One bounded completion call. `deadline` caps the whole exchange;
    /// the routing step passes its own short deadline here.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        force_json: bool,
        deadline: Duration,
    ) -> Result<ChatCompletion, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or(ProviderError::MissingApiKey)?;

        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_output_tokens,
            response_format: force_json.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        let send = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send();

        let response = match tokio::time::timeout(deadline, send).await {
            Err(_) => return Err(ProviderError::Timeout),
            Ok(Err(e)) if e.is_timeout() => return Err(ProviderError::Timeout),
            Ok(Err(e)) => return Err(ProviderError::Network(e.to_string())),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let message = match tokio::time::timeout(deadline, response.text()).await {
                Ok(Ok(body)) => body.chars().take(512).collect(),
                _ => String::new(),
            };
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: ChatResponse = match tokio::time::timeout(deadline, response.json()).await {
            Err(_) => return Err(ProviderError::Timeout),
            Ok(Err(e)) => return Err(ProviderError::InvalidResponse(e.to_string())),
            Ok(Ok(parsed)) => parsed,
        };

        extract_completion(parsed)
    }

    /// Trivial "reply OK" completion with the short health deadline.
    /// The result is cached so a burst of readiness probes costs one
    /// provider round trip.
    pub async fn health(&self) -> bool {
        {
            let cache = self.health.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.as_ref() {
                if entry.checked_at.elapsed() < self.health_cache_ttl {
                    return entry.healthy;
                }
            }
        }

        let messages = [
            ChatMessage::system("You are a health check responder."),
            ChatMessage::user("Respond with OK"),
        ];
        let healthy = match self.chat(&messages, false, self.health_timeout).await {
            Ok(completion) => !completion.content.trim().is_empty(),
            Err(e) => {
                tracing::warn!("provider health check failed: {}", e);
                false
            }
        };

        let mut cache = self.health.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(HealthCache {
            checked_at: Instant::now(),
            healthy,
        });
        healthy
    }
}

fn classify_status(status: u16, message: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Auth { status, message },
        429 => ProviderError::RateLimited { message },
        500..=599 => ProviderError::Upstream { status, message },
        _ => ProviderError::Upstream { status, message },
    }
}

/// Groq returns content either as a plain string or as a list of text
/// parts; both shapes collapse to one string here.
fn extract_completion(parsed: ChatResponse) -> Result<ChatCompletion, ProviderError> {
    let (input_tokens, output_tokens) = parsed
        .usage
        .as_ref()
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in completion".to_string()))?;

    let content = match choice.message.content {
        serde_json::Value::String(s) => s,
        serde_json::Value::Array(parts) => {
            let mut content = String::new();
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    content.push_str(text);
                }
            }
            content
        }
        other => {
            return Err(ProviderError::InvalidResponse(format!(
                "completion content missing or invalid: {}",
                other
            )))
        }
    };

    Ok(ChatCompletion {
        content,
        input_tokens,
        output_tokens,
    })
}

// ============================================================================
// TESTS
// ============================================================================
