use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

// ── Conversation message types ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

pub fn build_http_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }

    if let Ok(ms) = std::env::var("API_TIMEOUT_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            builder = builder
                .timeout(std::time::Duration::from_millis(ms))
                .connect_timeout(std::time::Duration::from_secs(10));
        }
    }

    builder.build().map_err(Into::into)
}

// ── Backend selector ──────────────────────────────────────────────────────────

/// The LLM backend in use, holding the selected model name. Chosen
/// explicitly via `LLM_PROVIDER=openai/glm`, or auto-detected: OpenAI when
/// only `OPENAI_API_KEY` is set, GLM otherwise.
#[derive(Debug, Clone)]
pub enum LlmBackend {
    OpenAi(String),
    Glm(String),
}

impl LlmBackend {
    pub fn from_env() -> Self {
        let is_openai = match std::env::var("LLM_PROVIDER").as_deref() {
            Ok("openai") => true,
            Ok("glm") => false,
            _ => {
                std::env::var("BIGMODEL_API_KEY").is_err()
                    || std::env::var("OPENAI_API_KEY").is_ok()
            }
        };
        if is_openai {
            let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
            LlmBackend::OpenAi(model)
        } else {
            let model = std::env::var("BIGMODEL_MODEL").unwrap_or_else(|_| "glm-5".to_string());
            LlmBackend::Glm(model)
        }
    }

    pub fn with_model(self, model: &str) -> Self {
        match self {
            Self::OpenAi(_) => Self::OpenAi(model.to_string()),
            Self::Glm(_) => Self::Glm(model.to_string()),
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            Self::OpenAi(m) | Self::Glm(m) => m,
        }
    }

    /// Env var holding the API key for the selected backend, the one
    /// credential the core needs.
    pub fn required_key_name(&self) -> &'static str {
        match self {
            Self::OpenAi(_) => "OPENAI_API_KEY",
            Self::Glm(_) => "BIGMODEL_API_KEY",
        }
    }

    pub fn api_key_missing(&self) -> bool {
        std::env::var(self.required_key_name()).is_err()
    }

    fn base_url(&self) -> String {
        match self {
            Self::OpenAi(_) => std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            Self::Glm(_) => std::env::var("BIGMODEL_BASE_URL")
                .unwrap_or_else(|_| "https://open.bigmodel.cn/api/paas/v4".to_string()),
        }
    }

    /// One chat-completions round trip. Suspends until the reply arrives,
    /// the token is cancelled, or the HTTP layer gives up.
    pub async fn chat(
        &self,
        client: &reqwest::Client,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("LLM call cancelled")),
            result = self.chat_inner(client, messages) => result,
        }
    }

    async fn chat_inner(&self, client: &reqwest::Client, messages: &[Message]) -> Result<String> {
        let api_key = std::env::var(self.required_key_name())
            .with_context(|| format!("{} env var not set", self.required_key_name()))?;
        let body = build_request(messages, self.model_name());

        let resp = client
            .post(format!("{}/chat/completions", self.base_url()))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("API error {status}: {text}"));
        }

        let parsed: ApiResponse = resp.json().await.context("failed to parse API response")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        if text.is_empty() {
            return Err(anyhow!("API returned empty content"));
        }
        Ok(text)
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

fn build_request(messages: &[Message], model: &str) -> ApiRequest {
    let api_messages: Vec<ApiMessage> = messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        })
        .collect();

    ApiRequest {
        model: model.to_string(),
        messages: api_messages,
        // SQL generation wants determinism, not creativity.
        temperature: 0.1,
        max_tokens: Some(4096),
    }
}
