//! OpenAI-compatible chat completions adapter.
//!
//! Works against the hosted API (bearer credential) and against self-hosted
//! proxies that speak the same `chat/completions` dialect without auth.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use relay_core::{config::AiBackend, errors::Error, ports::CompletionBackend, Result};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.api_key.is_some())
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiClient {
    /// Hosted API with a bearer credential.
    pub fn hosted(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::build(base_url.into(), Some(api_key.into()), model.into())
    }

    /// Self-hosted proxy, no credential.
    pub fn proxy(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::build(base_url.into(), None, model.into())
    }

    pub fn from_backend(backend: &AiBackend, model: impl Into<String>) -> Self {
        match backend {
            AiBackend::Hosted { base_url, api_key } => {
                Self::hosted(base_url.clone(), api_key.clone(), model)
            }
            AiBackend::Proxy { base_url } => Self::proxy(base_url.clone(), model),
        }
    }

    fn build(base_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionBackend for OpenAiClient {
    fn name(&self) -> &str {
        if self.api_key.is_some() {
            "openai"
        } else {
            "proxy"
        }
    }

    async fn complete(&self, prompt: &str) -> Result<Vec<String>> {
        let request = ChatRequest {
            model: &self.model,
            stream: false,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "sending completion request");

        let mut builder = self.http.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Http(e.without_url()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::api(status.as_u16(), &body));
        }

        let body = resp.text().await.map_err(|e| Error::Http(e.without_url()))?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Decode(format!("completion response: {e}")))?;

        let candidates: Vec<String> = parsed
            .choices
            .into_iter()
            .map(|c| c.message.content.unwrap_or_default())
            .collect();
        debug!(count = candidates.len(), "completion candidates received");
        Ok(candidates)
    }
}
