use std::{env, time::Duration};

use crate::{errors::Error, session::SessionScope, Result};

/// Fixed delay between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_PROXY_BASE_URL: &str = "http://localhost:8080/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Which completion backend to talk to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AiBackend {
    /// Hosted OpenAI-compatible API, bearer credential required.
    Hosted { base_url: String, api_key: String },
    /// Self-hosted proxy, no credential.
    Proxy { base_url: String },
}

impl AiBackend {
    pub fn base_url(&self) -> &str {
        match self {
            AiBackend::Hosted { base_url, .. } | AiBackend::Proxy { base_url } => base_url,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AiBackend::Hosted { .. } => "openai",
            AiBackend::Proxy { .. } => "proxy",
        }
    }
}

/// Typed configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    pub telegram_api_base: String,
    pub ai_backend: AiBackend,
    pub ai_model: String,
    pub session_scope: SessionScope,
    pub poll_interval: Duration,
}

impl Config {
    /// Load from the process environment, after applying `.env` if present.
    ///
    /// Variables already set in the environment win over `.env` entries.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(_) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::Config(format!("failed to read .env: {e}"))),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let telegram_api_base = get("TELEGRAM_API_BASE")
            .map(|s| trim_base(&s))
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string());

        let backend_kind = get("AI_BACKEND").unwrap_or_else(|| "openai".to_string());
        let base_url = get("AI_BASE_URL").map(|s| trim_base(&s));
        let ai_backend = match backend_kind.trim().to_lowercase().as_str() {
            "openai" | "hosted" => {
                let api_key = get("OPENAI_API_KEY").or_else(|| get("OPEN_AI")).ok_or_else(|| {
                    Error::Config(
                        "OPENAI_API_KEY (or OPEN_AI) is required for the hosted backend"
                            .to_string(),
                    )
                })?;
                AiBackend::Hosted {
                    base_url: base_url.unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
                    api_key,
                }
            }
            "proxy" | "local" => AiBackend::Proxy {
                base_url: base_url.unwrap_or_else(|| DEFAULT_PROXY_BASE_URL.to_string()),
            },
            other => {
                return Err(Error::Config(format!(
                    "AI_BACKEND must be `openai` or `proxy`, got `{other}`"
                )))
            }
        };

        let ai_model = get("AI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let session_scope = match get("SESSION_SCOPE") {
            None => SessionScope::default(),
            Some(raw) => SessionScope::parse(&raw).ok_or_else(|| {
                Error::Config(format!("SESSION_SCOPE must be `chat` or `global`, got `{raw}`"))
            })?,
        };

        Ok(Self {
            telegram_bot_token,
            telegram_api_base,
            ai_backend,
            ai_model,
            session_scope,
            poll_interval: POLL_INTERVAL,
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}

fn trim_base(s: &str) -> String {
    s.trim_end_matches('/').to_string()
}
