//! Telegram adapter.
//!
//! Implements the `relay-core` update and reply ports over the raw Bot API:
//! `getUpdates` with an `offset` query and form-encoded `sendMessage`.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use relay_core::{
    domain::{ChatId, Update},
    errors::Error,
    ports::{ReplySink, UpdateSource},
    Result,
};

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Clone)]
pub struct TelegramClient {
    api_base: String,
    token: String,
    http: reqwest::Client,
}

impl TelegramClient {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), api_base, token)
    }

    pub fn with_http(
        http: reqwest::Client,
        api_base: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    // The request URL embeds the bot token; never let it reach the logs.
    fn map_err(e: reqwest::Error) -> Error {
        Error::Http(e.without_url())
    }
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let resp = self
            .http
            .get(self.method_url("getUpdates"))
            .query(&[("offset", offset)])
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = resp.status();
        let body = resp.text().await.map_err(Self::map_err)?;

        let envelope: Envelope<Vec<Update>> = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) if !status.is_success() => return Err(Error::api(status.as_u16(), &body)),
            Err(e) => return Err(Error::Decode(format!("getUpdates response: {e}"))),
        };

        if !envelope.ok {
            let code = envelope.error_code.unwrap_or(status.as_u16());
            let description = envelope.description.unwrap_or_default();
            return Err(Error::api(code, &description));
        }

        let updates = envelope
            .result
            .ok_or_else(|| Error::Decode("getUpdates response has no result".to_string()))?;
        debug!(offset, count = updates.len(), "fetched updates");
        Ok(updates)
    }
}

#[async_trait]
impl ReplySink for TelegramClient {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<String> {
        let chat_id_field = chat_id.0.to_string();
        let resp = self
            .http
            .post(self.method_url("sendMessage"))
            .form(&[("chat_id", chat_id_field.as_str()), ("text", text)])
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = resp.status();
        let body = resp.text().await.map_err(Self::map_err)?;
        debug!(chat_id = chat_id.0, status = status.as_u16(), response = %body, "response from telegram");

        if !status.is_success() {
            return Err(Error::api(status.as_u16(), &body));
        }
        Ok(body)
    }
}
