use async_trait::async_trait;

use crate::{
    domain::{ChatId, Update},
    Result,
};

/// Source of inbound updates (Telegram `getUpdates` today).
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Fetch pending updates with `update_id >= offset`, in delivery order.
    ///
    /// On error no partial batch is returned.
    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>>;
}

/// Outbound plain-text messaging.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Send `text` to `chat_id` and return the raw platform response body.
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<String>;
}

/// Hexagonal port for the AI completion backend.
///
/// Hosted and self-hosted backends both implement this. The loop only uses the
/// first candidate; the full list stays in the signature so callers can use
/// the rest without a contract change.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Send `prompt` as the only user message and return candidate replies in
    /// backend order.
    async fn complete(&self, prompt: &str) -> Result<Vec<String>>;
}
