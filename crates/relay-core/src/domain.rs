use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram update id (numeric, strictly increasing but not contiguous).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UpdateId(pub i64);

impl UpdateId {
    /// Offset to request on the next poll so only newer updates are returned.
    pub fn next(self) -> i64 {
        self.0.saturating_add(1)
    }
}

/// An inbound event from the chat platform.
///
/// Only the fields the relay needs are decoded; everything else in the
/// platform payload is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: UpdateId,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: Option<String>,
    pub chat: Chat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

impl Update {
    /// Convenience constructor for a plain text message update.
    pub fn text(update_id: i64, chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            update_id: UpdateId(update_id),
            message: Some(Message {
                text: Some(text.into()),
                chat: Chat {
                    id: ChatId(chat_id),
                },
            }),
        }
    }

    pub fn chat_id(&self) -> Option<ChatId> {
        self.message.as_ref().map(|m| m.chat.id)
    }

    pub fn text_ref(&self) -> Option<&str> {
        self.message.as_ref().and_then(|m| m.text.as_deref())
    }
}
