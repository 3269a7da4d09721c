use std::collections::HashSet;

use crate::domain::ChatId;

/// How conversation activation is keyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionScope {
    /// Each chat must send `/start` before its messages are relayed.
    #[default]
    PerChat,
    /// One flag shared by every chat: a `/start` anywhere activates all chats.
    Global,
}

impl SessionScope {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "chat" | "per_chat" | "per-chat" => Some(SessionScope::PerChat),
            "global" => Some(SessionScope::Global),
            _ => None,
        }
    }
}

/// Activation state of a chat conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatState {
    Waiting,
    Active,
}

/// In-memory activation map. Unseen chats are `Waiting`.
///
/// Nothing here survives a restart.
#[derive(Clone, Debug, Default)]
pub struct ChatSessions {
    scope: SessionScope,
    active: HashSet<ChatId>,
    global_active: bool,
}

impl ChatSessions {
    pub fn new(scope: SessionScope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn scope(&self) -> SessionScope {
        self.scope
    }

    /// Mark a chat as started. Idempotent.
    pub fn activate(&mut self, chat_id: ChatId) {
        match self.scope {
            SessionScope::PerChat => {
                self.active.insert(chat_id);
            }
            SessionScope::Global => self.global_active = true,
        }
    }

    pub fn state(&self, chat_id: ChatId) -> ChatState {
        let active = match self.scope {
            SessionScope::PerChat => self.active.contains(&chat_id),
            SessionScope::Global => self.global_active,
        };
        if active {
            ChatState::Active
        } else {
            ChatState::Waiting
        }
    }

    pub fn is_active(&self, chat_id: ChatId) -> bool {
        self.state(chat_id) == ChatState::Active
    }

    /// Number of chats that have sent `/start` (per-chat scope only).
    pub fn active_chats(&self) -> usize {
        self.active.len()
    }
}
