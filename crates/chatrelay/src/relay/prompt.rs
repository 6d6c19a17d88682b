//! Prompt preparation
//!
//! Turns a client's raw message history into a provider-compliant prompt:
//! a single leading system message followed by the history with runs of
//! consecutive user turns collapsed to their last entry.

use serde::{Deserialize, Serialize};

/// Role of a conversation participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Any role the provider does not accept; always filtered out
    #[serde(other)]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Unknown => "unknown",
        }
    }
}

/// A single role-tagged message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Messages sent to the provider for one request
///
/// Always starts with exactly one system message. Built per request by
/// [`build_prompt`] and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Prompt(Vec<Message>);

impl Prompt {
    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.0
    }
}

/// Build the prompt for a request
///
/// Keeps every assistant message and each user message that is not
/// immediately followed by another user message. Everything else in the
/// history (system or unknown roles) is dropped.
pub fn build_prompt(history: &[Message], system: &str) -> Prompt {
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(system));

    for (index, message) in history.iter().enumerate() {
        let keep = match message.role {
            Role::Assistant => true,
            Role::User => history
                .get(index + 1)
                .is_none_or(|next| next.role != Role::User),
            Role::System | Role::Unknown => false,
        };
        if keep {
            messages.push(message.clone());
        }
    }

    Prompt(messages)
}
