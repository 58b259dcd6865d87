use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ids::{MessageId, SessionId};

/// Title given to a session before its first user message names it.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Ai,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::User => "user",
            Role::Ai => "ai",
            Role::System => "system",
        };
        f.write_str(s)
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "ai" => Ok(Role::Ai),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One retrieved source passage with its ranking metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub score: f64,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A single council member's answer to the question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Opinion {
    pub role: String,
    pub model: String,
    pub text: String,
    #[serde(default)]
    pub web_search_used: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub opinions: Vec<Opinion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub follow_ups: Vec<String>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
            logs: Vec::new(),
            opinions: Vec::new(),
            citations: Vec::new(),
            follow_ups: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn ai(content: impl Into<String>) -> Self {
        Self::with_role(Role::Ai, content)
    }

    /// Empty AI message awaiting streamed content.
    pub fn streaming_ai() -> Self {
        let mut msg = Self::with_role(Role::Ai, "");
        msg.is_streaming = true;
        msg
    }

    /// Copy of this message with new content and a refreshed timestamp.
    /// The id stays stable so an edit does not change the message's
    /// identity.
    pub fn rewritten(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_pinned: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: SessionId::new(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            updated_at: Utc::now(),
            is_pinned: false,
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// The in-flight AI message, if a generation is being streamed into
    /// this session.
    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_streaming)
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_SESSION_TITLE
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
