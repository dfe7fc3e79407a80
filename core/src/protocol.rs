use crate::error::ChatError;
use crate::state::Author;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend session identifier. The service hands out numbers, locally created
/// sessions use strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum SessionId {
    Number(i64),
    Text(String),
}

impl SessionId {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(number) => Self::Number(number),
            Err(_) => Self::Text(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

/// Outbound envelope sent for every user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<SessionId>,
    /// Earlier turns, for services that keep no conversation state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextMessage {
    pub role: Author,
    pub content: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            model: None,
            token: None,
            chat_session_id: None,
            context: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(|err| ChatError::Protocol(err.to_string()))
    }
}

/// Inbound envelope, one per frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Start,
    Chunk {
        #[serde(rename = "content", default)]
        text: String,
    },
    End,
    Error {
        #[serde(rename = "error", default = "default_upstream_error")]
        message: String,
    },
}

fn default_upstream_error() -> String {
    "An error occurred".to_string()
}

impl StreamEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        Self::Chunk { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn decode(frame: &str) -> Result<Self, ChatError> {
        serde_json::from_str(frame).map_err(|err| ChatError::Protocol(err.to_string()))
    }

    pub fn encode(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(|err| ChatError::Protocol(err.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Chunk { .. } => "chunk",
            Self::End => "end",
            Self::Error { .. } => "error",
        }
    }
}
