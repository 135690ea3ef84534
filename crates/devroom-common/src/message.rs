use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::file_tree::FileTree;

/// Reserved sender id for assistant-produced messages.
pub const AI_SENDER_ID: &str = "ai";

/// Who produced a message.
///
/// On the wire this is the bare participant id, with the reserved id
/// [`AI_SENDER_ID`] standing for the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sender {
    Participant(String),
    Assistant,
}

impl Sender {
    pub fn id(&self) -> &str {
        match self {
            Sender::Participant(id) => id,
            Sender::Assistant => AI_SENDER_ID,
        }
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, Sender::Assistant)
    }
}

impl From<String> for Sender {
    fn from(id: String) -> Self {
        if id == AI_SENDER_ID {
            Sender::Assistant
        } else {
            Sender::Participant(id)
        }
    }
}

impl From<&str> for Sender {
    fn from(id: &str) -> Self {
        Sender::from(id.to_string())
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::Participant(id) => id,
            Sender::Assistant => AI_SENDER_ID.to_string(),
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Structured assistant output: an explanation plus an optional tree edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<FileTree>,
}

/// Message body: plain text, or the structured assistant payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Structured(AiPayload),
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            MessageBody::Text(text) => text,
            MessageBody::Structured(payload) => &payload.text,
        }
    }

    pub fn file_tree(&self) -> Option<&FileTree> {
        match self {
            MessageBody::Text(_) => None,
            MessageBody::Structured(payload) => payload.file_tree.as_ref(),
        }
    }
}

/// A chat message. Immutable once accepted by a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub project_id: String,
    pub sender: Sender,
    pub message: MessageBody,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(project_id: impl Into<String>, sender: Sender, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            sender,
            message: body,
            timestamp: Utc::now(),
        }
    }
}

/// An authenticated participant as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
        }
    }

    pub fn sender(&self) -> Sender {
        Sender::from(self.id.clone())
    }
}
