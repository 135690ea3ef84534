use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::file_tree::FileTree;
use crate::message::{Message, Participant, Sender};

/// Lifecycle of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    NotStarted,
    Installing,
    Running,
    Terminated,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxState::NotStarted => write!(f, "not_started"),
            SandboxState::Installing => write!(f, "installing"),
            SandboxState::Running => write!(f, "running"),
            SandboxState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Room-level view of the current sandbox run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub run_id: u64,
    pub state: SandboxState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

/// A participant currently in a room, with how many connections they hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPresence {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub connections: usize,
}

/// Everything a freshly joined client needs to render the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub project_id: String,
    pub participants: Vec<ParticipantPresence>,
    pub file_tree: FileTree,
    pub tree_version: u64,
    /// When the tree was last replaced in this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_updated_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxStatus>,
}

// ── Server → client ──────────────────────────────────────────────────

/// Events published on a project's transport topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum RoomEvent {
    RoomSnapshot(RoomSnapshot),
    ParticipantJoined {
        participant: Participant,
        participants: Vec<ParticipantPresence>,
    },
    ParticipantLeft {
        participant_id: String,
        participants: Vec<ParticipantPresence>,
    },
    #[serde(rename = "project-message")]
    ProjectMessage(Message),
    FileTreeUpdated {
        file_tree: FileTree,
        version: u64,
        updated_by: Option<Sender>,
        updated_at: DateTime<Utc>,
    },
    SandboxStatus(SandboxStatus),
    SandboxOutput {
        run_id: u64,
        line: String,
    },
    /// Accepted state could not be persisted on any route.
    DeliveryDegraded {
        operation: String,
        attempted: usize,
        last_error: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl RoomEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        RoomEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Client → server ──────────────────────────────────────────────────

/// Frames a connected client may send over its WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    /// `message` is plain text or, for the assistant, `{ text, fileTree? }`.
    Message { message: serde_json::Value },
    FileTree { file_tree: FileTree },
    DeleteFile { path: String },
    Run,
    Stop,
}
