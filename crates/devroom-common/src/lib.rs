//! Shared domain types for devroom.
//!
//! Everything that crosses a boundary lives here: the file tree exchanged with
//! clients, the durable store and the sandbox; chat messages and their sender
//! tags; and the events pushed over a project's transport topic.

pub mod events;
pub mod file_tree;
pub mod message;

pub use events::{
    ClientFrame, ParticipantPresence, RoomEvent, RoomSnapshot, SandboxState, SandboxStatus,
};
pub use file_tree::{FileNode, FileTree, PathError};
pub use message::{AI_SENDER_ID, AiPayload, Message, MessageBody, Participant, Sender};

/// Identifier of a project (and of its room and transport topic).
pub type ProjectId = String;
