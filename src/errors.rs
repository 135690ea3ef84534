//! Typed error hierarchy for devroom.
//!
//! Four enums cover the subsystems:
//! - `SessionError`: room, routing and coordination failures reported to callers
//! - `StoreError`: a single durable-store call that did not succeed
//! - `SandboxError`: workspace mounting and process supervision
//! - `IdentityError`: credential resolution at the HTTP/WebSocket boundary

use devroom_common::PathError;
use thiserror::Error;

/// Every candidate route for one persistence operation failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("All {attempted} routes failed for {operation}: {last_error}")]
pub struct DeliveryExhausted {
    pub operation: String,
    pub attempted: usize,
    pub last_error: String,
}

/// Errors surfaced by the session engine to the triggering caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active room for project {project_id}")]
    UnknownRoom { project_id: String },

    #[error(transparent)]
    DeliveryExhausted(#[from] DeliveryExhausted),

    #[error("Sandbox failure: {0}")]
    SandboxFailure(String),

    #[error("Malformed assistant payload: {0}")]
    MalformedPayload(String),

    #[error("Message must be non-blank text")]
    EmptyMessage,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn unknown_room(project_id: impl Into<String>) -> Self {
        SessionError::UnknownRoom {
            project_id: project_id.into(),
        }
    }

    /// Short machine-readable code used in targeted `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::UnknownRoom { .. } => "unknown_room",
            SessionError::DeliveryExhausted(_) => "delivery_exhausted",
            SessionError::SandboxFailure(_) => "sandbox_failure",
            SessionError::MalformedPayload(_) => "malformed_payload",
            SessionError::EmptyMessage => "empty_message",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::Store(_) => "store_error",
        }
    }
}

/// A single durable-store call that did not succeed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{method} {target} returned HTTP {status}")]
    Status {
        method: String,
        target: String,
        status: u16,
    },

    #[error("{method} {target} failed: {message}")]
    Transport {
        method: String,
        target: String,
        message: String,
    },

    #[error("Invalid response from {target}: {message}")]
    InvalidResponse { target: String, message: String },
}

/// Errors from the execution sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid path in file tree: {0}")]
    InvalidPath(#[from] PathError),

    #[error("Failed to prepare workspace at {path}: {source}")]
    Workspace {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {code:?}")]
    NonZeroExit { command: String, code: Option<i32> },

    #[error("Timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("Process event stream already taken")]
    EventsTaken,

    #[error("Run was superseded")]
    Superseded,
}

impl From<SandboxError> for SessionError {
    fn from(err: SandboxError) -> Self {
        SessionError::SandboxFailure(err.to_string())
    }
}

/// Errors resolving a bearer credential into a participant.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Credential rejected")]
    Rejected,

    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<IdentityError> for SessionError {
    fn from(err: IdentityError) -> Self {
        SessionError::Unauthorized(err.to_string())
    }
}
