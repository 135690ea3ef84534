//! Authoritative in-memory state of one active project.
//!
//! Every operation runs under the room's FIFO async mutex and broadcasts while
//! still holding it, so the order subscribers observe equals the order the
//! room accepted changes. Persistence is enqueued afterwards and never awaited.

use chrono::{DateTime, Utc};
use devroom_common::{
    FileTree, Message, Participant, ParticipantPresence, RoomEvent, RoomSnapshot, SandboxState,
    SandboxStatus, Sender,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_util::sync::DropGuard;
use tracing::{debug, info, warn};

use super::persistence::PersistenceAdapter;
use super::persister::Persister;
use super::sandbox::RunControl;
use super::transport::{Outbound, publish};
use crate::config::RoomsSection;
use crate::errors::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Created, nobody joined yet.
    Idle,
    Active,
    /// Last participant left. Never accepts operations again.
    Retired,
}

/// Result of a successful join.
pub struct JoinOutcome {
    /// Subscription created inside the join's critical section.
    pub events: broadcast::Receiver<Outbound>,
    pub snapshot: RoomSnapshot,
    pub first_join: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Connections still held by anyone in the room.
    Remaining(usize),
    NotMember,
    /// The last connection left and the room retired.
    Emptied,
}

/// Progress reported by a sandbox run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunUpdate {
    Installing,
    Running,
    Ready { url: String },
    Failed { error: String },
    Exited { code: Option<i32> },
}

/// What a new run needs to start: its id, control and the tree to mount.
pub struct RunTicket {
    pub run_id: u64,
    pub control: RunControl,
    /// Held by whoever drives the run until it is done with the workspace.
    pub driver: DropGuard,
    pub snapshot: FileTree,
    /// Control of the run this one replaces, still to be terminated.
    pub previous: Option<RunControl>,
}

struct Presence {
    participant: Participant,
    connections: usize,
}

struct SandboxRun {
    status: SandboxStatus,
    control: RunControl,
}

impl SandboxRun {
    fn is_live(&self) -> bool {
        self.status.state != SandboxState::Terminated
    }
}

struct RoomState {
    phase: RoomPhase,
    participants: Vec<Presence>,
    file_tree: FileTree,
    tree_version: u64,
    tree_updated_at: Option<DateTime<Utc>>,
    messages: VecDeque<Message>,
    sandbox: Option<SandboxRun>,
    next_run_id: u64,
    persister: Option<Persister>,
}

impl RoomState {
    fn presence(&self) -> Vec<ParticipantPresence> {
        self.participants
            .iter()
            .map(|p| ParticipantPresence {
                id: p.participant.id.clone(),
                display_name: p.participant.display_name.clone(),
                connections: p.connections,
            })
            .collect()
    }

    fn connection_count(&self) -> usize {
        self.participants.iter().map(|p| p.connections).sum()
    }
}

pub struct SessionRoom {
    project_id: String,
    config: RoomsSection,
    topic: broadcast::Sender<Outbound>,
    adapter: Arc<PersistenceAdapter>,
    state: Mutex<RoomState>,
}

impl SessionRoom {
    /// Create an idle room publishing on `topic`. Must run inside a tokio
    /// runtime: the room's persistence writer is spawned here.
    pub fn new(
        project_id: impl Into<String>,
        config: RoomsSection,
        topic: broadcast::Sender<Outbound>,
        adapter: Arc<PersistenceAdapter>,
    ) -> Self {
        let project_id = project_id.into();
        let (persister, _writer) = Persister::spawn(
            &project_id,
            adapter.clone(),
            topic.clone(),
            config.persist_backlog_cap,
        );
        Self {
            project_id,
            config,
            topic,
            adapter,
            state: Mutex::new(RoomState {
                phase: RoomPhase::Idle,
                participants: Vec::new(),
                file_tree: FileTree::new(),
                tree_version: 0,
                tree_updated_at: None,
                messages: VecDeque::new(),
                sandbox: None,
                next_run_id: 0,
                persister: Some(persister),
            }),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn topic(&self) -> &broadcast::Sender<Outbound> {
        &self.topic
    }

    pub async fn phase(&self) -> RoomPhase {
        self.state.lock().await.phase
    }

    /// Lock the state of a room that still accepts operations.
    async fn active_state(&self) -> Result<MutexGuard<'_, RoomState>, SessionError> {
        let state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            return Err(SessionError::unknown_room(&self.project_id));
        }
        Ok(state)
    }

    fn broadcast(&self, event: RoomEvent) {
        publish(&self.topic, Outbound::everyone(event));
    }

    pub async fn join(&self, participant: Participant) -> Result<JoinOutcome, SessionError> {
        let mut state = self.state.lock().await;
        if state.phase == RoomPhase::Retired {
            return Err(SessionError::unknown_room(&self.project_id));
        }

        let first_join = state.phase == RoomPhase::Idle;
        if first_join {
            self.load_initial(&mut state).await;
            state.phase = RoomPhase::Active;
        }

        match state
            .participants
            .iter_mut()
            .find(|p| p.participant.id == participant.id)
        {
            Some(presence) => presence.connections += 1,
            None => state.participants.push(Presence {
                participant: participant.clone(),
                connections: 1,
            }),
        }

        let participants = state.presence();
        info!(
            project_id = %self.project_id,
            participant = %participant.id,
            connections = state.connection_count(),
            "Participant joined"
        );
        self.broadcast(RoomEvent::ParticipantJoined {
            participant,
            participants,
        });
        // the joiner's own presence is already in its snapshot
        let events = self.topic.subscribe();

        Ok(JoinOutcome {
            events,
            snapshot: self.snapshot_of(&state),
            first_join,
        })
    }

    /// Populate tree and history from the durable store. Never fails: a
    /// failed or slow load leaves the room empty.
    async fn load_initial(&self, state: &mut RoomState) {
        let load = async {
            tokio::join!(
                self.adapter.load_file_tree(&self.project_id),
                self.adapter.load_messages(&self.project_id)
            )
        };

        match tokio::time::timeout(self.config.load_timeout(), load).await {
            Ok((tree, messages)) => {
                match tree {
                    Ok(tree) => state.file_tree = tree,
                    Err(e) => warn!(
                        project_id = %self.project_id,
                        error = %e,
                        "Could not load file tree; starting empty"
                    ),
                }
                match messages {
                    Ok(messages) => {
                        let skip = messages.len().saturating_sub(self.config.message_buffer_cap);
                        state.messages = messages.into_iter().skip(skip).collect();
                    }
                    Err(e) => warn!(
                        project_id = %self.project_id,
                        error = %e,
                        "Could not load message history; starting empty"
                    ),
                }
            }
            Err(_) => warn!(
                project_id = %self.project_id,
                timeout_ms = self.config.load_timeout_ms,
                "Loading room state timed out; starting empty"
            ),
        }
    }

    pub async fn leave(&self, participant_id: &str) -> LeaveOutcome {
        let mut state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            return LeaveOutcome::NotMember;
        }
        let Some(index) = state
            .participants
            .iter()
            .position(|p| p.participant.id == participant_id)
        else {
            return LeaveOutcome::NotMember;
        };

        state.participants[index].connections -= 1;
        if state.participants[index].connections == 0 {
            state.participants.remove(index);
        }

        if state.participants.is_empty() {
            self.retire(&mut state);
            return LeaveOutcome::Emptied;
        }

        let participants = state.presence();
        self.broadcast(RoomEvent::ParticipantLeft {
            participant_id: participant_id.to_string(),
            participants,
        });
        LeaveOutcome::Remaining(state.connection_count())
    }

    fn retire(&self, state: &mut RoomState) {
        state.phase = RoomPhase::Retired;
        if let Some(persister) = state.persister.take() {
            persister.close(state.file_tree.clone(), state.tree_version);
        }
        if let Some(run) = state.sandbox.as_ref().filter(|run| run.is_live()) {
            let control = run.control.clone();
            let run_id = run.status.run_id;
            tokio::spawn(async move {
                if control.terminate().await {
                    debug!(run_id, "Terminated sandbox run of retired room");
                }
            });
        }
        info!(project_id = %self.project_id, "Room retired");
    }

    pub async fn apply_file_tree_update(
        &self,
        tree: FileTree,
        origin: &Sender,
    ) -> Result<FileTree, SessionError> {
        let mut state = self.active_state().await?;
        Ok(self.commit_tree(&mut state, tree, origin))
    }

    /// Replace the tree with a copy lacking `path`. A missing path is a no-op
    /// and returns `None`.
    pub async fn remove_path(
        &self,
        path: &str,
        origin: &Sender,
    ) -> Result<Option<FileTree>, SessionError> {
        let mut state = self.active_state().await?;
        if !state.file_tree.contains_key(path) {
            return Ok(None);
        }
        let next = state.file_tree.without(path);
        Ok(Some(self.commit_tree(&mut state, next, origin)))
    }

    pub async fn append_message(&self, message: Message) -> Result<Message, SessionError> {
        let mut state = self.active_state().await?;
        Ok(self.commit_message(&mut state, message))
    }

    /// Apply an optional tree, then append `message`, in one critical section.
    pub async fn append_with_tree(
        &self,
        tree: Option<FileTree>,
        message: Message,
    ) -> Result<(Option<FileTree>, Message), SessionError> {
        let mut state = self.active_state().await?;
        let tree = tree.map(|tree| self.commit_tree(&mut state, tree, &message.sender));
        let message = self.commit_message(&mut state, message);
        Ok((tree, message))
    }

    fn commit_tree(&self, state: &mut RoomState, tree: FileTree, origin: &Sender) -> FileTree {
        let now = Utc::now();
        state.tree_version += 1;
        state.tree_updated_at = Some(now);
        state.file_tree = tree.clone();

        debug!(
            project_id = %self.project_id,
            version = state.tree_version,
            files = tree.file_count(),
            origin = %origin,
            "File tree replaced"
        );
        self.broadcast(RoomEvent::FileTreeUpdated {
            file_tree: tree.clone(),
            version: state.tree_version,
            updated_by: Some(origin.clone()),
            updated_at: now,
        });
        if let Some(persister) = &state.persister {
            persister.file_tree(tree.clone(), state.tree_version, origin.id());
        }
        tree
    }

    fn commit_message(&self, state: &mut RoomState, message: Message) -> Message {
        state.messages.push_back(message.clone());
        while state.messages.len() > self.config.message_buffer_cap {
            state.messages.pop_front();
        }
        self.broadcast(RoomEvent::ProjectMessage(message.clone()));
        if let Some(persister) = &state.persister {
            persister.message(message.clone());
        }
        message
    }

    /// Immutable copy of the current file tree.
    pub async fn current_snapshot(&self) -> Result<FileTree, SessionError> {
        Ok(self.active_state().await?.file_tree.clone())
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, SessionError> {
        let state = self.active_state().await?;
        Ok(self.snapshot_of(&state))
    }

    fn snapshot_of(&self, state: &RoomState) -> RoomSnapshot {
        RoomSnapshot {
            project_id: self.project_id.clone(),
            participants: state.presence(),
            file_tree: state.file_tree.clone(),
            tree_version: state.tree_version,
            tree_updated_at: state.tree_updated_at,
            messages: state.messages.iter().cloned().collect(),
            sandbox: state.sandbox.as_ref().map(|run| run.status.clone()),
        }
    }

    // ── Sandbox run bookkeeping ──────────────────────────────────────

    /// Register a new run, replacing the current one.
    pub async fn begin_run(&self, requested_by: &str) -> Result<RunTicket, SessionError> {
        let mut state = self.active_state().await?;
        state.next_run_id += 1;
        let run_id = state.next_run_id;
        let control = RunControl::new();
        let driver = control.driver();
        let status = SandboxStatus {
            run_id,
            state: SandboxState::NotStarted,
            url: None,
            error: None,
            requested_by: Some(requested_by.to_string()),
        };

        let previous = state
            .sandbox
            .replace(SandboxRun {
                status: status.clone(),
                control: control.clone(),
            })
            .filter(SandboxRun::is_live)
            .map(|run| run.control);

        info!(
            project_id = %self.project_id,
            run_id,
            requested_by,
            replaces_live_run = previous.is_some(),
            "Sandbox run requested"
        );
        self.broadcast(RoomEvent::SandboxStatus(status));

        Ok(RunTicket {
            run_id,
            control,
            driver,
            snapshot: state.file_tree.clone(),
            previous,
        })
    }

    /// Record progress of run `run_id`. Updates for a replaced run, or after
    /// the room retired, are ignored and return `false`.
    pub async fn update_run(&self, run_id: u64, update: RunUpdate) -> bool {
        let mut state = self.state.lock().await;
        if state.phase != RoomPhase::Active {
            return false;
        }
        let Some(run) = state
            .sandbox
            .as_mut()
            .filter(|run| run.status.run_id == run_id)
        else {
            return false;
        };

        match update {
            RunUpdate::Installing => run.status.state = SandboxState::Installing,
            RunUpdate::Running => run.status.state = SandboxState::Running,
            RunUpdate::Ready { url } => {
                run.status.state = SandboxState::Running;
                run.status.url = Some(url);
            }
            RunUpdate::Failed { error } => {
                run.status.state = SandboxState::Terminated;
                run.status.error = Some(error);
            }
            RunUpdate::Exited { code } => {
                run.status.state = SandboxState::Terminated;
                if code != Some(0) && run.status.error.is_none() {
                    run.status.error = Some(match code {
                        Some(code) => format!("process exited with code {}", code),
                        None => "process was killed".to_string(),
                    });
                }
            }
        }

        let status = run.status.clone();
        self.broadcast(RoomEvent::SandboxStatus(status));
        true
    }

    /// Forward one line of process output for the current run.
    pub async fn run_output(&self, run_id: u64, line: String) {
        let state = self.state.lock().await;
        let current = state
            .sandbox
            .as_ref()
            .is_some_and(|run| run.status.run_id == run_id);
        if state.phase == RoomPhase::Active && current {
            self.broadcast(RoomEvent::SandboxOutput { run_id, line });
        }
    }

    /// Mark the live run terminated and hand back its control for killing.
    pub async fn stop_run(&self) -> Result<Option<RunControl>, SessionError> {
        let mut state = self.active_state().await?;
        let Some(run) = state.sandbox.as_mut().filter(|run| run.is_live()) else {
            return Ok(None);
        };
        run.status.state = SandboxState::Terminated;
        let control = run.control.clone();
        let status = run.status.clone();
        self.broadcast(RoomEvent::SandboxStatus(status));
        Ok(Some(control))
    }

    pub async fn sandbox_status(&self) -> Option<SandboxStatus> {
        self.state
            .lock()
            .await
            .sandbox
            .as_ref()
            .map(|run| run.status.clone())
    }

    // ── Persistence control ──────────────────────────────────────────

    /// Queue a flush of the current state and wait for the writer to reach it.
    pub async fn flush(&self) {
        let persister = {
            let state = self.state.lock().await;
            let Some(persister) = state.persister.clone() else {
                return;
            };
            persister.flush(state.file_tree.clone(), state.tree_version);
            persister
        };
        persister.sync().await;
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn sync_persistence(&self) {
        let persister = self.state.lock().await.persister.clone();
        if let Some(persister) = persister {
            persister.sync().await;
        }
    }
}
