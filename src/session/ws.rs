use axum::{
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use devroom_common::{ClientFrame, Participant, RoomEvent};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{ApiError, SharedState, TokenQuery, authenticate};
use super::transport::Outbound;
use crate::errors::SessionError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket handler ────────────────────────────────────────────────

/// Authenticate, then upgrade into a room session for `project_id`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let participant = authenticate(&state, &headers, query.token.as_deref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, participant)))
}

async fn handle_socket(
    socket: WebSocket,
    state: SharedState,
    project_id: String,
    participant: Participant,
) {
    let (mut sender, receiver) = socket.split();

    let joined = match state.registry.join(&project_id, participant.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(%project_id, participant = %participant.id, error = %e, "Join failed");
            let _ = send_event(&mut sender, &RoomEvent::error(e.code(), e.to_string())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };
    info!(%project_id, participant = %participant.id, "Participant connected");

    if send_event(&mut sender, &RoomEvent::RoomSnapshot(joined.snapshot))
        .await
        .is_ok()
    {
        let session = Session {
            state: &state,
            project_id: &project_id,
            participant: &participant,
        };
        run_socket_loop(sender, receiver, joined.events, &session).await;
    }

    match state.registry.leave(&project_id, &participant.id).await {
        Ok(outcome) => {
            debug!(%project_id, participant = %participant.id, ?outcome, "Participant disconnected")
        }
        Err(e) => debug!(%project_id, error = %e, "Leave after room was gone"),
    }
}

/// One connected participant in one room.
struct Session<'a> {
    state: &'a SharedState,
    project_id: &'a str,
    participant: &'a Participant,
}

impl Session<'_> {
    /// Apply a client frame. `Ok(Some(event))` is a reply for this socket only.
    async fn handle_frame(&self, frame: ClientFrame) -> Result<Option<RoomEvent>, SessionError> {
        let sender = self.participant.sender();
        match frame {
            ClientFrame::Message { message } => {
                let receipt = self
                    .state
                    .router
                    .route(self.project_id, &sender, &message)
                    .await?;
                Ok(receipt
                    .warning
                    .map(|warning| RoomEvent::error(warning.code(), warning.to_string())))
            }
            ClientFrame::FileTree { file_tree } => {
                self.state
                    .router
                    .update_file_tree(self.project_id, &sender, file_tree)
                    .await?;
                Ok(None)
            }
            ClientFrame::DeleteFile { path } => {
                self.state
                    .router
                    .delete_path(self.project_id, &sender, &path)
                    .await?;
                Ok(None)
            }
            ClientFrame::Run => {
                self.state
                    .coordinator
                    .run(self.project_id, &self.participant.id)
                    .await?;
                Ok(None)
            }
            ClientFrame::Stop => {
                self.state.coordinator.stop(self.project_id).await?;
                Ok(None)
            }
        }
    }

    /// Reply to a raw text frame.
    async fn handle_text(&self, text: &str) -> Option<RoomEvent> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = SessionError::MalformedPayload(e.to_string());
                return Some(RoomEvent::error(err.code(), err.to_string()));
            }
        };
        match self.handle_frame(frame).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(project_id = self.project_id, participant = %self.participant.id, error = %e, "Frame rejected");
                Some(RoomEvent::error(e.code(), e.to_string()))
            }
        }
    }

    /// Fresh snapshot for a receiver that fell behind the topic.
    async fn resync(&self) -> Option<RoomEvent> {
        let room = self.state.registry.get(self.project_id).ok()?;
        room.snapshot().await.ok().map(RoomEvent::RoomSnapshot)
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RoomEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize room event");
            Ok(())
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines topic forwarding, client frame handling, and periodic ping/pong
/// health checking into a single select loop. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the connection is considered dead
/// and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Outbound>,
    session: &Session<'_>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(project_id = session.project_id, "Pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Topic forwarding ────────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(outbound) => {
                        if !outbound.visible_to(&session.participant.id) {
                            continue;
                        }
                        if send_event(&mut sender, &outbound.event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(project_id = session.project_id, skipped, "Receiver lagged; resending snapshot");
                        if let Some(snapshot) = session.resync().await
                            && send_event(&mut sender, &snapshot).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = session.handle_text(text.as_str()).await
                            && send_event(&mut sender, &reply).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary and Ping frames carry nothing for the room
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
