//! Classifies inbound messages and applies them to their room.
//!
//! Dispatch is on the sender tag alone: the reserved `ai` sender produces
//! structured output that may carry a whole file tree, everyone else sends
//! plain text.

use devroom_common::{AiPayload, FileTree, Message, MessageBody, Sender};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::assistant::{AssistantDirective, AssistantRelay, extract_prompt};
use super::coordinator::SandboxCoordinator;
use super::registry::RoomRegistry;
use crate::errors::SessionError;

/// An inbound message after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Human {
        participant_id: String,
        text: String,
        /// Prompt for the assistant when the text contains `@ai`.
        prompt: Option<String>,
    },
    Ai {
        text: String,
        file_tree: Option<FileTree>,
        /// Why the payload could not be read as structured output.
        malformed: Option<String>,
    },
}

impl Inbound {
    pub fn classify(sender: &Sender, raw: &Value) -> Result<Inbound, SessionError> {
        match sender {
            Sender::Participant(id) => {
                let text = match raw {
                    Value::String(text) => text.as_str(),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str).unwrap_or(""),
                    _ => "",
                };
                let text = text.trim();
                if text.is_empty() {
                    return Err(SessionError::EmptyMessage);
                }
                Ok(Inbound::Human {
                    participant_id: id.clone(),
                    text: text.to_string(),
                    prompt: extract_prompt(text),
                })
            }
            Sender::Assistant => Ok(classify_ai(raw)),
        }
    }
}

/// The assistant sends either a JSON string or an object `{ text, fileTree? }`.
fn classify_ai(raw: &Value) -> Inbound {
    let parsed = match raw {
        Value::String(s) => serde_json::from_str::<AiPayload>(s).map_err(|e| (s.clone(), e)),
        Value::Object(obj) => serde_json::from_value::<AiPayload>(raw.clone()).map_err(|e| {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw.to_string());
            (text, e)
        }),
        other => {
            return Inbound::Ai {
                text: other.to_string(),
                file_tree: None,
                malformed: Some("expected a JSON string or object".to_string()),
            };
        }
    };

    match parsed {
        Ok(payload) => Inbound::Ai {
            text: payload.text,
            file_tree: payload.file_tree,
            malformed: None,
        },
        Err((text, e)) => Inbound::Ai {
            text,
            file_tree: None,
            malformed: Some(e.to_string()),
        },
    }
}

/// What the room accepted for one routed message.
#[derive(Debug)]
pub struct RouteReceipt {
    pub message: Message,
    pub file_tree: Option<FileTree>,
    /// Set when an assistant payload was malformed; the text was still kept.
    pub warning: Option<SessionError>,
}

pub struct MessageRouter {
    registry: Arc<RoomRegistry>,
    assistant: Option<Arc<dyn AssistantRelay>>,
    auto_run: Option<Arc<SandboxCoordinator>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            assistant: None,
            auto_run: None,
        }
    }

    pub fn with_assistant(mut self, assistant: Arc<dyn AssistantRelay>) -> Self {
        self.assistant = Some(assistant);
        self
    }

    /// Start a sandbox run whenever the assistant replaces the tree.
    pub fn with_auto_run(mut self, coordinator: Arc<SandboxCoordinator>) -> Self {
        self.auto_run = Some(coordinator);
        self
    }

    pub async fn route(
        &self,
        project_id: &str,
        sender: &Sender,
        raw: &Value,
    ) -> Result<RouteReceipt, SessionError> {
        let room = self.registry.get(project_id)?;

        match Inbound::classify(sender, raw)? {
            Inbound::Human {
                participant_id,
                text,
                prompt,
            } => {
                let message = Message::new(project_id, sender.clone(), MessageBody::Text(text));
                let message = room.append_message(message).await?;
                debug!(project_id, participant = %participant_id, message_id = %message.id, "Message accepted");

                if let Some(prompt) = prompt {
                    self.relay(AssistantDirective {
                        project_id: project_id.to_string(),
                        prompt,
                        sender: participant_id,
                    });
                }
                Ok(RouteReceipt {
                    message,
                    file_tree: None,
                    warning: None,
                })
            }
            Inbound::Ai {
                text,
                file_tree,
                malformed,
            } => {
                let body = match &malformed {
                    Some(_) => MessageBody::Text(text),
                    None => MessageBody::Structured(AiPayload {
                        text,
                        file_tree: file_tree.clone(),
                    }),
                };
                let message = Message::new(project_id, Sender::Assistant, body);
                let (file_tree, message) = room.append_with_tree(file_tree, message).await?;

                let warning = malformed.map(|reason| {
                    warn!(project_id, reason = %reason, "Malformed assistant payload; file tree skipped");
                    SessionError::MalformedPayload(reason)
                });

                if file_tree.is_some()
                    && let Some(coordinator) = &self.auto_run
                {
                    match coordinator.run(project_id, sender.id()).await {
                        Ok(started) => info!(project_id, run_id = started.run_id, "Auto-run after assistant edit"),
                        Err(e) => warn!(project_id, error = %e, "Auto-run failed to start"),
                    }
                }

                Ok(RouteReceipt {
                    message,
                    file_tree,
                    warning,
                })
            }
        }
    }

    pub async fn update_file_tree(
        &self,
        project_id: &str,
        sender: &Sender,
        tree: FileTree,
    ) -> Result<FileTree, SessionError> {
        let room = self.registry.get(project_id)?;
        room.apply_file_tree_update(tree, sender).await
    }

    pub async fn delete_path(
        &self,
        project_id: &str,
        sender: &Sender,
        path: &str,
    ) -> Result<Option<FileTree>, SessionError> {
        let room = self.registry.get(project_id)?;
        room.remove_path(path, sender).await
    }

    fn relay(&self, directive: AssistantDirective) {
        let Some(assistant) = self.assistant.clone() else {
            debug!(project_id = %directive.project_id, "No assistant configured; prompt not relayed");
            return;
        };
        tokio::spawn(async move {
            let project_id = directive.project_id.clone();
            if let Err(e) = assistant.dispatch(directive).await {
                warn!(%project_id, error = %format!("{:#}", e), "Assistant relay failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoomsSection, StoreSection};
    use crate::session::persistence::{PersistenceAdapter, StoreRoutes};
    use crate::session::resolver::{DeliveryResolver, RouteKind};
    use crate::session::store::MemoryStore;
    use crate::session::transport::{Outbound, TopicHub};
    use async_trait::async_trait;
    use devroom_common::{Participant, RoomEvent};
    use serde_json::json;
    use tokio::sync::{broadcast, mpsc};

    async fn setup(store: Arc<MemoryStore>) -> Arc<RoomRegistry> {
        let adapter = Arc::new(PersistenceAdapter::new(
            DeliveryResolver::new(store),
            StoreRoutes::from(&StoreSection::default()),
        ));
        Arc::new(RoomRegistry::new(
            Arc::new(TopicHub::new(64)),
            adapter,
            RoomsSection::default(),
        ))
    }

    fn drain(rx: &mut broadcast::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            out.push(outbound);
        }
        out
    }

    #[test]
    fn test_classify_human() {
        let inbound = Inbound::classify(&Sender::from("u1"), &json!("  hello  ")).unwrap();
        assert_eq!(
            inbound,
            Inbound::Human {
                participant_id: "u1".into(),
                text: "hello".into(),
                prompt: None,
            }
        );

        let inbound = Inbound::classify(&Sender::from("u1"), &json!("@ai make a todo app")).unwrap();
        assert!(matches!(inbound, Inbound::Human { prompt: Some(p), .. } if p == "make a todo app"));
    }

    #[test]
    fn test_classify_blank_human_is_empty_message() {
        for raw in [json!("   "), json!(""), json!(12), json!({"other": 1})] {
            assert!(matches!(
                Inbound::classify(&Sender::from("u1"), &raw),
                Err(SessionError::EmptyMessage)
            ));
        }
    }

    #[test]
    fn test_classify_ai_string_and_object() {
        let from_string = Inbound::classify(
            &Sender::Assistant,
            &json!(r#"{"text":"done","fileTree":{"a.txt":{"file":{"contents":"x"}}}}"#),
        )
        .unwrap();
        let from_object = Inbound::classify(
            &Sender::Assistant,
            &json!({"text": "done", "fileTree": {"a.txt": {"file": {"contents": "x"}}}}),
        )
        .unwrap();
        assert_eq!(from_string, from_object);
        assert!(matches!(from_object, Inbound::Ai { malformed: None, file_tree: Some(_), .. }));
    }

    #[test]
    fn test_classify_ai_malformed_keeps_text() {
        let inbound = Inbound::classify(&Sender::Assistant, &json!("not json at all")).unwrap();
        match inbound {
            Inbound::Ai {
                text,
                file_tree,
                malformed,
            } => {
                assert_eq!(text, "not json at all");
                assert!(file_tree.is_none());
                assert!(malformed.is_some());
            }
            other => panic!("Expected Ai, got {:?}", other),
        }

        let inbound = Inbound::classify(
            &Sender::Assistant,
            &json!({"text": "partial", "fileTree": {"a.txt": {"contents": "no kind"}}}),
        )
        .unwrap();
        assert!(matches!(inbound, Inbound::Ai { ref text, file_tree: None, malformed: Some(_) } if text == "partial"));
    }

    #[tokio::test]
    async fn test_ai_message_applies_tree_before_message() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        let mut rx = registry
            .join("p1", Participant::new("u1"))
            .await
            .unwrap()
            .events;
        drain(&mut rx);
        let router = MessageRouter::new(registry.clone());

        let receipt = router
            .route(
                "p1",
                &Sender::Assistant,
                &json!({"text": "done", "fileTree": {"a.txt": {"file": {"contents": "x"}}}}),
            )
            .await
            .unwrap();
        assert!(receipt.warning.is_none());

        let room = registry.get("p1").unwrap();
        let snap = room.snapshot().await.unwrap();
        assert_eq!(snap.file_tree.file_contents("a.txt"), Some("x"));
        assert_eq!(snap.messages.len(), 1);
        assert!(snap.messages[0].sender.is_assistant());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event.as_ref(), RoomEvent::FileTreeUpdated { .. }));
        assert!(matches!(events[1].event.as_ref(), RoomEvent::ProjectMessage(_)));
    }

    #[tokio::test]
    async fn test_malformed_ai_message_appends_text_only() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let router = MessageRouter::new(registry.clone());

        let receipt = router
            .route("p1", &Sender::Assistant, &json!("{broken"))
            .await
            .unwrap();
        assert!(matches!(receipt.warning, Some(SessionError::MalformedPayload(_))));
        assert!(receipt.file_tree.is_none());
        assert_eq!(receipt.message.message.text(), "{broken");

        let snap = registry.get("p1").unwrap().snapshot().await.unwrap();
        assert!(snap.file_tree.is_empty());
        assert_eq!(snap.tree_version, 0);
        assert_eq!(snap.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_room() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        let router = MessageRouter::new(registry);
        let err = router
            .route("ghost", &Sender::from("u1"), &json!("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownRoom { .. }));
    }

    #[tokio::test]
    async fn test_all_routes_failing_keeps_state_and_warns_sender_only() {
        let store = Arc::new(MemoryStore::new());
        let registry = setup(store.clone()).await;
        let mut rx = registry
            .join("p1", Participant::new("u1"))
            .await
            .unwrap()
            .events;
        registry.join("p1", Participant::new("u2")).await.unwrap();
        drain(&mut rx);
        for kind in [
            RouteKind::SaveMessage,
            RouteKind::MessagesCollection,
            RouteKind::ProjectMessages,
        ] {
            store.fail_route(kind);
        }
        let router = MessageRouter::new(registry.clone());

        router
            .route("p1", &Sender::from("u1"), &json!("hello"))
            .await
            .unwrap();
        let room = registry.get("p1").unwrap();
        room.sync_persistence().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2, "{:?}", events);
        assert!(matches!(events[0].event.as_ref(), RoomEvent::ProjectMessage(_)));
        assert!(events[0].visible_to("u2"));
        assert!(matches!(
            events[1].event.as_ref(),
            RoomEvent::DeliveryDegraded { attempted: 3, .. }
        ));
        assert!(events[1].visible_to("u1"));
        assert!(!events[1].visible_to("u2"));

        let snap = room.snapshot().await.unwrap();
        assert_eq!(snap.messages.len(), 1);
        assert!(store.stored_messages("p1").is_empty());
    }

    struct RecordingAssistant(mpsc::UnboundedSender<AssistantDirective>);

    #[async_trait]
    impl AssistantRelay for RecordingAssistant {
        async fn dispatch(&self, directive: AssistantDirective) -> anyhow::Result<()> {
            let _ = self.0.send(directive);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ai_directive_is_relayed_after_acceptance() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = MessageRouter::new(registry.clone()).with_assistant(Arc::new(RecordingAssistant(tx)));

        let receipt = router
            .route("p1", &Sender::from("u1"), &json!("@ai add a button"))
            .await
            .unwrap();
        assert_eq!(receipt.message.message.text(), "@ai add a button");

        let directive = rx.recv().await.unwrap();
        assert_eq!(directive.prompt, "add a button");
        assert_eq!(directive.sender, "u1");
        assert_eq!(directive.project_id, "p1");
    }

    #[tokio::test]
    async fn test_empty_message_changes_nothing() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let router = MessageRouter::new(registry.clone());

        let err = router
            .route("p1", &Sender::from("u1"), &json!("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::EmptyMessage));
        assert!(registry.get("p1").unwrap().snapshot().await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_path_through_router() {
        let registry = setup(Arc::new(MemoryStore::new())).await;
        registry.join("p1", Participant::new("u1")).await.unwrap();
        let router = MessageRouter::new(registry.clone());
        let sender = Sender::from("u1");

        router
            .update_file_tree("p1", &sender, FileTree::new().with_file("a.txt", "x"))
            .await
            .unwrap();
        let pruned = router.delete_path("p1", &sender, "a.txt").await.unwrap();
        assert!(pruned.unwrap().is_empty());
        assert!(router.delete_path("p1", &sender, "a.txt").await.unwrap().is_none());
    }
}
