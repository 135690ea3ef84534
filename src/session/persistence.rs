//! Persistence adapter: file trees and message logs over the delivery resolver.
//!
//! Writes are full replacements (trees) or appends (messages); both are safe
//! to repeat. Reads are tolerant of the several response shapes the durable
//! store has used over time.

use chrono::{DateTime, Utc};
use devroom_common::{AiPayload, FileTree, Message, MessageBody, Sender};
use serde_json::{Value, json};
use tracing::warn;
use uuid::Uuid;

use super::resolver::{Delivered, DeliveryResolver, DeliveryRoute, Operation};
use crate::errors::{DeliveryExhausted, SessionError, StoreError};

/// Route lists for each persistence operation, in fallback order.
#[derive(Debug, Clone)]
pub struct StoreRoutes {
    pub message_save: Vec<DeliveryRoute>,
    pub message_load: Vec<DeliveryRoute>,
    pub file_tree_save: Vec<DeliveryRoute>,
    pub file_tree_load: Vec<DeliveryRoute>,
}

impl From<&crate::config::StoreSection> for StoreRoutes {
    fn from(section: &crate::config::StoreSection) -> Self {
        Self {
            message_save: section.message_save.clone(),
            message_load: section.message_load.clone(),
            file_tree_save: section.file_tree_save.clone(),
            file_tree_load: section.file_tree_load.clone(),
        }
    }
}

pub struct PersistenceAdapter {
    resolver: DeliveryResolver,
    routes: StoreRoutes,
}

impl PersistenceAdapter {
    pub fn new(resolver: DeliveryResolver, routes: StoreRoutes) -> Self {
        Self { resolver, routes }
    }

    pub async fn save_message(&self, message: &Message) -> Result<Delivered, DeliveryExhausted> {
        let body = json!({
            "id": message.id,
            "projectId": message.project_id,
            "message": message.message,
            "sender": message.sender,
            "timestamp": message.timestamp,
        });
        let op = Operation::new("save_message", &message.project_id, Some(body));
        self.resolver.attempt(&op, &self.routes.message_save).await
    }

    /// Stored history for a project, oldest first. Entries that cannot be
    /// understood are skipped.
    pub async fn load_messages(&self, project_id: &str) -> Result<Vec<Message>, SessionError> {
        let op = Operation::new("load_messages", project_id, None);
        let delivered = self.resolver.attempt(&op, &self.routes.message_load).await?;

        let entries: &[Value] = match &delivered.response.body {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => match map.get("messages") {
                Some(Value::Array(items)) => items.as_slice(),
                _ => &[],
            },
            Value::Null => &[],
            _ => {
                return Err(StoreError::InvalidResponse {
                    target: delivered.route.resolve(project_id),
                    message: "expected an array of messages".to_string(),
                }
                .into());
            }
        };

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_stored_message(project_id, entry) {
                Some(message) => messages.push(message),
                None => warn!(project_id, entry = %entry, "Skipping unreadable stored message"),
            }
        }
        Ok(messages)
    }

    pub async fn save_file_tree(
        &self,
        project_id: &str,
        tree: &FileTree,
    ) -> Result<Delivered, DeliveryExhausted> {
        let body = json!({ "projectId": project_id, "fileTree": tree });
        let op = Operation::new("save_file_tree", project_id, Some(body));
        self.resolver.attempt(&op, &self.routes.file_tree_save).await
    }

    /// Stored tree for a project; a project without one has an empty tree.
    pub async fn load_file_tree(&self, project_id: &str) -> Result<FileTree, SessionError> {
        let op = Operation::new("load_file_tree", project_id, None);
        let delivered = self
            .resolver
            .attempt(&op, &self.routes.file_tree_load)
            .await?;

        let body = &delivered.response.body;
        let tree = body
            .get("project")
            .and_then(|project| project.get("fileTree"))
            .or_else(|| body.get("fileTree"));

        match tree {
            None | Some(Value::Null) => Ok(FileTree::new()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                StoreError::InvalidResponse {
                    target: delivered.route.resolve(project_id),
                    message: format!("unreadable fileTree: {}", e),
                }
                .into()
            }),
        }
    }
}

/// Interpret one stored message entry.
///
/// The sender may be a bare id or an object carrying `_id`; the body may be a
/// string or an object, and assistant bodies stored as JSON strings are
/// decoded back into their structured form.
fn parse_stored_message(project_id: &str, entry: &Value) -> Option<Message> {
    let sender = match entry.get("sender")? {
        Value::String(id) => Sender::from(id.as_str()),
        Value::Object(obj) => {
            let id = obj.get("_id").or_else(|| obj.get("id"))?.as_str()?;
            Sender::from(id)
        }
        _ => return None,
    };

    let body = match entry.get("message")? {
        Value::String(text) if sender.is_assistant() => {
            match serde_json::from_str::<AiPayload>(text) {
                Ok(payload) => MessageBody::Structured(payload),
                Err(_) => MessageBody::Text(text.clone()),
            }
        }
        Value::String(text) => MessageBody::Text(text.clone()),
        value @ Value::Object(_) => {
            MessageBody::Structured(serde_json::from_value::<AiPayload>(value.clone()).ok()?)
        }
        _ => return None,
    };

    let timestamp = entry
        .get("timestamp")
        .or_else(|| entry.get("createdAt"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let id = entry
        .get("id")
        .or_else(|| entry.get("_id"))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    Some(Message {
        id,
        project_id: project_id.to_string(),
        sender,
        message: body,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreSection;
    use crate::session::resolver::RouteKind;
    use crate::session::store::MemoryStore;
    use std::sync::Arc;

    fn adapter(store: Arc<MemoryStore>) -> PersistenceAdapter {
        PersistenceAdapter::new(
            DeliveryResolver::new(store),
            StoreRoutes::from(&StoreSection::default()),
        )
    }

    #[tokio::test]
    async fn test_save_then_load_messages() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter(store.clone());
        let msg = Message::new("p1", Sender::from("u1"), MessageBody::Text("hello".into()));

        let delivered = adapter.save_message(&msg).await.unwrap();
        assert_eq!(delivered.route.kind, RouteKind::SaveMessage);

        let loaded = adapter.load_messages("p1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);
        assert_eq!(loaded[0].message.text(), "hello");
        assert_eq!(loaded[0].sender, Sender::from("u1"));
    }

    #[tokio::test]
    async fn test_load_falls_back_to_wrapped_shape() {
        let store = Arc::new(MemoryStore::new());
        store.seed_messages("p1", vec![json!({"sender": "u1", "message": "one"})]);
        store.fail_route(RouteKind::MessagesByProject);
        let loaded = adapter(store).load_messages("p1").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].message.text(), "one");
    }

    #[tokio::test]
    async fn test_load_tolerates_legacy_entries() {
        let store = Arc::new(MemoryStore::new());
        store.seed_messages(
            "p1",
            vec![
                json!({"sender": {"_id": "u2", "email": "b@x.dev"}, "message": "object sender"}),
                json!({"sender": "ai", "message": "{\"text\":\"done\",\"fileTree\":{\"a.txt\":{\"file\":{\"contents\":\"x\"}}}}"}),
                json!({"sender": "ai", "message": {"text": "structured"}}),
                json!({"message": "no sender"}),
                json!({"sender": "u1", "message": 42}),
            ],
        );
        let loaded = adapter(store).load_messages("p1").await.unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].sender, Sender::from("u2"));
        assert!(loaded[1].sender.is_assistant());
        assert_eq!(
            loaded[1].message.file_tree().unwrap().file_contents("a.txt"),
            Some("x")
        );
        assert_eq!(loaded[2].message.text(), "structured");
    }

    #[tokio::test]
    async fn test_load_messages_exhausted() {
        let store = Arc::new(MemoryStore::new());
        store.fail_route(RouteKind::MessagesByProject);
        store.fail_route(RouteKind::ProjectMessages);
        let err = adapter(store).load_messages("p1").await.unwrap_err();
        assert!(matches!(err, SessionError::DeliveryExhausted(_)));
    }

    #[tokio::test]
    async fn test_file_tree_round_trip_and_missing_tree() {
        let store = Arc::new(MemoryStore::new());
        let adapter = adapter(store.clone());
        assert!(adapter.load_file_tree("p1").await.unwrap().is_empty());

        let tree = FileTree::new().with_file("a.txt", "x");
        adapter.save_file_tree("p1", &tree).await.unwrap();
        assert_eq!(adapter.load_file_tree("p1").await.unwrap(), tree);
    }

    #[tokio::test]
    async fn test_unreadable_stored_tree_is_invalid_response() {
        let store = Arc::new(MemoryStore::new());
        store.seed_tree("p1", json!({"a.txt": {"contents": "missing kind"}}));
        let err = adapter(store).load_file_tree("p1").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Store(StoreError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_parse_stored_message_keeps_uuid_and_timestamp() {
        let id = Uuid::new_v4();
        let entry = json!({
            "id": id.to_string(),
            "sender": "u1",
            "message": "hi",
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let msg = parse_stored_message("p1", &entry).unwrap();
        assert_eq!(msg.id, id);
        assert_eq!(msg.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
