//! Persistence over HTTP against a mock durable store.
//!
//! The mock serves only some of the configured routes, so every operation
//! exercises the ordered fallback.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    routing::{get, post, put},
};
use devroom::config::{RoomsSection, StoreSection};
use devroom::session::persistence::{PersistenceAdapter, StoreRoutes};
use devroom::session::registry::RoomRegistry;
use devroom::session::resolver::{DeliveryResolver, RouteKind};
use devroom::session::store::HttpStore;
use devroom::session::transport::TopicHub;
use devroom_common::{FileTree, Message, MessageBody, Participant, Sender};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SERVICE_TOKEN: &str = "svc-token";

#[derive(Default)]
struct MockStore {
    hits: Mutex<Vec<String>>,
    messages: Mutex<HashMap<String, Vec<Value>>>,
    trees: Mutex<HashMap<String, Value>>,
}

type Shared = Arc<MockStore>;

impl MockStore {
    fn hit(&self, line: String) {
        self.hits.lock().unwrap().push(line);
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", SERVICE_TOKEN))
}

async fn legacy_save(State(mock): State<Shared>) -> StatusCode {
    mock.hit("POST /api/messages/save".into());
    StatusCode::NOT_FOUND
}

async fn collection_save(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    mock.hit("POST /api/messages".into());
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no"})));
    }
    let project_id = body["projectId"].as_str().unwrap_or_default().to_string();
    mock.messages
        .lock()
        .unwrap()
        .entry(project_id)
        .or_default()
        .push(body);
    (StatusCode::CREATED, Json(json!({"ok": true})))
}

async fn project_messages_save(
    State(mock): State<Shared>,
    Path(project_id): Path<String>,
) -> StatusCode {
    mock.hit(format!("POST /projects/{}/messages", project_id));
    StatusCode::UNAUTHORIZED
}

async fn messages_by_project(
    State(mock): State<Shared>,
    Path(project_id): Path<String>,
) -> StatusCode {
    mock.hit(format!("GET /api/messages/{}", project_id));
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn project_messages(
    State(mock): State<Shared>,
    Path(project_id): Path<String>,
) -> Json<Value> {
    mock.hit(format!("GET /projects/{}/messages", project_id));
    let messages = mock
        .messages
        .lock()
        .unwrap()
        .get(&project_id)
        .cloned()
        .unwrap_or_default();
    Json(json!({ "messages": messages }))
}

async fn update_tree(
    State(mock): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    mock.hit("PUT /projects/update-file-tree".into());
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let project_id = body["projectId"].as_str().unwrap_or_default().to_string();
    mock.trees
        .lock()
        .unwrap()
        .insert(project_id, body["fileTree"].clone());
    StatusCode::OK
}

async fn get_project(State(mock): State<Shared>, Path(project_id): Path<String>) -> Json<Value> {
    mock.hit(format!("GET /projects/get-project/{}", project_id));
    match mock.trees.lock().unwrap().get(&project_id) {
        Some(tree) => Json(json!({ "project": { "_id": project_id, "fileTree": tree } })),
        None => Json(json!({ "project": { "_id": project_id } })),
    }
}

async fn spawn_mock() -> (Shared, String) {
    let mock: Shared = Arc::default();
    let app = Router::new()
        .route("/api/messages/save", post(legacy_save))
        .route("/api/messages", post(collection_save))
        .route("/api/messages/{project_id}", get(messages_by_project))
        .route(
            "/projects/{project_id}/messages",
            post(project_messages_save).get(project_messages),
        )
        .route("/projects/update-file-tree", put(update_tree))
        .route("/projects/get-project/{project_id}", get(get_project))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{}", addr))
}

fn adapter(base_url: &str, token: &str) -> Arc<PersistenceAdapter> {
    let store = HttpStore::new(base_url, Some(token.to_string()), Duration::from_secs(5)).unwrap();
    Arc::new(PersistenceAdapter::new(
        DeliveryResolver::new(Arc::new(store)),
        StoreRoutes::from(&StoreSection::default()),
    ))
}

#[tokio::test]
async fn test_save_message_falls_back_to_second_route() {
    let (mock, base_url) = spawn_mock().await;
    let adapter = adapter(&base_url, SERVICE_TOKEN);

    let message = Message::new("p1", Sender::from("u1"), MessageBody::Text("hello".into()));
    let delivered = adapter.save_message(&message).await.unwrap();

    assert_eq!(delivered.position, 1);
    assert_eq!(delivered.route.kind, RouteKind::MessagesCollection);
    assert_eq!(
        mock.hits(),
        vec!["POST /api/messages/save", "POST /api/messages"]
    );
}

#[tokio::test]
async fn test_load_messages_falls_back_and_parses() {
    let (mock, base_url) = spawn_mock().await;
    let adapter = adapter(&base_url, SERVICE_TOKEN);

    let first = Message::new("p1", Sender::from("u1"), MessageBody::Text("one".into()));
    let second = Message::new("p1", Sender::Assistant, MessageBody::Text("two".into()));
    adapter.save_message(&first).await.unwrap();
    adapter.save_message(&second).await.unwrap();

    let loaded = adapter.load_messages("p1").await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].id, first.id);
    assert_eq!(loaded[0].message.text(), "one");
    assert!(loaded[1].sender.is_assistant());

    let hits = mock.hits();
    assert!(hits.contains(&"GET /api/messages/p1".to_string()));
    assert_eq!(hits.last().unwrap(), "GET /projects/p1/messages");
}

#[tokio::test]
async fn test_every_route_rejected_exhausts_delivery() {
    let (mock, base_url) = spawn_mock().await;
    let adapter = adapter(&base_url, "wrong-token");

    let message = Message::new("p1", Sender::from("u1"), MessageBody::Text("hello".into()));
    let err = adapter.save_message(&message).await.unwrap_err();

    assert_eq!(err.attempted, 3);
    assert_eq!(err.operation, "save_message");
    assert!(err.last_error.contains("401"), "{}", err.last_error);
    assert_eq!(mock.hits().len(), 3);
}

#[tokio::test]
async fn test_project_without_tree_loads_empty() {
    let (_mock, base_url) = spawn_mock().await;
    let adapter = adapter(&base_url, SERVICE_TOKEN);
    assert!(adapter.load_file_tree("fresh").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_path_stays_deleted_after_reload() {
    let (_mock, base_url) = spawn_mock().await;
    let registry = RoomRegistry::new(
        Arc::new(TopicHub::new(64)),
        adapter(&base_url, SERVICE_TOKEN),
        RoomsSection::default(),
    );
    let alice = Sender::from("alice");

    registry.join("p1", Participant::new("alice")).await.unwrap();
    let room = registry.get("p1").unwrap();
    room.apply_file_tree_update(
        FileTree::new()
            .with_file("index.js", "console.log(1)")
            .with_file("old.js", "gone soon"),
        &alice,
    )
    .await
    .unwrap();
    room.remove_path("old.js", &alice).await.unwrap();
    room.sync_persistence().await;
    registry.leave("p1", "alice").await.unwrap();

    let joined = registry.join("p1", Participant::new("alice")).await.unwrap();
    assert!(joined.first_join);
    assert_eq!(joined.snapshot.file_tree.file_paths(), vec!["index.js"]);
}
