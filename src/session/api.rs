use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use devroom_common::{FileTree, Participant};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use super::coordinator::SandboxCoordinator;
use super::identity::{IdentityProvider, extract_credential};
use super::registry::RoomRegistry;
use super::router::MessageRouter;
use crate::errors::{IdentityError, SessionError};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub router: MessageRouter,
    pub coordinator: Arc<SandboxCoordinator>,
    pub identity: Arc<dyn IdentityProvider>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub message: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceTreeRequest {
    pub file_tree: FileTree,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::UnknownRoom { .. } => ApiError::NotFound(message),
            SessionError::EmptyMessage | SessionError::MalformedPayload(_) => {
                ApiError::BadRequest(message)
            }
            SessionError::Unauthorized(_) => ApiError::Unauthorized(message),
            SessionError::DeliveryExhausted(_)
            | SessionError::SandboxFailure(_)
            | SessionError::Store(_) => ApiError::Internal(message),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Unavailable(reason) => {
                warn!(reason = %reason, "Identity provider unavailable");
                ApiError::Internal("Identity provider unavailable".to_string())
            }
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}

/// Resolve the caller from cookie, header or `?token=`.
pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Participant, ApiError> {
    let credential =
        extract_credential(headers, query_token).ok_or(IdentityError::MissingCredential)?;
    Ok(state.identity.authenticate(&credential).await?)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{project_id}/room", get(get_room))
        .route("/api/projects/{project_id}/messages", post(post_message))
        .route("/api/projects/{project_id}/file-tree", put(replace_file_tree))
        .route("/api/projects/{project_id}/run", post(run_sandbox))
        .route("/api/projects/{project_id}/stop", post(stop_sandbox))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_room(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers, query.token.as_deref()).await?;
    let room = state.registry.get(&project_id)?;
    Ok(Json(room.snapshot().await?))
}

async fn post_message(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(req): Json<PostMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(&state, &headers, query.token.as_deref()).await?;
    let receipt = state
        .router
        .route(&project_id, &caller.sender(), &req.message)
        .await?;

    let mut body = json!({ "message": receipt.message });
    if let Some(tree) = receipt.file_tree {
        body["fileTree"] = json!(tree);
    }
    if let Some(warning) = receipt.warning {
        body["warning"] = json!({ "code": warning.code(), "message": warning.to_string() });
    }
    Ok((StatusCode::CREATED, Json(body)))
}

async fn replace_file_tree(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    Json(req): Json<ReplaceTreeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(&state, &headers, query.token.as_deref()).await?;
    let tree = state
        .router
        .update_file_tree(&project_id, &caller.sender(), req.file_tree)
        .await?;
    Ok(Json(json!({ "fileTree": tree })))
}

async fn run_sandbox(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate(&state, &headers, query.token.as_deref()).await?;
    let started = state.coordinator.run(&project_id, &caller.id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "runId": started.run_id, "replaced": started.replaced })),
    ))
}

async fn stop_sandbox(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authenticate(&state, &headers, query.token.as_deref()).await?;
    let stopped = state.coordinator.stop(&project_id).await?;
    Ok(Json(json!({ "stopped": stopped })))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{IdentitySection, RoomsSection, StoreSection, TokenEntry};
    use crate::session::coordinator::RunSettings;
    use crate::session::identity::StaticIdentity;
    use crate::session::persistence::{PersistenceAdapter, StoreRoutes};
    use crate::session::resolver::DeliveryResolver;
    use crate::session::sandbox::LocalSandbox;
    use crate::session::store::MemoryStore;
    use crate::session::transport::TopicHub;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    /// State backed by an in-memory store, a static token table and a local
    /// sandbox whose start command just sleeps.
    pub(crate) fn test_state(workspace: &TempDir) -> SharedState {
        let adapter = Arc::new(PersistenceAdapter::new(
            DeliveryResolver::new(Arc::new(MemoryStore::new())),
            StoreRoutes::from(&StoreSection::default()),
        ));
        let registry = Arc::new(RoomRegistry::new(
            Arc::new(TopicHub::new(64)),
            adapter,
            RoomsSection::default(),
        ));

        let mut identity = IdentitySection::default();
        for (token, id) in [("alice-token", "alice"), ("bob-token", "bob")] {
            identity.tokens.insert(
                token.to_string(),
                TokenEntry {
                    id: id.to_string(),
                    display_name: None,
                },
            );
        }
        identity.ai_token = Some("ai-token".to_string());

        let sandbox = Arc::new(LocalSandbox::new(workspace.path(), "localhost"));
        let coordinator = Arc::new(SandboxCoordinator::new(
            registry.clone(),
            sandbox,
            RunSettings {
                manifest: "package.json".to_string(),
                install: vec!["true".to_string()],
                start: vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
                install_timeout: Duration::from_secs(5),
                ready_timeout: Duration::from_secs(30),
            },
        ));

        Arc::new(AppState {
            router: MessageRouter::new(registry.clone()),
            registry,
            coordinator,
            identity: Arc::new(StaticIdentity::from_config(&identity)),
        })
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json(body: Body) -> Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = TempDir::new().unwrap();
        let app = test_app(test_state(&dir));

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_or_bad_credential_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let request = Request::builder()
            .uri("/api/projects/p1/room")
            .body(Body::empty())
            .unwrap();
        let response = test_app(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = test_app(state)
            .oneshot(authed("GET", "/api/projects/p1/room", "wrong", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response.into_body()).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let dir = TempDir::new().unwrap();
        let app = test_app(test_state(&dir));

        let response = app
            .oneshot(authed(
                "POST",
                "/api/projects/ghost/messages",
                "alice-token",
                Some(json!({"message": "hi"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ai_message_via_http_updates_room() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .registry
            .join("p1", Participant::new("alice"))
            .await
            .unwrap();

        let response = test_app(state.clone())
            .oneshot(authed(
                "POST",
                "/api/projects/p1/messages",
                "ai-token",
                Some(json!({
                    "message": {"text": "done", "fileTree": {"a.txt": {"file": {"contents": "x"}}}}
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["message"]["sender"], "ai");
        assert!(body.get("warning").is_none());

        let response = test_app(state)
            .oneshot(authed("GET", "/api/projects/p1/room?token=x", "bob-token", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let snapshot = body_json(response.into_body()).await;
        assert_eq!(snapshot["fileTree"]["a.txt"]["file"]["contents"], "x");
        assert_eq!(snapshot["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_message_is_bad_request() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .registry
            .join("p1", Participant::new("alice"))
            .await
            .unwrap();

        let response = test_app(state)
            .oneshot(authed(
                "POST",
                "/api/projects/p1/messages",
                "alice-token",
                Some(json!({"message": "   "})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_replace_file_tree() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .registry
            .join("p1", Participant::new("alice"))
            .await
            .unwrap();

        let response = test_app(state.clone())
            .oneshot(authed(
                "PUT",
                "/api/projects/p1/file-tree",
                "alice-token",
                Some(json!({"fileTree": {"index.js": {"file": {"contents": "1"}}}})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let room = state.registry.get("p1").unwrap();
        let snap = room.snapshot().await.unwrap();
        assert_eq!(snap.file_tree.file_contents("index.js"), Some("1"));
        assert_eq!(snap.tree_version, 1);
    }

    #[tokio::test]
    async fn test_run_then_stop() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        state
            .registry
            .join("p1", Participant::new("alice"))
            .await
            .unwrap();

        let response = test_app(state.clone())
            .oneshot(authed("POST", "/api/projects/p1/run", "alice-token", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["runId"], 1);
        assert_eq!(body["replaced"], false);

        let response = test_app(state.clone())
            .oneshot(authed("POST", "/api/projects/p1/stop", "alice-token", None))
            .await
            .unwrap();
        let body = body_json(response.into_body()).await;
        assert_eq!(body["stopped"], true);

        let response = test_app(state)
            .oneshot(authed("POST", "/api/projects/p1/stop", "alice-token", None))
            .await
            .unwrap();
        let body = body_json(response.into_body()).await;
        assert_eq!(body["stopped"], false);
    }
}
