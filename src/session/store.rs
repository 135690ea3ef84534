//! Durable store backends.
//!
//! The engine treats the store as an eventually-reachable sink addressed by
//! `(method, path, body)`. [`HttpStore`] talks to a real backend over reqwest;
//! [`MemoryStore`] keeps everything in process and is used when no backend is
//! configured, and by tests that need to inject route failures.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::resolver::{RouteKind, RouteMethod};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub kind: RouteKind,
    pub method: RouteMethod,
    pub project_id: String,
    /// Resolved path, e.g. `/projects/p1/messages`.
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct StoreResponse {
    pub status: u16,
    pub body: Value,
}

impl StoreResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Issue one request. Transport failures are errors; any HTTP status,
    /// including failures, comes back as a response.
    async fn send(&self, request: &StoreRequest) -> Result<StoreResponse, StoreError>;
}

// ── HTTP backend ─────────────────────────────────────────────────────

pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    service_token: Option<String>,
}

impl HttpStore {
    pub fn new(
        base_url: impl Into<String>,
        service_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build durable store HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl DurableStore for HttpStore {
    async fn send(&self, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
        let url = self.url(&request.path);
        let method = match request.method {
            RouteMethod::Get => reqwest::Method::GET,
            RouteMethod::Post => reqwest::Method::POST,
            RouteMethod::Put => reqwest::Method::PUT,
        };

        let mut builder = self.client.request(method, &url);
        if let Some(token) = &self.service_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| StoreError::Transport {
            method: request.method.to_string(),
            target: request.path.clone(),
            message: e.to_string(),
        })?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| StoreError::Transport {
            method: request.method.to_string(),
            target: request.path.clone(),
            message: e.to_string(),
        })?;

        // Success bodies are not always JSON (some backends answer "OK").
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(StoreResponse::new(status, body))
    }
}

// ── In-process backend ───────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    trees: HashMap<String, Value>,
    messages: HashMap<String, Vec<Value>>,
    failing: HashSet<RouteKind>,
    /// Call log, kept only by [`MemoryStore::recording`].
    calls: Option<Vec<RouteKind>>,
}

/// Store that answers every canonical route from memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that also logs every route kind it is asked for.
    pub fn recording() -> Self {
        let store = Self::new();
        store.lock().calls = Some(Vec::new());
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call on `kind` answer HTTP 503 until healed.
    pub fn fail_route(&self, kind: RouteKind) {
        self.lock().failing.insert(kind);
    }

    pub fn heal_route(&self, kind: RouteKind) {
        self.lock().failing.remove(&kind);
    }

    /// Route kinds invoked so far, in call order. Empty unless recording.
    pub fn calls(&self) -> Vec<RouteKind> {
        self.lock().calls.clone().unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Some(calls) = self.lock().calls.as_mut() {
            calls.clear();
        }
    }

    pub fn stored_messages(&self, project_id: &str) -> Vec<Value> {
        self.lock()
            .messages
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stored_tree(&self, project_id: &str) -> Option<Value> {
        self.lock().trees.get(project_id).cloned()
    }

    pub fn seed_tree(&self, project_id: &str, tree: Value) {
        self.lock().trees.insert(project_id.to_string(), tree);
    }

    pub fn seed_messages(&self, project_id: &str, messages: Vec<Value>) {
        self.lock()
            .messages
            .insert(project_id.to_string(), messages);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn send(&self, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
        let mut inner = self.lock();
        if let Some(calls) = inner.calls.as_mut() {
            calls.push(request.kind);
        }

        if inner.failing.contains(&request.kind) {
            return Ok(StoreResponse::new(
                503,
                json!({"error": "route unavailable"}),
            ));
        }

        let project_id = request.project_id.clone();
        let response = match (request.kind, request.method) {
            (
                RouteKind::SaveMessage | RouteKind::MessagesCollection | RouteKind::ProjectMessages,
                RouteMethod::Post,
            ) => {
                let Some(body) = request.body.clone() else {
                    return Ok(StoreResponse::new(400, json!({"error": "missing body"})));
                };
                inner
                    .messages
                    .entry(project_id)
                    .or_default()
                    .push(body.clone());
                StoreResponse::new(201, json!({ "message": body }))
            }
            (RouteKind::MessagesByProject, RouteMethod::Get) => {
                let messages = inner.messages.get(&project_id).cloned().unwrap_or_default();
                StoreResponse::new(200, Value::Array(messages))
            }
            (RouteKind::ProjectMessages, RouteMethod::Get) => {
                let messages = inner.messages.get(&project_id).cloned().unwrap_or_default();
                StoreResponse::new(200, json!({ "messages": messages }))
            }
            (RouteKind::FileTreeUpdate, RouteMethod::Put) => {
                let Some(tree) = request.body.as_ref().and_then(|b| b.get("fileTree")).cloned()
                else {
                    return Ok(StoreResponse::new(400, json!({"error": "fileTree is required"})));
                };
                inner.trees.insert(project_id.clone(), tree.clone());
                StoreResponse::new(200, json!({"project": {"_id": project_id, "fileTree": tree}}))
            }
            (RouteKind::ProjectLookup, RouteMethod::Get) => {
                let tree = inner.trees.get(&project_id).cloned().unwrap_or(json!({}));
                StoreResponse::new(200, json!({"project": {"_id": project_id, "fileTree": tree}}))
            }
            _ => StoreResponse::new(405, json!({"error": "method not allowed"})),
        };

        Ok(response)
    }
}
