//! Ordered-fallback delivery of persistence operations.
//!
//! A [`DeliveryRoute`] is one candidate way of reaching the durable store. The
//! [`DeliveryResolver`] walks a configured route list in order, invokes each
//! route at most once and stops at the first success. It never retries and
//! never raises past its boundary: exhausting the list is a value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::store::{DurableStore, StoreRequest, StoreResponse};
use crate::errors::{DeliveryExhausted, StoreError};

/// What a route does on the store side. Only the store looks at this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    SaveMessage,
    MessagesCollection,
    ProjectMessages,
    MessagesByProject,
    FileTreeUpdate,
    ProjectLookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    Get,
    Post,
    Put,
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteMethod::Get => write!(f, "GET"),
            RouteMethod::Post => write!(f, "POST"),
            RouteMethod::Put => write!(f, "PUT"),
        }
    }
}

/// One candidate route. `target` may contain a `{project_id}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRoute {
    pub kind: RouteKind,
    pub method: RouteMethod,
    pub target: String,
}

impl DeliveryRoute {
    pub fn new(kind: RouteKind, method: RouteMethod, target: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            target: target.into(),
        }
    }

    /// Target path with the project id substituted.
    pub fn resolve(&self, project_id: &str) -> String {
        self.target.replace("{project_id}", project_id)
    }

    /// Issue this route once against `store`.
    pub async fn invoke(
        &self,
        store: &dyn DurableStore,
        operation: &Operation,
    ) -> Result<StoreResponse, StoreError> {
        let request = StoreRequest {
            kind: self.kind,
            method: self.method,
            project_id: operation.project_id.clone(),
            path: self.resolve(&operation.project_id),
            body: operation.body.clone(),
        };
        let response = store.send(&request).await?;
        if !response.is_success() {
            return Err(StoreError::Status {
                method: self.method.to_string(),
                target: request.path,
                status: response.status,
            });
        }
        Ok(response)
    }
}

impl std::fmt::Display for DeliveryRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.target)
    }
}

/// A persistence operation to deliver over some route list.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: &'static str,
    pub project_id: String,
    pub body: Option<Value>,
}

impl Operation {
    pub fn new(name: &'static str, project_id: impl Into<String>, body: Option<Value>) -> Self {
        Self {
            name,
            project_id: project_id.into(),
            body,
        }
    }
}

/// The route that accepted an operation, and what it answered.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub route: DeliveryRoute,
    pub position: usize,
    pub response: StoreResponse,
}

#[derive(Clone)]
pub struct DeliveryResolver {
    store: Arc<dyn DurableStore>,
}

impl DeliveryResolver {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn attempt(
        &self,
        operation: &Operation,
        routes: &[DeliveryRoute],
    ) -> Result<Delivered, DeliveryExhausted> {
        let mut last_error = None;

        for (position, route) in routes.iter().enumerate() {
            match route.invoke(self.store.as_ref(), operation).await {
                Ok(response) => {
                    debug!(
                        operation = operation.name,
                        project_id = %operation.project_id,
                        route = %route,
                        position,
                        "Delivered"
                    );
                    return Ok(Delivered {
                        route: route.clone(),
                        position,
                        response,
                    });
                }
                Err(e) => {
                    debug!(
                        operation = operation.name,
                        project_id = %operation.project_id,
                        route = %route,
                        error = %e,
                        "Route failed, trying next"
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        let exhausted = DeliveryExhausted {
            operation: operation.name.to_string(),
            attempted: routes.len(),
            last_error: last_error.unwrap_or_else(|| "no routes configured".to_string()),
        };
        warn!(
            operation = operation.name,
            project_id = %operation.project_id,
            attempted = exhausted.attempted,
            last_error = %exhausted.last_error,
            "All delivery routes failed"
        );
        Err(exhausted)
    }
}
