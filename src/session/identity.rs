//! Resolves connection credentials to participants.
//!
//! Credential precedence: the `token` cookie, then the `Authorization`
//! header, then a `token` query parameter (browsers cannot set headers on a
//! WebSocket upgrade).

use anyhow::Context;
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use devroom_common::{AI_SENDER_ID, Participant};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{IdentitySection, TokenEntry};
use crate::errors::IdentityError;

const TOKEN_COOKIE: &str = "token";

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Participant, IdentityError>;
}

/// Pull the credential out of a request.
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.trim().to_string());

    let from_header = || {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| {
                value
                    .strip_prefix("Bearer ")
                    .unwrap_or(value)
                    .trim()
                    .to_string()
            })
    };

    from_cookie
        .or_else(from_header)
        .or_else(|| query_token.map(|t| t.trim().to_string()))
        .filter(|token| !token.is_empty())
}

/// Token table from configuration.
pub struct StaticIdentity {
    tokens: BTreeMap<String, TokenEntry>,
    ai_token: Option<String>,
}

impl StaticIdentity {
    pub fn new(tokens: BTreeMap<String, TokenEntry>, ai_token: Option<String>) -> Self {
        Self { tokens, ai_token }
    }

    pub fn from_config(section: &IdentitySection) -> Self {
        Self::new(section.tokens.clone(), section.ai_token.clone())
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn authenticate(&self, credential: &str) -> Result<Participant, IdentityError> {
        if credential.is_empty() {
            return Err(IdentityError::MissingCredential);
        }
        if self.ai_token.as_deref() == Some(credential) {
            return Ok(Participant::new(AI_SENDER_ID));
        }
        let entry = self.tokens.get(credential).ok_or(IdentityError::Rejected)?;
        // the reserved id is only reachable through the assistant token
        if entry.id == AI_SENDER_ID {
            return Err(IdentityError::Rejected);
        }
        Ok(Participant {
            id: entry.id.clone(),
            display_name: entry.display_name.clone(),
        })
    }
}

/// Delegates to an external identity endpoint with the credential as bearer.
pub struct HttpIdentity {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpIdentity {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build identity HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentity {
    async fn authenticate(&self, credential: &str) -> Result<Participant, IdentityError> {
        if credential.is_empty() {
            return Err(IdentityError::MissingCredential);
        }
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(IdentityError::Rejected);
        }
        if !status.is_success() {
            return Err(IdentityError::Unavailable(format!("HTTP {}", status)));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| IdentityError::Unavailable(format!("invalid response: {}", e)))?;

        let participant = parse_identity(&body).ok_or_else(|| {
            IdentityError::Unavailable("response carries no participant id".to_string())
        })?;
        if participant.id == AI_SENDER_ID {
            return Err(IdentityError::Rejected);
        }
        debug!(participant = %participant.id, "Credential verified");
        Ok(participant)
    }
}

/// Accepts `{ user: { _id, email } }`, `{ _id, email }` or `{ id, displayName }`.
fn parse_identity(body: &Value) -> Option<Participant> {
    let user = body.get("user").unwrap_or(body);
    let id = user
        .get("_id")
        .or_else(|| user.get("id"))
        .and_then(Value::as_str)?;
    let display_name = user
        .get("displayName")
        .or_else(|| user.get("name"))
        .or_else(|| user.get("email"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(Participant {
        id: id.to_string(),
        display_name,
    })
}
