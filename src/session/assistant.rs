//! Hand-off of `@ai` prompts to an external assistant.
//!
//! The engine does not run models. It forwards the prompt; the assistant
//! answers later by posting a message as the reserved `ai` sender.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Prefix marking a human message as a prompt for the assistant.
pub const AI_DIRECTIVE: &str = "@ai";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantDirective {
    pub project_id: String,
    pub prompt: String,
    /// Participant who asked.
    pub sender: String,
}

/// Prompt carried by a message, if it addresses the assistant.
pub fn extract_prompt(text: &str) -> Option<String> {
    if !text.contains(AI_DIRECTIVE) {
        return None;
    }
    Some(text.replacen(AI_DIRECTIVE, "", 1).trim().to_string())
}

#[async_trait]
pub trait AssistantRelay: Send + Sync {
    async fn dispatch(&self, directive: AssistantDirective) -> Result<()>;
}

pub struct WebhookAssistant {
    client: reqwest::Client,
    url: String,
}

impl WebhookAssistant {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build assistant HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AssistantRelay for WebhookAssistant {
    async fn dispatch(&self, directive: AssistantDirective) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&directive)
            .send()
            .await
            .with_context(|| format!("Failed to reach assistant at {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Assistant at {} answered HTTP {}", self.url, status);
        }
        debug!(project_id = %directive.project_id, "Prompt handed to assistant");
        Ok(())
    }
}
