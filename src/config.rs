//! Engine configuration read from `.devroom/devroom.toml`.
//!
//! Layering is file → environment → CLI flags. Every section and field has a
//! default, so a missing file yields a runnable development setup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4100
//!
//! [rooms]
//! message_buffer_cap = 200
//! load_timeout_ms = 5000
//!
//! [store]
//! base_url = "http://localhost:3000"
//!
//! [[store.message_save]]
//! kind = "save_message"
//! method = "POST"
//! target = "/api/messages/save"
//!
//! [sandbox]
//! root = ".devroom/sandboxes"
//! manifest = "package.json"
//! install = ["npm", "install"]
//! start = ["npm", "start"]
//!
//! [identity.tokens.dev-token]
//! id = "alice"
//! display_name = "Alice"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::resolver::{DeliveryRoute, RouteKind, RouteMethod};

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".devroom/devroom.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub rooms: RoomsSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub assistant: AssistantSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Enables permissive CORS for browser clients on other origins.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4100
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsSection {
    /// Oldest messages are evicted from a room's buffer beyond this many.
    #[serde(default = "default_message_buffer_cap")]
    pub message_buffer_cap: usize,
    /// Upper bound on loading tree and history when a room is first joined.
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// Per-topic broadcast buffer; slower subscribers lag and get resynced.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Messages kept for retry after every save route failed.
    #[serde(default = "default_persist_backlog_cap")]
    pub persist_backlog_cap: usize,
}

fn default_message_buffer_cap() -> usize {
    200
}

fn default_load_timeout_ms() -> u64 {
    5_000
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_persist_backlog_cap() -> usize {
    100
}

impl Default for RoomsSection {
    fn default() -> Self {
        Self {
            message_buffer_cap: default_message_buffer_cap(),
            load_timeout_ms: default_load_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            persist_backlog_cap: default_persist_backlog_cap(),
        }
    }
}

impl RoomsSection {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Base URL of the durable store. Unset means an in-process memory store.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token the engine presents to the durable store.
    #[serde(default)]
    pub service_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_message_save_routes")]
    pub message_save: Vec<DeliveryRoute>,
    #[serde(default = "default_message_load_routes")]
    pub message_load: Vec<DeliveryRoute>,
    #[serde(default = "default_file_tree_save_routes")]
    pub file_tree_save: Vec<DeliveryRoute>,
    #[serde(default = "default_file_tree_load_routes")]
    pub file_tree_load: Vec<DeliveryRoute>,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_message_save_routes() -> Vec<DeliveryRoute> {
    vec![
        DeliveryRoute::new(RouteKind::SaveMessage, RouteMethod::Post, "/api/messages/save"),
        DeliveryRoute::new(
            RouteKind::MessagesCollection,
            RouteMethod::Post,
            "/api/messages",
        ),
        DeliveryRoute::new(
            RouteKind::ProjectMessages,
            RouteMethod::Post,
            "/projects/{project_id}/messages",
        ),
    ]
}

fn default_message_load_routes() -> Vec<DeliveryRoute> {
    vec![
        DeliveryRoute::new(
            RouteKind::MessagesByProject,
            RouteMethod::Get,
            "/api/messages/{project_id}",
        ),
        DeliveryRoute::new(
            RouteKind::ProjectMessages,
            RouteMethod::Get,
            "/projects/{project_id}/messages",
        ),
    ]
}

fn default_file_tree_save_routes() -> Vec<DeliveryRoute> {
    vec![DeliveryRoute::new(
        RouteKind::FileTreeUpdate,
        RouteMethod::Put,
        "/projects/update-file-tree",
    )]
}

fn default_file_tree_load_routes() -> Vec<DeliveryRoute> {
    vec![DeliveryRoute::new(
        RouteKind::ProjectLookup,
        RouteMethod::Get,
        "/projects/get-project/{project_id}",
    )]
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: None,
            service_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            message_save: default_message_save_routes(),
            message_load: default_message_load_routes(),
            file_tree_save: default_file_tree_save_routes(),
            file_tree_load: default_file_tree_load_routes(),
        }
    }
}

impl StoreSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSection {
    /// Directory holding one workspace per project.
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    /// Path whose presence in a snapshot triggers the install step.
    #[serde(default = "default_manifest")]
    pub manifest: String,
    #[serde(default = "default_install")]
    pub install: Vec<String>,
    #[serde(default = "default_start")]
    pub start: Vec<String>,
    /// Host used when building the preview URL handed to clients.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Workspace entries left in place when a new snapshot is mounted.
    #[serde(default = "default_preserve")]
    pub preserve: Vec<String>,
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Start a run whenever the assistant replaces the file tree.
    #[serde(default)]
    pub auto_run_on_ai_tree: bool,
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from(".devroom/sandboxes")
}

fn default_manifest() -> String {
    "package.json".to_string()
}

fn default_install() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

fn default_start() -> Vec<String> {
    vec!["npm".to_string(), "start".to_string()]
}

fn default_public_host() -> String {
    "localhost".to_string()
}

fn default_preserve() -> Vec<String> {
    vec!["node_modules".to_string()]
}

fn default_install_timeout_secs() -> u64 {
    300
}

fn default_ready_timeout_secs() -> u64 {
    120
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            manifest: default_manifest(),
            install: default_install(),
            start: default_start(),
            public_host: default_public_host(),
            preserve: default_preserve(),
            install_timeout_secs: default_install_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            auto_run_on_ai_tree: false,
        }
    }
}

/// One entry of the static token table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    /// Remote identity endpoint. When unset the static token table is used.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenEntry>,
    /// Service credential the assistant producer authenticates with.
    #[serde(default)]
    pub ai_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantSection {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse devroom.toml")
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `DEVROOM_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `DEVROOM_*` overrides using `lookup` as the environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("DEVROOM_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid DEVROOM_PORT '{}'", port))?;
        }
        if let Some(host) = lookup("DEVROOM_HOST") {
            self.server.host = host;
        }
        if let Some(url) = lookup("DEVROOM_STORE_URL") {
            self.store.base_url = Some(url);
        }
        if let Some(token) = lookup("DEVROOM_STORE_TOKEN") {
            self.store.service_token = Some(token);
        }
        if let Some(url) = lookup("DEVROOM_IDENTITY_URL") {
            self.identity.endpoint = Some(url);
        }
        if let Some(url) = lookup("DEVROOM_ASSISTANT_URL") {
            self.assistant.webhook_url = Some(url);
        }
        if let Some(root) = lookup("DEVROOM_SANDBOX_ROOT") {
            self.sandbox.root = PathBuf::from(root);
        }
        Ok(())
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.rooms.message_buffer_cap == 0 {
            problems.push("rooms.message_buffer_cap must be greater than zero".to_string());
        }
        if self.rooms.broadcast_capacity == 0 {
            problems.push("rooms.broadcast_capacity must be greater than zero".to_string());
        }

        let route_lists = [
            ("store.message_save", &self.store.message_save),
            ("store.message_load", &self.store.message_load),
            ("store.file_tree_save", &self.store.file_tree_save),
            ("store.file_tree_load", &self.store.file_tree_load),
        ];
        for (name, routes) in route_lists {
            if routes.is_empty() {
                problems.push(format!("{} must list at least one route", name));
            }
            for route in routes.iter() {
                if !route.target.starts_with('/') {
                    problems.push(format!(
                        "{}: route target '{}' must start with '/'",
                        name, route.target
                    ));
                }
            }
        }

        if self.sandbox.install.is_empty() {
            problems.push("sandbox.install must name a command".to_string());
        }
        if self.sandbox.start.is_empty() {
            problems.push("sandbox.start must name a command".to_string());
        }
        if self.sandbox.manifest.trim().is_empty() {
            problems.push("sandbox.manifest must not be empty".to_string());
        }

        if let Some(ai_token) = &self.identity.ai_token
            && self.identity.tokens.contains_key(ai_token)
        {
            problems.push("identity.ai_token must not also appear in identity.tokens".to_string());
        }

        problems
    }

    /// Fail with every validation problem joined into one message.
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
