use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::api::{self, AppState, SharedState};
use super::assistant::WebhookAssistant;
use super::coordinator::{RunSettings, SandboxCoordinator};
use super::identity::{HttpIdentity, IdentityProvider, StaticIdentity};
use super::persistence::{PersistenceAdapter, StoreRoutes};
use super::registry::RoomRegistry;
use super::resolver::DeliveryResolver;
use super::router::MessageRouter;
use super::sandbox::LocalSandbox;
use super::store::{DurableStore, HttpStore, MemoryStore};
use super::transport::TopicHub;
use super::ws;
use crate::config::EngineConfig;

/// Wire every engine component from configuration.
pub fn build_state(config: &EngineConfig) -> Result<SharedState> {
    let store: Arc<dyn DurableStore> = match &config.store.base_url {
        Some(base_url) => Arc::new(HttpStore::new(
            base_url,
            config.store.service_token.clone(),
            config.store.request_timeout(),
        )?),
        None => {
            warn!("No durable store configured; room state lives in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let adapter = Arc::new(PersistenceAdapter::new(
        DeliveryResolver::new(store),
        StoreRoutes::from(&config.store),
    ));
    let hub = Arc::new(TopicHub::new(config.rooms.broadcast_capacity));
    let registry = Arc::new(RoomRegistry::new(hub, adapter, config.rooms.clone()));

    let sandbox = Arc::new(LocalSandbox::from_config(&config.sandbox));
    let coordinator = Arc::new(SandboxCoordinator::new(
        registry.clone(),
        sandbox,
        RunSettings::from(&config.sandbox),
    ));

    let mut router = MessageRouter::new(registry.clone());
    if let Some(url) = &config.assistant.webhook_url {
        let relay = WebhookAssistant::new(url, config.store.request_timeout())?;
        router = router.with_assistant(Arc::new(relay));
    }
    if config.sandbox.auto_run_on_ai_tree {
        router = router.with_auto_run(coordinator.clone());
    }

    let identity: Arc<dyn IdentityProvider> = match &config.identity.endpoint {
        Some(endpoint) => Arc::new(HttpIdentity::new(
            endpoint,
            config.store.request_timeout(),
        )?),
        None => {
            if config.identity.tokens.is_empty() {
                warn!("No identity endpoint or static tokens configured; every connection will be rejected");
            }
            Arc::new(StaticIdentity::from_config(&config.identity))
        }
    };

    Ok(Arc::new(AppState {
        registry,
        router,
        coordinator,
        identity,
    }))
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .route("/ws/{project_id}", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Start the engine and serve until Ctrl+C, then flush every live room.
pub async fn start_server(config: EngineConfig) -> Result<()> {
    let state = build_state(&config)?;
    let app = build_router(state.clone(), config.server.dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "devroom listening");
    println!("devroom running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.registry.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    info!("Shutting down");
}
