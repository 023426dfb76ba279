//! Agent HTTP Server
//!
//! Axum-based server exposing the agent over a REST endpoint and a
//! WebSocket streaming endpoint.

mod config;
mod handlers;
mod state;

use axum::{Router, routing::{get, post}};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{
    Agent, ToolRegistry,
    builtin::{calculator_tool, datetime_tool},
};

use crate::config::ServerConfig;
use crate::handlers::{chat_handler, chat_stream_handler, health_check, list_models};
use crate::state::AppState;

/// Routes and middleware over the shared state
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment first so RUST_LOG from .env applies
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let provider = config.build_provider()?;

    match provider.health_check().await {
        Ok(true) => {
            tracing::info!(provider = provider.name(), model = %config.model, "Connected to provider");
            if let Ok(models) = provider.list_models().await {
                for model in models {
                    tracing::debug!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!(provider = provider.name(), "Provider not reachable, runs will fail until it is");
        }
    }

    let mut tools = ToolRegistry::new();
    tools.register(calculator_tool())?;
    tools.register(datetime_tool())?;
    tracing::info!(tools = ?tools.names(), "Registered tools");

    let agent = Agent::builder()
        .provider(provider)
        .config(config.agent.clone())
        .tools(tools)
        .build()?;

    let app = router(AppState::new(agent));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Agent server listening on http://{}", config.bind_addr);
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/models      - List available models");
    tracing::info!("  POST /api/chat        - Run the agent");
    tracing::info!("  GET  /api/chat/stream - WebSocket streaming run");

    axum::serve(listener, app).await?;

    Ok(())
}
