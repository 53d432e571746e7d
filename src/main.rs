//! Multi-session LLM agent orchestrator.
//!
//! A Rust backend driving a pure conversation state machine against
//! real LLM providers, tool dispatch, and a persistent shell, exposed
//! over an HTTP/SSE API.

mod api;
mod config;
mod context;
mod events;
mod llm;
mod message;
mod runtime;
mod session;
mod shell;
mod state_machine;
mod store;
mod system_prompt;
mod tools;
mod workspace;

use api::{create_router, AppState};
use config::Config;
use llm::ModelRegistry;
use session::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use store::SessionStore;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_orchestrator=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    tracing::info!(path = %config.data_dir.display(), "using session data directory");
    std::fs::create_dir_all(config.data_dir.join("sessions"))?;

    let llm_registry = Arc::new(ModelRegistry::new(&config.llm_config()));
    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "LLM registry initialized"
        );
    } else {
        tracing::warn!("no LLM API keys configured; set ANTHROPIC_API_KEY or LLM_GATEWAY");
    }

    let store = SessionStore::new(&config.data_dir);
    let sessions = Arc::new(SessionManager::new(
        store,
        llm_registry.clone(),
        config.shell_prompt_prefix.clone(),
        config.context_window,
    ));

    let state = AppState::new(sessions, llm_registry);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("orchestrator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
