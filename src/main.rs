use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turinglobby::{
    auth::ChannelAuthorizer,
    llm,
    state::{AppState, ServerConfig},
    types::GameRules,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turinglobby=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting turinglobby...");

    let config = ServerConfig::from_env();
    let rules = GameRules::from_env();
    let authorizer = ChannelAuthorizer::from_env();

    let sessions = match config.open_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            tracing::error!("Failed to open session store: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize LLM providers
    let llm_config = llm::LlmConfig::from_env();
    let llm_manager = match llm_config.build_manager() {
        Ok(manager) => {
            tracing::info!(
                "LLM providers initialized: {}",
                manager.model_ids().join(", ")
            );
            Some(manager)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to initialize LLM providers: {}. Falling back to fixed personas without replies.",
                e
            );
            None
        }
    };

    let addr = config.bind_addr;
    let state = Arc::new(
        AppState::new(authorizer, sessions)
            .with_llm(llm_manager, llm_config)
            .with_rules(rules)
            .with_config(config),
    );
    let app = turinglobby::app(state);

    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
