//! Realtime lobby, matchmaking and session coordination for the Turing test game.

pub mod api;
pub mod auth;
pub mod client;
pub mod invite;
pub mod judgment;
pub mod llm;
pub mod opponent;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;
pub mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// The full HTTP + WebSocket application
pub fn app(state: Arc<state::AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/channel-auth", post(api::channel_auth))
        .route("/api/lobby", get(api::lobby))
        .route("/api/session", post(api::session))
        .route("/api/session/messages", post(api::append_messages))
        .route("/api/game/submit", post(api::submit_guess))
        .route("/api/match", post(api::match_personas))
        .route("/api/chat", post(api::chat))
        .route("/api/models", get(api::list_available_models))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
