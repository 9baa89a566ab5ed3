//! HTTP API endpoints.
//!
//! Channel authorization, session bookkeeping, scoring, persona matching and
//! streamed AI chat. Errors are JSON `{"error": ...}` bodies.

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::llm::{list_local_models, LlmConfig};
use crate::opponent::Persona;
use crate::protocol::{ChannelKind, LOBBY_CHANNEL};
use crate::relay::{stream_reply, ChatPayload, ChatSettings, RelayUpdate};
use crate::state::AppState;
use crate::types::*;

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": msg.into() });
    (status, Json(body)).into_response()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelAuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
}

/// Sign a private channel subscription for a live connection.
///
/// POST /api/channel-auth
pub async fn channel_auth(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChannelAuthRequest>,
) -> Response {
    if req.socket_id.is_empty() || req.channel_name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Missing socket_id or channel_name");
    }
    if ChannelKind::of(&req.channel_name) != Some(ChannelKind::Private) {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("{} is not a private channel", req.channel_name),
        );
    }
    let Some(identity) = state.hub.identity(&req.socket_id).await else {
        tracing::warn!("Auth request for unknown connection {}", req.socket_id);
        return error_response(StatusCode::FORBIDDEN, "Unknown connection");
    };

    tracing::info!("Authorizing {} for {}", identity.name, req.channel_name);
    Json(ChannelAuthResponse {
        auth: state.hub.authorizer().sign(&req.socket_id, &req.channel_name),
    })
    .into_response()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LobbyResponse {
    pub members: Vec<PresenceMember>,
    pub personas: Vec<Persona>,
}

/// Who is online, humans and AI personas.
///
/// GET /api/lobby
pub async fn lobby(State(state): State<Arc<AppState>>) -> Json<LobbyResponse> {
    Json(LobbyResponse {
        members: state.hub.members(LOBBY_CHANNEL).await,
        personas: state.personas().await,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Start,
    End,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub session_id: SessionId,
    pub action: SessionAction,
    /// Required for `start`; defaults to an AI opponent without model
    #[serde(default)]
    pub opponent: Option<OpponentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub ok: bool,
    pub session: SessionSummary,
}

/// Start (idempotent) or end a session.
///
/// POST /api/session
pub async fn session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SessionRequest>,
) -> Response {
    if req.session_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "session_id is required");
    }

    let session = match req.action {
        SessionAction::Start => {
            let opponent = req.opponent.unwrap_or(OpponentDescriptor {
                kind: OpponentKind::Ai,
                model_id: None,
            });
            Some(state.sessions.start(&req.session_id, &opponent).await)
        }
        SessionAction::End => state.sessions.end(&req.session_id).await,
    };

    match session {
        Some(session) => Json(SessionResponse {
            ok: true,
            session: SessionSummary {
                session_id: session.session_id,
                status: session.status,
            },
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppendMessagesRequest {
    pub session_id: SessionId,
    pub messages: Vec<Message>,
    /// Create the session with these fields if it does not exist yet
    #[serde(default)]
    pub upsert: Option<OpponentDescriptor>,
}

/// Log messages of a session.
///
/// POST /api/session/messages
pub async fn append_messages(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AppendMessagesRequest>,
) -> Response {
    match state
        .sessions
        .append_messages(&req.session_id, req.messages, req.upsert.as_ref())
        .await
    {
        Some(session) => Json(session).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Session not found"),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub session_id: SessionId,
    /// Name of the judging participant; both humans of a session guess
    #[serde(default)]
    pub player: String,
    pub player_guess: Guess,
    pub decision_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    pub is_correct: bool,
    pub score: u32,
    pub actual_opponent: OpponentKind,
    pub player_guess: Guess,
    pub message_count: usize,
    pub session_id: SessionId,
}

/// Score the player's guess.
///
/// POST /api/game/submit
pub async fn submit_guess(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    let Some(outcome) = state
        .sessions
        .submit_guess(&req.session_id, &req.player, req.player_guess, req.decision_time)
        .await
    else {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    };
    let Some(session) = state.sessions.get(&req.session_id).await else {
        return error_response(StatusCode::NOT_FOUND, "Session not found");
    };

    Json(SubmitResponse {
        success: true,
        is_correct: outcome.is_correct,
        score: outcome.score,
        actual_opponent: session.opponent_kind,
        player_guess: session
            .guess_of(&req.player)
            .map(|g| g.player_guess)
            .unwrap_or(req.player_guess),
        message_count: session.messages.len(),
        session_id: req.session_id,
    })
    .into_response()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResponse {
    pub all_characters: Vec<Persona>,
}

/// The AI personas available as opponents.
///
/// POST /api/match
pub async fn match_personas(State(state): State<Arc<AppState>>) -> Json<MatchResponse> {
    Json(MatchResponse {
        all_characters: state.personas().await,
    })
}

/// Stream an AI reply as a plain text body.
///
/// POST /api/chat
///
/// The user turn and the final reply are logged once the stream completes.
/// A failure ends the body with a `⚠️ Connection lost: ...` line after the
/// partial text.
pub async fn chat(State(state): State<Arc<AppState>>, Json(payload): Json<ChatPayload>) -> Response {
    if payload.session_id.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "session_id is required");
    }
    if state.llm.is_none() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "AI API key not configured");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let settings = ChatSettings::from(&state.llm_config);
    let task_state = state.clone();
    tokio::spawn(async move {
        let result = stream_reply(
            task_state.llm.as_deref(),
            &task_state.sessions,
            &payload,
            &settings,
            &tx,
        )
        .await;
        if let Err(e) = result {
            tracing::error!("Chat stream for {} failed: {}", payload.session_id, e);
        }
    });

    let chunks = futures::stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        let chunk = match rx.recv().await? {
            RelayUpdate::Partial { delta, .. } => return Some((Ok(delta), Some(rx))),
            RelayUpdate::Complete { .. } => return None,
            // Terminal error line after whatever text made it out
            RelayUpdate::Failed { partial, error, .. } => match partial {
                Some(_) => format!("\n{}", error.content),
                None => error.content,
            },
        };
        Some((Ok::<_, std::convert::Infallible>(chunk), None))
    });

    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response()
}

/// Information about a single model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// `provider:model`
    pub id: String,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModelsResponse {
    pub models: Vec<ModelInfo>,
    pub default_model: Option<String>,
}

fn model_info(id: String) -> ModelInfo {
    let name = id.split_once(':').map(|(_, m)| m).unwrap_or(&id).to_string();
    ModelInfo {
        display_name: crate::opponent::model_display_name(&id),
        name,
        id,
    }
}

/// List available AI models.
///
/// GET /api/models
///
/// The configured model of every provider, plus whatever a local Ollama has pulled.
pub async fn list_available_models(
    State(state): State<Arc<AppState>>,
) -> Json<AvailableModelsResponse> {
    let mut ids: Vec<String> = state
        .llm
        .as_ref()
        .map(|llm| llm.model_ids())
        .unwrap_or_default();

    if let Some(base_url) = &state.llm_config.ollama_base_url {
        match list_local_models(base_url).await {
            Ok(models) => ids.extend(models.into_iter().map(|m| format!("ollama:{}", m))),
            Err(e) => tracing::warn!("Failed to list Ollama models: {}", e),
        }
    }
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));

    Json(AvailableModelsResponse {
        default_model: determine_default_model(&state.llm_config),
        models: ids.into_iter().map(model_info).collect(),
    })
}

/// Determine the default model based on configuration
fn determine_default_model(config: &LlmConfig) -> Option<String> {
    if config.openai_api_key.is_some() {
        return Some(format!("openai:{}", config.openai_model));
    }
    if config.ollama_base_url.is_some() {
        return Some(format!("ollama:{}", config.ollama_model));
    }
    None
}
