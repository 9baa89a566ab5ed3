use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Duration as ChronoDuration;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use turinglobby::auth::ChannelAuthorizer;
use turinglobby::client::{ClientEvent, GameClient};
use turinglobby::invite::InviteOutcome;
use turinglobby::llm::{
    GenerateRequest, GenerateResponse, LlmConfig, LlmManager, LlmProvider, LlmResult,
    ResponseMetadata, TextStream,
};
use turinglobby::opponent::fallback_personas;
use turinglobby::protocol::session_channel;
use turinglobby::session::SessionRegistry;
use turinglobby::state::AppState;
use turinglobby::transport::{Hub, Transport};
use turinglobby::types::*;

async fn player(hub: &Hub, name: &str, sessions: &SessionRegistry) -> GameClient {
    let (conn, inbox) = hub.connect(name, None).await;
    let mut client = GameClient::new(
        Arc::new(conn),
        inbox,
        sessions.clone(),
        GameRules::default(),
    )
    .with_personas(fallback_personas());
    client.enter_lobby().await.expect("lobby join");
    client
}

fn started(events: &[ClientEvent]) -> Option<SessionId> {
    events.iter().find_map(|e| match e {
        ClientEvent::SessionStarted { session_id, .. } => Some(session_id.clone()),
        _ => None,
    })
}

/// Invite, accept, converse and judge between two humans while a bystander watches
#[tokio::test]
async fn test_human_match_flow() {
    let hub = Hub::new(ChannelAuthorizer::new("secret"));
    let sessions = SessionRegistry::in_memory();
    let mut alice = player(&hub, "alice", &sessions).await;
    let mut bob = player(&hub, "bob", &sessions).await;
    let mut carol = player(&hub, "carol", &sessions).await;
    for client in [&mut alice, &mut bob, &mut carol] {
        client.pump().await.unwrap();
    }
    assert_eq!(carol.lobby().len(), 2);

    // 1. Alice invites Bob
    let invite = alice.invite("bob").await.unwrap();
    let session_id = invite.session_id.clone();
    assert_eq!(alice.invites().waiting(), Some(&invite));

    let events = bob.pump().await.unwrap();
    assert!(matches!(
        events.as_slice(),
        [ClientEvent::Invite(InviteOutcome::Presented(i))] if i.session_id == session_id
    ));

    // 2. Bob accepts and is in the session right away
    let events = bob.accept(&session_id).await.unwrap();
    assert_eq!(started(&events).as_deref(), Some(session_id.as_str()));

    // 3. Alice learns about the accept and joins the same session
    let events = alice.pump().await.unwrap();
    assert_eq!(started(&events).as_deref(), Some(session_id.as_str()));
    assert!(alice.invites().waiting().is_none());

    // 4. Carol saw both broadcasts but has no session
    let events = carol.pump().await.unwrap();
    assert!(events.is_empty());
    assert!(carol.active().is_none());
    assert!(carol.invites().pending_invites().is_empty());

    let session = sessions.get(&session_id).await.unwrap();
    assert_eq!(session.opponent_kind, OpponentKind::Human);
    assert_eq!(session.status, SessionStatus::Active);

    // 5. Bob talks until Alice has seen five messages from him
    for i in 0..5 {
        bob.send(&format!("message {}", i)).await.unwrap();
    }
    let events = alice.pump().await.unwrap();
    let messages = events
        .iter()
        .filter(|e| matches!(e, ClientEvent::Message { .. }))
        .count();
    assert_eq!(messages, 5);
    assert!(events.contains(&ClientEvent::PhaseChanged {
        session_id: session_id.clone(),
        phase: Phase::Judging,
    }));
    assert_eq!(alice.phase(), Some(Phase::Judging));

    // 6. Bob follows through the phase signal, not his own count
    assert_eq!(bob.active().unwrap().judgment.opponent_messages(), 0);
    let events = bob.pump().await.unwrap();
    assert!(events.contains(&ClientEvent::PhaseChanged {
        session_id: session_id.clone(),
        phase: Phase::Judging,
    }));
    assert_eq!(bob.phase(), Some(Phase::Judging));
    assert!(bob.send("too late").await.is_err());

    // 7. Both judge independently, each scored on their own guess
    let alice_result = alice.submit_guess(OpponentKind::Human).await.unwrap();
    assert!(alice_result.is_correct);
    assert_eq!(alice.phase(), Some(Phase::Outcome));

    let bob_result = bob.submit_guess(OpponentKind::Ai).await.unwrap();
    assert!(!bob_result.is_correct);
    assert_eq!(bob_result.score, 0);
    assert_eq!(bob.phase(), Some(Phase::Outcome));

    let logged = sessions.get(&session_id).await.unwrap();
    assert_eq!(logged.messages.len(), 5);
    assert_eq!(logged.guesses.len(), 2);
    assert_eq!(
        logged.guess_of("alice").unwrap().player_guess,
        OpponentKind::Human
    );

    alice.reset().await.unwrap();
    assert!(alice.active().is_none());
    assert_eq!(
        sessions.get(&session_id).await.unwrap().status,
        SessionStatus::Closed
    );
}

#[tokio::test]
async fn test_rejected_and_late_accepts() {
    let hub = Hub::new(ChannelAuthorizer::new("secret"));
    let sessions = SessionRegistry::in_memory();
    let mut alice = player(&hub, "alice", &sessions).await;
    let mut bob = player(&hub, "bob", &sessions).await;
    alice.pump().await.unwrap();
    bob.pump().await.unwrap();

    // Rejection clears the inviter's waiting state
    let invite = alice.invite("bob").await.unwrap();
    bob.pump().await.unwrap();
    bob.reject(&invite.session_id).await.unwrap();
    let events = alice.pump().await.unwrap();
    assert!(matches!(
        events.as_slice(),
        [ClientEvent::Invite(InviteOutcome::Rejected { by, .. })] if by == "bob"
    ));
    assert!(alice.invites().waiting().is_none());

    // An accept after cancelling is ignored
    let invite = alice.invite("bob").await.unwrap();
    bob.pump().await.unwrap();
    assert!(alice.cancel_invite().is_some());
    bob.accept(&invite.session_id).await.unwrap();
    let events = alice.pump().await.unwrap();
    assert!(events.is_empty());
    assert!(alice.active().is_none());
}

#[tokio::test]
async fn test_second_invite_while_waiting_is_refused() {
    let hub = Hub::new(ChannelAuthorizer::new("secret"));
    let sessions = SessionRegistry::in_memory();
    let mut alice = player(&hub, "alice", &sessions).await;
    let _bob = player(&hub, "bob", &sessions).await;
    let _carol = player(&hub, "carol", &sessions).await;

    alice.invite("bob").await.unwrap();
    assert!(alice.invite("carol").await.is_err());
    assert!(alice.invite("alice").await.is_err());
}

#[tokio::test]
async fn test_disconnect_leaves_lobby() {
    let hub = Hub::new(ChannelAuthorizer::new("secret"));
    let sessions = SessionRegistry::in_memory();
    let mut alice = player(&hub, "alice", &sessions).await;
    let mut bob = player(&hub, "bob", &sessions).await;
    alice.pump().await.unwrap();
    assert_eq!(alice.lobby().len(), 1);

    bob.disconnect().await;
    let events = alice.pump().await.unwrap();
    assert!(events.contains(&ClientEvent::LobbyChanged(Vec::new())));
    assert!(alice.lobby().is_empty());
}

#[test]
fn test_persona_model_id_survives_display_round_trip() {
    let persona = fallback_personas().remove(1);
    let shown: turinglobby::opponent::Persona =
        serde_json::from_str(&serde_json::to_string(&persona).unwrap()).unwrap();

    let payload = turinglobby::relay::ChatPayload::new(
        "ai_x",
        &shown,
        vec![Message::user("alice", "hi")],
    );
    assert_eq!(payload.model_id, persona.model_id);
    assert_eq!(payload.model_id, "openai:deepseek-ai/DeepSeek-R1-0528");

    let wire = serde_json::to_value(&payload).unwrap();
    assert_eq!(wire["model_id"], "openai:deepseek-ai/DeepSeek-R1-0528");
}

// HTTP API

struct EchoProvider;

#[async_trait]
impl LlmProvider for EchoProvider {
    async fn generate(&self, request: GenerateRequest) -> LlmResult<GenerateResponse> {
        let last = request
            .history
            .last()
            .map(|t| t.content.clone())
            .unwrap_or_default();
        Ok(GenerateResponse {
            text: format!("you said: {}", last),
            metadata: ResponseMetadata {
                provider: "openai".to_string(),
                model: request.model_override.unwrap_or_default(),
                tokens_used: None,
                latency_ms: 0,
            },
        })
    }

    async fn stream(&self, request: GenerateRequest) -> LlmResult<TextStream> {
        let text = self.generate(request).await?.text;
        let words: Vec<LlmResult<String>> = text
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(futures::stream::iter(words).boxed())
    }

    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> &str {
        "gpt-4o-mini"
    }
}

async fn app_state(with_llm: bool) -> Arc<AppState> {
    let llm = with_llm.then(|| LlmManager::new(vec![Box::new(EchoProvider)]));
    let state = AppState::new(ChannelAuthorizer::new("secret"), SessionRegistry::in_memory())
        .with_llm(
            llm,
            LlmConfig {
                ollama_base_url: None,
                ..LlmConfig::default()
            },
        );
    state.set_personas(fallback_personas()).await;
    Arc::new(state)
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_session_scoring_over_http() {
    let state = app_state(false).await;
    let app = turinglobby::app(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/session",
            serde_json::json!({
                "session_id": "ai_1",
                "action": "start",
                "opponent": { "type": "AI", "model_id": "openai:gpt-4o-mini" }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["session"]["status"], "active");

    let start = state.sessions.get("ai_1").await.unwrap().start_time;
    let messages: Vec<Message> = vec![
        Message::assistant("Mika", "hi"),
        Message::user("alice", "hello"),
        Message::assistant("Mika", "how are you?"),
    ];
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/session/messages",
            serde_json::json!({ "session_id": "ai_1", "messages": messages }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let decision_time = start + ChronoDuration::seconds(10);
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/game/submit",
            serde_json::json!({
                "session_id": "ai_1",
                "player_guess": "AI",
                "decision_time": decision_time,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["is_correct"], true);
    assert_eq!(body["score"], 158);
    assert_eq!(body["message_count"], 3);
    assert_eq!(body["actual_opponent"], "AI");

    // Unknown sessions are 404
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/session",
            serde_json::json!({ "session_id": "nope", "action": "end" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(post_json(
            "/api/session",
            serde_json::json!({ "session_id": "ai_1", "action": "end" }),
        ))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["session"]["status"], "closed");
}

#[tokio::test]
async fn test_channel_auth_over_http() {
    let state = app_state(false).await;
    let app = turinglobby::app(state.clone());
    let (conn, _inbox) = state.hub.connect("alice", None).await;
    let channel = session_channel("match_1");

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/channel-auth",
            serde_json::json!({ "socket_id": "ghost", "channel_name": channel }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(post_json(
            "/api/channel-auth",
            serde_json::json!({
                "socket_id": conn.identity().connection_id,
                "channel_name": channel,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let auth = json_body(response).await["auth"]
        .as_str()
        .unwrap()
        .to_string();
    conn.subscribe(&channel, Some(auth)).await.unwrap();
}

#[tokio::test]
async fn test_match_and_lobby_list_personas() {
    let state = app_state(false).await;
    let app = turinglobby::app(state);

    let response = app
        .clone()
        .oneshot(post_json("/api/match", serde_json::json!({})))
        .await
        .unwrap();
    let body = json_body(response).await;
    let characters = body["all_characters"].as_array().unwrap();
    assert_eq!(characters.len(), 2);
    assert_eq!(characters[0]["model_id"], "openai:Qwen/Qwen2.5-7B-Instruct");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/lobby")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["personas"].as_array().unwrap().len(), 2);
    assert!(body["members"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_chat_streams_and_logs() {
    let state = app_state(true).await;
    let app = turinglobby::app(state.clone());

    let response = app
        .oneshot(post_json(
            "/api/chat",
            serde_json::json!({
                "session_id": "ai_chat",
                "model_id": "openai:gpt-4o-mini",
                "persona_name": "Mika",
                "system_prompt": "You are Mika.",
                "messages": [Message::user("alice", "hello there")],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&bytes), "you said: hello there");

    // Logging happens after the last chunk went out
    let mut logged = None;
    for _ in 0..50 {
        logged = state.sessions.get("ai_chat").await;
        if logged.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let logged = logged.expect("chat should be logged");
    assert_eq!(logged.opponent_kind, OpponentKind::Ai);
    assert_eq!(logged.model_id.as_deref(), Some("openai:gpt-4o-mini"));
    assert_eq!(logged.messages.len(), 2);
}

#[tokio::test]
async fn test_chat_without_llm_is_unavailable() {
    let app = turinglobby::app(app_state(false).await);
    let response = app
        .oneshot(post_json(
            "/api/chat",
            serde_json::json!({
                "session_id": "ai_chat",
                "model_id": "openai:gpt-4o-mini",
                "messages": [],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
