pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::transport::Transport;
use crate::types::Faction;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub name: Option<String>,
    pub faction: Option<Faction>,
}

/// Display name for the connection; guests get a generated one
pub fn display_name(requested: Option<&str>) -> String {
    requested
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| name.chars().take(32).collect())
        .or_else(|| petname::petname(2, "-"))
        .unwrap_or_else(|| format!("guest-{}", ulid::Ulid::new()))
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!(
        "WebSocket connection request: name={:?}, faction={:?}",
        params.name,
        params.faction
    );

    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            true
        }
    }
}

/// Bridge one WebSocket to its own hub connection
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let name = display_name(params.name.as_deref());
    let (conn, mut inbox) = state.hub.connect(&name, params.faction).await;
    let connection_id = conn.identity().connection_id.clone();

    let welcome = ServerMessage::Welcome {
        protocol: "1.0".to_string(),
        connection_id: connection_id.clone(),
        name: name.clone(),
        server_now: chrono::Utc::now().to_rfc3339(),
    };
    if !send_json(&mut sender, &welcome).await {
        tracing::error!("Failed to send welcome message");
        conn.disconnect().await;
        return;
    }

    let idle_timeout = state.config.ws_idle_timeout;
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Hub deliveries for this connection
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else {
                    tracing::info!("Hub dropped connection {}", connection_id);
                    break;
                };
                let msg = ServerMessage::Event {
                    channel: delivery.channel,
                    payload: delivery.event,
                };
                if !send_json(&mut sender, &msg).await {
                    break;
                }
            }

            () = &mut idle => {
                tracing::info!("Closing idle WebSocket for {}", name);
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Client messages
            ws_msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message from {}: {}", name, text);

                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => handlers::handle_message(client_msg, &conn, &state).await,
                            Err(e) => {
                                tracing::error!("Failed to parse client message: {}", e);
                                Some(ServerMessage::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid message format: {}", e),
                                })
                            }
                        };
                        if let Some(reply) = reply {
                            if !send_json(&mut sender, &reply).await {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    conn.disconnect().await;
    tracing::info!("WebSocket connection closed for {}", name);
}
