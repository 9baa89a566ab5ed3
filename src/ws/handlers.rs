//! WebSocket message dispatch
//!
//! Translates bridge commands into hub operations on the socket's own
//! connection and reports the result as a single reply.

use crate::protocol::{ChannelEvent, ClientMessage, ServerMessage};
use crate::state::AppState;
use crate::transport::{HubConnection, Transport, TransportError};
use std::sync::Arc;

fn error(code: &str, msg: impl Into<String>) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        msg: msg.into(),
    }
}

fn transport_error(e: TransportError) -> ServerMessage {
    let code = match &e {
        TransportError::NotConnected(_) => "NOT_CONNECTED",
        TransportError::UnknownChannel(_) => "UNKNOWN_CHANNEL",
        TransportError::AuthRejected { .. } => "AUTH_REJECTED",
        TransportError::NotSubscribed(_) => "NOT_SUBSCRIBED",
        TransportError::EventNotAllowed { .. } => "EVENT_NOT_ALLOWED",
        TransportError::SenderMismatch { .. } => "SENDER_MISMATCH",
        TransportError::Closed => "CLOSED",
    };
    error(code, e.to_string())
}

/// Handle one client message and return the reply, if any
pub async fn handle_message(
    msg: ClientMessage,
    conn: &HubConnection,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        ClientMessage::Subscribe { channel, auth } => {
            match conn.subscribe(&channel, auth).await {
                Ok(()) => Some(ServerMessage::Subscribed { channel }),
                Err(e) => {
                    tracing::warn!(
                        "Subscribe of {} to {} failed: {}",
                        conn.identity().name,
                        channel,
                        e
                    );
                    Some(transport_error(e))
                }
            }
        }

        ClientMessage::Unsubscribe { channel } => match conn.unsubscribe(&channel).await {
            Ok(()) => Some(ServerMessage::Unsubscribed { channel }),
            Err(e) => Some(transport_error(e)),
        },

        ClientMessage::Publish {
            channel,
            event,
            data,
        } => {
            let event = match ChannelEvent::parse(&event, data) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Discarding event from {}: {}", conn.identity().name, e);
                    return Some(error("INVALID_EVENT", e.to_string()));
                }
            };
            let name = event.name().to_string();
            let retired = match &event {
                ChannelEvent::AiLeft { ai_id, .. } => Some(ai_id.clone()),
                _ => None,
            };

            if let Err(e) = conn.publish(&channel, event).await {
                tracing::error!("Publish of {} on {} failed: {}", name, channel, e);
                return Some(transport_error(e));
            }
            if let Some(ai_id) = retired {
                state.retire_persona(&ai_id).await;
            }
            Some(ServerMessage::Published {
                channel,
                event: name,
            })
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
