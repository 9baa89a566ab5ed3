//! Message Relay: session-scoped delivery and streamed AI replies.

use crate::llm::{ChatTurn, GenerateRequest, LlmConfig, LlmError, LlmManager};
use crate::opponent::Persona;
use crate::protocol::{session_channel, session_id_from_channel, ChannelEvent, Delivery};
use crate::session::SessionRegistry;
use crate::transport::{Transport, TransportError, TransportResult};
use crate::types::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Publish failed: {0}")]
    Transport(#[from] TransportError),
    #[error("No text generation configured")]
    NoGenerator,
    #[error("Generation failed after {} chars: {source}", partial.len())]
    Generation {
        partial: String,
        #[source]
        source: LlmError,
    },
}

/// Progress of one streamed AI reply
#[derive(Debug, Clone, PartialEq)]
pub enum RelayUpdate {
    /// New text arrived; `text` is everything so far
    Partial {
        session_id: SessionId,
        delta: String,
        text: String,
    },
    Complete {
        session_id: SessionId,
        message: Message,
    },
    /// Generation broke off; the partial text stays visible
    Failed {
        session_id: SessionId,
        partial: Option<Message>,
        error: Message,
    },
}

/// Everything the text generator needs for one AI turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatPayload {
    pub session_id: SessionId,
    /// `provider:model` of the bound persona
    pub model_id: String,
    #[serde(default)]
    pub persona_name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Conversation so far, oldest first, ending with the user's new message
    pub messages: Vec<Message>,
}

impl ChatPayload {
    pub fn new(session_id: &str, persona: &Persona, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.to_string(),
            model_id: persona.model_id.clone(),
            persona_name: persona.name.clone(),
            system_prompt: persona.system_prompt.clone(),
            messages,
        }
    }

    /// The newest user-authored message
    pub fn user_turn(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
    }
}

/// Sampling settings for chat replies
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl From<&LlmConfig> for ChatSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            temperature: config.default_temperature,
            max_tokens: config.default_max_tokens,
            timeout: config.default_timeout,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

fn error_message(sender: &str, error: &dyn std::fmt::Display) -> Message {
    Message::assistant(sender, format!("⚠️ Connection lost: {}", error))
}

/// Stream one AI reply for `payload`, reporting progress on `updates`.
///
/// The user turn and the final assistant text are logged together, creating
/// the session if needed. Partial chunks are never logged, not even when the
/// stream breaks off. Every chunk must arrive within `settings.timeout`.
pub async fn stream_reply(
    llm: Option<&LlmManager>,
    sessions: &SessionRegistry,
    payload: &ChatPayload,
    settings: &ChatSettings,
    updates: &mpsc::UnboundedSender<RelayUpdate>,
) -> Result<Message, RelayError> {
    let session_id = payload.session_id.clone();
    let descriptor = OpponentDescriptor::ai(payload.model_id.clone());
    let user_turn: Vec<Message> = payload.user_turn().cloned().into_iter().collect();

    let Some(llm) = llm else {
        let error = error_message(&payload.persona_name, &RelayError::NoGenerator);
        sessions
            .append_messages(&session_id, user_turn, Some(&descriptor))
            .await;
        let _ = updates.send(RelayUpdate::Failed {
            session_id,
            partial: None,
            error,
        });
        return Err(RelayError::NoGenerator);
    };

    let history = payload
        .messages
        .iter()
        .map(|m| ChatTurn {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    let request = GenerateRequest {
        system_prompt: Some(payload.system_prompt.clone()),
        history,
        temperature: Some(settings.temperature),
        max_tokens: Some(settings.max_tokens),
        timeout: settings.timeout,
        model_override: None,
    };

    let mut text = String::new();
    let failure = match llm.stream_from_model(&payload.model_id, request).await {
        Ok(mut stream) => {
            let mut failure = None;
            loop {
                let chunk = match tokio::time::timeout(settings.timeout, stream.next()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) => Err(LlmError::Timeout(settings.timeout)),
                };
                match chunk {
                    Ok(delta) => {
                        text.push_str(&delta);
                        let _ = updates.send(RelayUpdate::Partial {
                            session_id: session_id.clone(),
                            delta,
                            text: text.clone(),
                        });
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            failure
        }
        Err(e) => Some(e),
    };

    if let Some(source) = failure {
        tracing::error!(
            "Reply for session {} failed after {} chars: {}",
            session_id,
            text.len(),
            source
        );
        let partial = (!text.is_empty()).then(|| Message::assistant(&payload.persona_name, &text));
        // Only finished replies are logged
        sessions
            .append_messages(&session_id, user_turn, Some(&descriptor))
            .await;
        let _ = updates.send(RelayUpdate::Failed {
            session_id,
            partial,
            error: error_message(&payload.persona_name, &source),
        });
        return Err(RelayError::Generation {
            partial: text,
            source,
        });
    }

    let message = Message::assistant(&payload.persona_name, text.trim());
    let mut logged = user_turn;
    logged.push(message.clone());
    sessions
        .append_messages(&session_id, logged, Some(&descriptor))
        .await;
    tracing::debug!(
        "Reply for session {} complete ({} chars)",
        session_id,
        message.content.len()
    );
    let _ = updates.send(RelayUpdate::Complete {
        session_id,
        message: message.clone(),
    });
    Ok(message)
}

/// Relay for one client connection
pub struct MessageRelay {
    transport: Arc<dyn Transport>,
    sessions: SessionRegistry,
    llm: Option<Arc<LlmManager>>,
    settings: ChatSettings,
}

impl MessageRelay {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: SessionRegistry,
        llm: Option<Arc<LlmManager>>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            transport,
            sessions,
            llm,
            settings,
        }
    }

    fn self_name(&self) -> &str {
        &self.transport.identity().name
    }

    /// Join the private channel of a human session
    pub async fn subscribe(&self, session_id: &str) -> TransportResult<()> {
        let channel = session_channel(session_id);
        let auth = self.transport.authorize(&channel).await?;
        self.transport.subscribe(&channel, Some(auth)).await
    }

    pub async fn unsubscribe(&self, session_id: &str) -> TransportResult<()> {
        self.transport.unsubscribe(&session_channel(session_id)).await
    }

    /// Publish a message in a human session; the caller keeps its own copy.
    pub async fn send_human(&self, session_id: &str, content: &str) -> Result<Message, RelayError> {
        let message = Message::user(self.self_name(), content);
        if let Err(e) = self
            .transport
            .publish(&session_channel(session_id), ChannelEvent::from_message(&message))
            .await
        {
            tracing::error!("Failed to relay message in {}: {}", session_id, e);
            return Err(e.into());
        }
        self.sessions
            .append_messages(session_id, vec![message.clone()], None)
            .await;
        Ok(message)
    }

    /// Build the generation payload for an AI turn
    pub fn chat_payload(
        &self,
        session_id: &str,
        persona: &Persona,
        transcript: &[Message],
        content: &str,
    ) -> ChatPayload {
        let mut messages = transcript.to_vec();
        messages.push(Message::user(self.self_name(), content));
        ChatPayload::new(session_id, persona, messages)
    }

    /// Send a message to an AI persona and stream its reply
    pub async fn send_ai(
        &self,
        payload: &ChatPayload,
        updates: &mpsc::UnboundedSender<RelayUpdate>,
    ) -> Result<Message, RelayError> {
        stream_reply(
            self.llm.as_deref(),
            &self.sessions,
            payload,
            &self.settings,
            updates,
        )
        .await
    }

    /// A session message from someone else; own echoes are dropped
    pub fn filter_incoming(&self, delivery: &Delivery) -> Option<(SessionId, Message)> {
        let session_id = session_id_from_channel(&delivery.channel)?;
        match &delivery.event {
            ChannelEvent::NewMessage {
                sender,
                content,
                role,
                timestamp,
            } if sender != self.self_name() => Some((
                session_id.to_string(),
                Message {
                    sender: sender.clone(),
                    content: content.clone(),
                    role: *role,
                    timestamp: *timestamp,
                },
            )),
            _ => None,
        }
    }
}
